//! Width-parameterized binary primitives shared by every region of the
//! XDA file. All multi-byte integers are little-endian; pointer fields
//! are exactly `bitsParam` bytes wide.

use crate::error::{Result, XdaError};
use std::io::{Read, Write};

/// On-disk length of a nameValue key
pub const NAME_VALUE_LENGTH: usize = 16;

/// Copy buffer size for streaming transfers
pub const BUFFER_SIZE: usize = 65536;

/// File-wide byte width used for every pointer field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitsParam {
    Two = 2,
    Four = 4,
    Eight = 8,
}

impl BitsParam {
    /// Decode the header byte. 0x00 is normalized to the 2-byte width.
    pub fn from_raw(value: u8) -> Result<Self> {
        match value {
            0x00 | 0x02 => Ok(Self::Two),
            0x04 => Ok(Self::Four),
            0x08 => Ok(Self::Eight),
            other => Err(XdaError::InvalidBitsParam(other)),
        }
    }

    /// Width in bytes of one pointer field
    pub fn width(self) -> usize {
        self as usize
    }

    /// Read one pointer field of this width
    pub fn read_from<R: Read>(self, mut reader: R) -> Result<u64> {
        Ok(match self {
            Self::Two => read_u16(&mut reader)? as u64,
            Self::Four => read_u32(&mut reader)? as u64,
            Self::Eight => read_u64(&mut reader)?,
        })
    }

    /// Read one pointer field, sign-extending from this width.
    ///
    /// Used for `firstEntryOffset`, whose all-ones pattern means "no
    /// entry yet" and must read back as -1 at any width.
    pub fn read_signed_from<R: Read>(self, mut reader: R) -> Result<i64> {
        Ok(match self {
            Self::Two => read_u16(&mut reader)? as i16 as i64,
            Self::Four => read_u32(&mut reader)? as i32 as i64,
            Self::Eight => read_u64(&mut reader)? as i64,
        })
    }

    /// Largest value one pointer field of this width can hold
    pub fn max_value(self) -> u64 {
        match self {
            Self::Eight => u64::MAX,
            _ => (1u64 << (self.width() * 8)) - 1,
        }
    }

    /// Write `value` as `width()` little-endian bytes.
    ///
    /// A value that does not fit the width is an error, never a silent
    /// truncation: a wrapped pointer or length field would produce an
    /// unparseable file.
    pub fn write_to<W: Write>(self, mut writer: W, value: u64) -> Result<()> {
        if value > self.max_value() {
            return Err(XdaError::ValueOutOfRange {
                value,
                width: self.width(),
            });
        }
        let bytes = value.to_le_bytes();
        writer.write_all(&bytes[..self.width()])?;
        Ok(())
    }

    /// Write a sign-extended pointer field.
    ///
    /// Only -1 (the "no entry yet" marker, stored as all ones) and
    /// non-negative values that keep the sign bit clear are
    /// representable; anything else would read back as a different
    /// number through [`BitsParam::read_signed_from`].
    pub fn write_signed_to<W: Write>(self, mut writer: W, value: i64) -> Result<()> {
        if value == -1 {
            writer.write_all(&[0xffu8; 8][..self.width()])?;
            return Ok(());
        }
        if value < 0 || value as u64 > self.max_value() >> 1 {
            return Err(XdaError::ValueOutOfRange {
                value: value as u64,
                width: self.width(),
            });
        }
        self.write_to(writer, value as u64)
    }
}

pub fn read_u16<R: Read>(mut reader: R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32<R: Read>(mut reader: R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64<R: Read>(mut reader: R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u32<W: Write>(mut writer: W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// A 16-byte NameTable/ItemList join key, compared as opaque bytes.
///
/// The writer encodes a small sequential counter as its 4 big-endian
/// bytes followed by 12 zero bytes; the key is local to one entry and
/// carries no persistent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameValue([u8; NAME_VALUE_LENGTH]);

impl NameValue {
    /// Encode the per-save sequential counter
    pub fn from_ordinal(ordinal: u32) -> Self {
        let mut bytes = [0u8; NAME_VALUE_LENGTH];
        bytes[..4].copy_from_slice(&ordinal.to_be_bytes());
        Self(bytes)
    }

    /// The ItemList terminator key: 0x7f followed by fifteen 0xff
    pub fn sentinel() -> Self {
        let mut bytes = [0xffu8; NAME_VALUE_LENGTH];
        bytes[0] = 0x7f;
        Self(bytes)
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::sentinel()
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut bytes = [0u8; NAME_VALUE_LENGTH];
        reader.read_exact(&mut bytes)?;
        Ok(Self(bytes))
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.0)?;
        Ok(())
    }
}

/// Read a NUL-terminated UTF-8 string, failing if no terminator shows
/// up within `max_len` bytes.
pub fn read_cstr<R: Read>(mut reader: R, max_len: usize) -> Result<String> {
    let mut bytes = Vec::new();
    let mut one = [0u8; 1];
    for _ in 0..max_len {
        reader.read_exact(&mut one)?;
        if one[0] == 0 {
            return String::from_utf8(bytes)
                .map_err(|e| XdaError::InvalidNameTable(format!("invalid UTF-8 in path: {}", e)));
        }
        bytes.push(one[0]);
    }
    Err(XdaError::InvalidNameTable(format!(
        "unterminated path string (no NUL within {} bytes)",
        max_len
    )))
}

/// Read bytes up to and including `flag`, failing if the flag does not
/// appear within `capacity` bytes. The flag byte is kept in the result.
pub fn read_until_flag<R: Read>(mut reader: R, capacity: usize, flag: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(capacity);
    let mut one = [0u8; 1];
    for _ in 0..capacity {
        reader.read_exact(&mut one)?;
        bytes.push(one[0]);
        if one[0] == flag {
            return Ok(bytes);
        }
    }
    Err(XdaError::UnterminatedEcs)
}

/// XOR fold over a byte slice (the 1-byte BitStream checksum)
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Writer adapter folding an XOR checksum over everything written
pub struct XorWriter<W> {
    inner: W,
    pub checksum: u8,
    pub written: u64,
}

impl<W: Write> XorWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            checksum: 0,
            written: 0,
        }
    }
}

impl<W: Write> Write for XorWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.checksum ^= xor_checksum(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Copy exactly `length` bytes; a short source is a decode failure,
/// never a silent zero-fill.
pub fn copy_exact<R: Read, W: Write>(src: &mut R, dst: &mut W, length: u64) -> Result<u64> {
    let mut remaining = length;
    let mut buf = vec![0u8; BUFFER_SIZE];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let got = src.read(&mut buf[..want])?;
        if got == 0 {
            return Err(XdaError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read: {} bytes still expected", remaining),
            )));
        }
        dst.write_all(&buf[..got])?;
        remaining -= got as u64;
    }
    Ok(length)
}

/// Copy until the source is exhausted, returning the byte count
pub fn copy_all<R: Read, W: Write>(src: &mut R, dst: &mut W) -> Result<u64> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let got = src.read(&mut buf)?;
        if got == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..got])?;
        total += got as u64;
    }
}
