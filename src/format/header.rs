use crate::error::{Result, XdaError};
use crate::format::codec::{self, BitsParam};
use std::io::{Read, Seek, SeekFrom, Write};

/// File signature: `@XDA` plus ten zero bytes. Only the first four
/// bytes are compared when parsing.
pub const SIGNATURE: [u8; 14] = [b'@', b'X', b'D', b'A', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

const SIGNATURE_CHECK_LEN: usize = 4;

/// Fixed offset of the entryCount field (signature + two version bytes)
pub const ENTRY_COUNT_OFFSET: u64 = SIGNATURE.len() as u64 + 2;

/// Fixed offset of the firstEntryOffset field
pub const FIRST_ENTRY_OFFSET_FIELD: u64 = ENTRY_COUNT_OFFSET + 4 + 2;

/// The fixed file preamble.
///
/// Written in full exactly once, on the first commit; later commits
/// only patch `entryCount` and (for the very first entry)
/// `firstEntryOffset` in place.
#[derive(Debug, Clone)]
pub struct Header {
    major_version: u8,
    minor_version: u8,
    entry_count: u32,
    name_table_type: u8,
    bits_param: BitsParam,
    first_entry_offset: i64,
}

impl Header {
    /// Initialize a fresh header for a new document
    pub fn create(
        major_version: u8,
        minor_version: u8,
        name_table_type: u8,
        bits_param: u8,
    ) -> Result<Self> {
        validate_name_table_type(name_table_type)?;
        Ok(Self {
            major_version,
            minor_version,
            entry_count: 0,
            name_table_type,
            bits_param: BitsParam::from_raw(bits_param)?,
            first_entry_offset: -1,
        })
    }

    /// Parse the preamble from the start of the file
    pub fn parse<F: Read + Seek>(file: &mut F) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;

        let mut signature = [0u8; SIGNATURE.len()];
        file.read_exact(&mut signature)?;
        if signature[..SIGNATURE_CHECK_LEN] != SIGNATURE[..SIGNATURE_CHECK_LEN] {
            return Err(XdaError::InvalidSignature);
        }

        let mut version = [0u8; 2];
        file.read_exact(&mut version)?;
        let entry_count = codec::read_u32(&mut *file)?;

        let mut flags = [0u8; 2];
        file.read_exact(&mut flags)?;
        let name_table_type = flags[0];
        validate_name_table_type(name_table_type)?;
        let bits_param = BitsParam::from_raw(flags[1])?;

        let first_entry_offset = bits_param.read_signed_from(&mut *file)?;

        Ok(Self {
            major_version: version[0],
            minor_version: version[1],
            entry_count,
            name_table_type,
            bits_param,
            first_entry_offset,
        })
    }

    /// Write the full header body at offset 0.
    ///
    /// Callers only do this while `entry_count == 0`; committed files
    /// are patched through [`Header::patch_entry_count`] and
    /// [`Header::patch_first_entry_offset`] instead.
    pub fn write<F: Write + Seek>(&self, file: &mut F) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&SIGNATURE)?;
        file.write_all(&[self.major_version, self.minor_version])?;
        codec::write_u32(&mut *file, self.entry_count)?;
        file.write_all(&[self.name_table_type, self.bits_param as u8])?;
        self.bits_param
            .write_signed_to(&mut *file, self.first_entry_offset)?;
        Ok(())
    }

    /// Seek-and-overwrite the entryCount field
    pub fn patch_entry_count<F: Write + Seek>(&mut self, file: &mut F, count: u32) -> Result<()> {
        self.entry_count = count;
        file.seek(SeekFrom::Start(ENTRY_COUNT_OFFSET))?;
        codec::write_u32(&mut *file, count)?;
        Ok(())
    }

    /// Seek-and-overwrite the firstEntryOffset field
    pub fn patch_first_entry_offset<F: Write + Seek>(
        &mut self,
        file: &mut F,
        offset: u64,
    ) -> Result<()> {
        file.seek(SeekFrom::Start(FIRST_ENTRY_OFFSET_FIELD))?;
        self.bits_param.write_signed_to(&mut *file, offset as i64)?;
        self.first_entry_offset = offset as i64;
        Ok(())
    }

    pub fn major_version(&self) -> u8 {
        self.major_version
    }

    pub fn minor_version(&self) -> u8 {
        self.minor_version
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    pub fn name_table_type(&self) -> u8 {
        self.name_table_type
    }

    pub fn bits_param(&self) -> BitsParam {
        self.bits_param
    }

    pub fn first_entry_offset(&self) -> i64 {
        self.first_entry_offset
    }
}

fn validate_name_table_type(value: u8) -> Result<()> {
    match value {
        0x00 | 0x08 => Ok(()),
        other => Err(XdaError::InvalidNameTableType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::create(1, 0, 0x00, 4).unwrap();
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();

        let parsed = Header::parse(&mut buf).unwrap();
        assert_eq!(parsed.major_version(), 1);
        assert_eq!(parsed.minor_version(), 0);
        assert_eq!(parsed.entry_count(), 0);
        assert_eq!(parsed.bits_param(), BitsParam::Four);
        assert_eq!(parsed.first_entry_offset(), -1);
    }

    #[test]
    fn test_header_patches() {
        let mut header = Header::create(1, 0, 0x00, 2).unwrap();
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();

        header.patch_entry_count(&mut buf, 3).unwrap();
        header.patch_first_entry_offset(&mut buf, 40).unwrap();

        let parsed = Header::parse(&mut buf).unwrap();
        assert_eq!(parsed.entry_count(), 3);
        assert_eq!(parsed.first_entry_offset(), 40);
    }

    #[test]
    fn test_invalid_signature() {
        let mut buf = Cursor::new(b"@XDB\0\0\0\0\0\0\0\0\0\0\x01\x00\0\0\0\0\0\x04\0\0\0\0".to_vec());
        assert!(matches!(
            Header::parse(&mut buf),
            Err(XdaError::InvalidSignature)
        ));
    }

    #[test]
    fn test_invalid_name_table_type() {
        assert!(matches!(
            Header::create(1, 0, 0x05, 4),
            Err(XdaError::InvalidNameTableType(0x05))
        ));
    }

    #[test]
    fn test_zero_bits_param_normalized() {
        let header = Header::create(1, 0, 0x00, 0).unwrap();
        assert_eq!(header.bits_param(), BitsParam::Two);
    }
}
