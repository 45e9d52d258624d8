//! BitStream segment codec: the raw payload region referenced by entry
//! Items, plus the ECS (Encoding/Compression Sequence) interpreter.
//!
//! Each fragment is `checksum(1B XOR) · length(width) · ECS chain
//! (0xff-terminated) · payload(length bytes)`. `length` and the XOR
//! cover the stored payload bytes, after any ECS compression.

use crate::error::{Result, XdaError};
use crate::format::codec::{self, BitsParam, XorWriter};
use bzip2::read::{BzDecoder, BzEncoder};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use std::io::{Read, Seek, SeekFrom, Write};

/// Class marker opening each BitStream segment
pub const BS_CLASS_TYPE: [u8; 4] = *b"C.BS";

/// ECS chain terminator
pub const ECS_TERMINATOR: u8 = 0xff;

/// Longest encoded ECS chain, terminator included
pub const ECS_MAX_LENGTH: usize = 16;

const FRAGMENT_CHECKSUM_LENGTH: u64 = 1;

/// One codec in an ECS chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EcsTag {
    Deflate = 0x02,
    Bzip2 = 0x10,
}

impl EcsTag {
    pub fn from_raw(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(Self::Deflate),
            0x10 => Ok(Self::Bzip2),
            other => Err(XdaError::UnknownEcsTag(other)),
        }
    }
}

/// An ordered Encoding/Compression Sequence.
///
/// The stored payload equals `tag[0](tag[1](…tag[n](plain)))`: encoding
/// applies tags last-to-first, decoding applies them first-to-last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ecs {
    tags: Vec<EcsTag>,
}

impl Ecs {
    pub fn new(tags: Vec<EcsTag>) -> Self {
        Self { tags }
    }

    pub fn none() -> Self {
        Self { tags: Vec::new() }
    }

    pub fn tags(&self) -> &[EcsTag] {
        &self.tags
    }

    pub fn is_identity(&self) -> bool {
        self.tags.is_empty()
    }

    /// Encoded length on disk, terminator included
    pub fn encoded_len(&self) -> u64 {
        self.tags.len() as u64 + 1
    }

    /// Decode a raw chain as read from disk (terminator included)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes.split_last() {
            Some((&ECS_TERMINATOR, tags)) => Ok(Self {
                tags: tags
                    .iter()
                    .map(|&b| EcsTag::from_raw(b))
                    .collect::<Result<_>>()?,
            }),
            _ => Err(XdaError::UnterminatedEcs),
        }
    }

    /// Encode the chain for disk, terminator included
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.tags.iter().map(|&t| t as u8).collect();
        bytes.push(ECS_TERMINATOR);
        bytes
    }

    /// Wrap a plain-byte source in the compressor stack
    pub fn wrap_encoder<'a>(&self, source: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        let mut reader = source;
        for tag in self.tags.iter().rev() {
            reader = match tag {
                EcsTag::Deflate => Box::new(DeflateEncoder::new(reader, flate2::Compression::default())),
                EcsTag::Bzip2 => Box::new(BzEncoder::new(reader, bzip2::Compression::default())),
            };
        }
        reader
    }

    /// Wrap a stored-byte source in the decompressor stack
    pub fn wrap_decoder<'a>(&self, source: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        let mut reader = source;
        for tag in self.tags.iter() {
            reader = match tag {
                EcsTag::Deflate => Box::new(DeflateDecoder::new(reader)),
                EcsTag::Bzip2 => Box::new(BzDecoder::new(reader)),
            };
        }
        reader
    }
}

/// Fixed fields of one fragment, as read back from disk
#[derive(Debug, Clone)]
pub struct FragmentMeta {
    pub length: u64,
    pub ecs: Ecs,
    ecs_encoded_len: u64,
}

impl FragmentMeta {
    /// Read checksum/length/ECS at `position`, leaving the payload alone
    pub fn read<F: Read + Seek>(file: &mut F, position: u64, bits: BitsParam) -> Result<Self> {
        file.seek(SeekFrom::Start(position + FRAGMENT_CHECKSUM_LENGTH))?;
        let length = bits.read_from(&mut *file)?;
        let raw_ecs = codec::read_until_flag(&mut *file, ECS_MAX_LENGTH, ECS_TERMINATOR)?;
        let ecs_encoded_len = raw_ecs.len() as u64;
        Ok(Self {
            length,
            ecs: Ecs::parse(&raw_ecs)?,
            ecs_encoded_len,
        })
    }

    /// Absolute offset of the stored payload
    pub fn payload_offset(&self, position: u64, bits: BitsParam) -> u64 {
        position + FRAGMENT_CHECKSUM_LENGTH + bits.width() as u64 + self.ecs_encoded_len
    }
}

/// Write the segment class marker at the end of the file, returning the
/// segment's start offset.
pub fn write_segment_marker<F: Write + Seek>(file: &mut F) -> Result<u64> {
    let position = file.seek(SeekFrom::End(0))?;
    file.write_all(&BS_CLASS_TYPE)?;
    Ok(position)
}

/// Append one fragment, compressing `source` per `ecs` while folding
/// the XOR checksum, then backfill checksum and length.
///
/// Returns `(fragment_position, stored_length)`.
pub fn write_fragment<F: Read + Write + Seek>(
    file: &mut F,
    bits: BitsParam,
    ecs: &Ecs,
    source: &mut dyn Read,
) -> Result<(u64, u64)> {
    let position = file.seek(SeekFrom::End(0))?;

    // Placeholders for checksum and length
    file.write_all(&[0u8])?;
    bits.write_to(&mut *file, 0)?;
    file.write_all(&ecs.to_bytes())?;

    let mut encoded = ecs.wrap_encoder(Box::new(&mut *source));
    let mut sink = XorWriter::new(&mut *file);
    codec::copy_all(&mut encoded, &mut sink)?;
    let checksum = sink.checksum;
    let length = sink.written;
    drop(encoded);

    file.seek(SeekFrom::Start(position))?;
    file.write_all(&[checksum])?;
    bits.write_to(&mut *file, length)?;
    file.seek(SeekFrom::End(0))?;

    Ok((position, length))
}

/// Stream one fragment's logical content into `dst`, undoing its ECS
/// chain.
pub fn extract_fragment<F: Read + Seek, W: Write>(
    file: &mut F,
    position: u64,
    bits: BitsParam,
    dst: &mut W,
) -> Result<u64> {
    let meta = FragmentMeta::read(file, position, bits)?;
    file.seek(SeekFrom::Start(meta.payload_offset(position, bits)))?;
    let stored = (&mut *file).take(meta.length);
    let mut decoded = meta.ecs.wrap_decoder(Box::new(stored));
    codec::copy_all(&mut decoded, dst)
}

/// Copy a committed fragment into another file without recoding it:
/// the stored payload and ECS chain move verbatim, only the header is
/// re-emitted at the destination's pointer width. Used by snapshotting.
///
/// Returns `(fragment_position, stored_length)` in the destination.
pub fn clone_fragment<S, D>(
    src: &mut S,
    position: u64,
    src_bits: BitsParam,
    dst: &mut D,
    dst_bits: BitsParam,
) -> Result<(u64, u64)>
where
    S: Read + Seek,
    D: Write + Seek,
{
    let meta = FragmentMeta::read(src, position, src_bits)?;
    src.seek(SeekFrom::Start(meta.payload_offset(position, src_bits)))?;

    let out_position = dst.seek(SeekFrom::End(0))?;
    dst.write_all(&[0u8])?;
    dst_bits.write_to(&mut *dst, 0)?;
    dst.write_all(&meta.ecs.to_bytes())?;

    let mut stored = (&mut *src).take(meta.length);
    let mut sink = XorWriter::new(&mut *dst);
    codec::copy_exact(&mut stored, &mut sink, meta.length)?;
    let checksum = sink.checksum;

    dst.seek(SeekFrom::Start(out_position))?;
    dst.write_all(&[checksum])?;
    dst_bits.write_to(&mut *dst, meta.length)?;
    dst.seek(SeekFrom::End(0))?;

    Ok((out_position, meta.length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ecs_roundtrip() {
        let ecs = Ecs::new(vec![EcsTag::Deflate, EcsTag::Bzip2]);
        let bytes = ecs.to_bytes();
        assert_eq!(bytes, vec![0x02, 0x10, 0xff]);
        assert_eq!(Ecs::parse(&bytes).unwrap(), ecs);

        assert_eq!(Ecs::none().to_bytes(), vec![0xff]);
        assert!(Ecs::parse(&[0x02]).is_err());
        assert!(matches!(
            Ecs::parse(&[0x03, 0xff]),
            Err(XdaError::UnknownEcsTag(0x03))
        ));
    }

    #[test]
    fn test_ecs_encode_decode_symmetry() {
        let plain = b"the same byte run repeated repeated repeated repeated".repeat(20);
        for ecs in [
            Ecs::none(),
            Ecs::new(vec![EcsTag::Deflate]),
            Ecs::new(vec![EcsTag::Bzip2]),
            Ecs::new(vec![EcsTag::Deflate, EcsTag::Bzip2]),
        ] {
            let mut stored = Vec::new();
            let mut enc = ecs.wrap_encoder(Box::new(Cursor::new(&plain)));
            codec::copy_all(&mut enc, &mut stored).unwrap();

            let mut back = Vec::new();
            let mut dec = ecs.wrap_decoder(Box::new(Cursor::new(&stored)));
            codec::copy_all(&mut dec, &mut back).unwrap();
            assert_eq!(back, plain);
        }
    }

    #[test]
    fn test_fragment_roundtrip() {
        let mut file = Cursor::new(Vec::new());
        write_segment_marker(&mut file).unwrap();

        let payload = b"fragment payload bytes".to_vec();
        let ecs = Ecs::new(vec![EcsTag::Deflate]);
        let (position, stored_len) =
            write_fragment(&mut file, BitsParam::Four, &ecs, &mut Cursor::new(&payload)).unwrap();
        assert_eq!(position, 4);
        assert!(stored_len > 0);

        let meta = FragmentMeta::read(&mut file, position, BitsParam::Four).unwrap();
        assert_eq!(meta.length, stored_len);
        assert_eq!(meta.ecs, ecs);

        let mut out = Vec::new();
        extract_fragment(&mut file, position, BitsParam::Four, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_clone_fragment_moves_stored_bytes() {
        let mut src = Cursor::new(Vec::new());
        let payload = b"clone me ".repeat(10);
        let ecs = Ecs::new(vec![EcsTag::Deflate]);
        let (position, length) =
            write_fragment(&mut src, BitsParam::Four, &ecs, &mut Cursor::new(&payload)).unwrap();

        let mut dst = Cursor::new(Vec::new());
        let (out_position, out_length) =
            clone_fragment(&mut src, position, BitsParam::Four, &mut dst, BitsParam::Four).unwrap();
        assert_eq!(out_length, length);

        let mut out = Vec::new();
        extract_fragment(&mut dst, out_position, BitsParam::Four, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_clone_fragment_across_widths() {
        let mut src = Cursor::new(Vec::new());
        let payload = b"width conversion payload".to_vec();
        let (position, length) =
            write_fragment(&mut src, BitsParam::Two, &Ecs::none(), &mut Cursor::new(&payload))
                .unwrap();

        let mut dst = Cursor::new(Vec::new());
        let (out_position, out_length) =
            clone_fragment(&mut src, position, BitsParam::Two, &mut dst, BitsParam::Eight)
                .unwrap();
        assert_eq!(out_length, length);

        let mut out = Vec::new();
        extract_fragment(&mut dst, out_position, BitsParam::Eight, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_fragment_checksum_covers_stored_bytes() {
        let mut file = Cursor::new(Vec::new());
        let payload = vec![0x01u8, 0x02, 0x04, 0x08];
        let (position, stored_len) = write_fragment(
            &mut file,
            BitsParam::Two,
            &Ecs::none(),
            &mut Cursor::new(&payload),
        )
        .unwrap();
        assert_eq!(stored_len, 4);

        let bytes = file.into_inner();
        assert_eq!(bytes[position as usize], 0x0f);
    }
}
