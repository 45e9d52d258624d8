//! Entry codec: one version record in the append-only chain.
//!
//! An entry is `C.En · entryLength(4) · bsOffset(w) · next(w) ·
//! compress(1) · MD5(16) · nameTableLength(4) · NameTable · ItemList`.
//! The NameTable maps 16-byte name values to pack paths for that entry,
//! and the ItemList records the operations performed against the
//! BitStream segment at `bsOffset`.

use crate::error::{Result, XdaError};
use crate::format::bitstream::{Ecs, FragmentMeta};
use crate::format::codec::{self, BitsParam, NameValue};
use crate::history::{History, ItemInfo};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

/// Class marker opening each entry
pub const ENTRY_CLASS_TYPE: [u8; 4] = *b"C.En";

/// compress bit: NameTable stored deflated
pub const NAMETABLE_DEFLATED: u8 = 0x01;
/// compress bit: ItemList stored deflated
pub const ITEMLIST_DEFLATED: u8 = 0x02;
const COMPRESS_MASK: u8 = 0x03;

/// Longest pack path, in UTF-8 bytes
pub const MAX_PATH_LENGTH: usize = 256;

const OPERATOR_MASK: u8 = 0x0f;
const OPERATOR_END: u8 = 0x0f;

/// An operation recorded against an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operator {
    New = 0x01,
    Append = 0x02,
    Replace = 0x03,
    Delete = 0x04,
}

impl Operator {
    pub fn from_raw(value: u8) -> Result<Self> {
        match value & OPERATOR_MASK {
            0x01 => Ok(Self::New),
            0x02 => Ok(Self::Append),
            0x03 => Ok(Self::Replace),
            0x04 => Ok(Self::Delete),
            other => Err(XdaError::InvalidOperator(other)),
        }
    }
}

/// Consecutive ItemList records sharing one name value
#[derive(Debug, Clone)]
struct OperRun {
    name_value: NameValue,
    ops: Vec<(Operator, u64)>,
}

/// Fixed fields of one parsed or written entry
#[derive(Debug, Clone)]
pub struct Entry {
    pub position: u64,
    pub index: u32,
    pub entry_length: u32,
    pub bs_offset: u64,
    pub next: u64,
    pub compress: u8,
    pub name_table_length: u32,
}

impl Entry {
    /// Parse the entry at `position`, replaying its ItemList into
    /// `items` as committed histories for entry number `index`.
    pub fn parse<F: Read + Seek>(
        file: &mut F,
        position: u64,
        index: u32,
        bits: BitsParam,
        items: &mut HashMap<String, ItemInfo>,
    ) -> Result<Self> {
        file.seek(SeekFrom::Start(position))?;
        let mut class_type = [0u8; 4];
        file.read_exact(&mut class_type)?;
        if class_type != ENTRY_CLASS_TYPE {
            return Err(XdaError::InvalidClassType { expected: "C.En" });
        }

        let entry_length = codec::read_u32(&mut *file)?;
        let bs_offset = bits.read_from(&mut *file)?;
        let next = bits.read_from(&mut *file)?;
        let mut compress = [0u8; 1];
        file.read_exact(&mut compress)?;
        let compress = compress[0] & COMPRESS_MASK;
        let mut checksum = [0u8; 16];
        file.read_exact(&mut checksum)?;
        let name_table_length = codec::read_u32(&mut *file)?;

        let fixed = fixed_fields_length(bits) + name_table_length as u64;
        let item_list_length = (entry_length as u64)
            .checked_sub(fixed)
            .ok_or_else(|| XdaError::InvalidItemList("item list length underflow".to_string()))?;

        let mut name_table_raw = vec![0u8; name_table_length as usize];
        file.read_exact(&mut name_table_raw)?;
        let mut item_list_raw = vec![0u8; item_list_length as usize];
        file.read_exact(&mut item_list_raw)?;

        let mut context = md5::Context::new();
        context.consume(&name_table_raw);
        context.consume(&item_list_raw);
        let actual: [u8; 16] = context.compute().0;
        if actual != checksum {
            return Err(XdaError::ChecksumMismatch {
                expected: hex(&checksum),
                actual: hex(&actual),
            });
        }

        let name_table = decode_name_table(&name_table_raw, compress & NAMETABLE_DEFLATED != 0)?;
        let runs = decode_item_list(&item_list_raw, bits, compress & ITEMLIST_DEFLATED != 0)?;

        for run in runs {
            let path = name_table
                .get(&run.name_value)
                .ok_or(XdaError::InvalidNameValue)?;
            let info = items
                .entry(path.clone())
                .or_insert_with(|| ItemInfo::new(path.clone()));
            for (operator, item_offset) in run.ops {
                info.check_next_operator(operator)
                    .map_err(|_| XdaError::InvalidOperationSequence)?;
                let history = if operator == Operator::Delete {
                    History::Committed {
                        entry_no: index,
                        operator,
                        position: 0,
                        length: 0,
                        ecs: Ecs::none(),
                    }
                } else {
                    let fragment = bs_offset + item_offset;
                    let meta = FragmentMeta::read(&mut *file, fragment, bits)?;
                    History::Committed {
                        entry_no: index,
                        operator,
                        position: fragment,
                        length: meta.length,
                        ecs: meta.ecs,
                    }
                };
                info.push(history);
            }
        }

        Ok(Self {
            position,
            index,
            entry_length,
            bs_offset,
            next,
            compress,
            name_table_length,
        })
    }

    /// Serialize a whole entry at the end of the file with `next` = 0.
    ///
    /// `name_table` and `item_list` are the stored (possibly deflated)
    /// table bytes; the MD5 field covers exactly those.
    pub fn write<F: Write + Seek>(
        file: &mut F,
        index: u32,
        bits: BitsParam,
        bs_offset: u64,
        compress: u8,
        name_table: &[u8],
        item_list: &[u8],
    ) -> Result<Self> {
        let position = file.seek(SeekFrom::End(0))?;
        let entry_length =
            fixed_fields_length(bits) + name_table.len() as u64 + item_list.len() as u64;

        let mut context = md5::Context::new();
        context.consume(name_table);
        context.consume(item_list);
        let checksum: [u8; 16] = context.compute().0;

        file.write_all(&ENTRY_CLASS_TYPE)?;
        codec::write_u32(&mut *file, entry_length as u32)?;
        bits.write_to(&mut *file, bs_offset)?;
        bits.write_to(&mut *file, 0)?;
        file.write_all(&[compress & COMPRESS_MASK])?;
        file.write_all(&checksum)?;
        codec::write_u32(&mut *file, name_table.len() as u32)?;
        file.write_all(name_table)?;
        file.write_all(item_list)?;

        Ok(Self {
            position,
            index,
            entry_length: entry_length as u32,
            bs_offset,
            next: 0,
            compress: compress & COMPRESS_MASK,
            name_table_length: name_table.len() as u32,
        })
    }

    /// Repoint this entry's `next` field at a successor entry
    pub fn patch_next<F: Write + Seek>(
        &mut self,
        file: &mut F,
        bits: BitsParam,
        next: u64,
    ) -> Result<()> {
        file.seek(SeekFrom::Start(self.position + 4 + 4 + bits.width() as u64))?;
        bits.write_to(&mut *file, next)?;
        self.next = next;
        Ok(())
    }
}

/// Length of everything before the NameTable, class marker included
fn fixed_fields_length(bits: BitsParam) -> u64 {
    4 + 4 + bits.width() as u64 * 2 + 1 + 16 + 4
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut plain = Vec::new();
    DeflateDecoder::new(Cursor::new(bytes)).read_to_end(&mut plain)?;
    Ok(plain)
}

/// Deflate a serialized table for storage
pub fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut stored = Vec::new();
    DeflateEncoder::new(Cursor::new(bytes), flate2::Compression::default())
        .read_to_end(&mut stored)?;
    Ok(stored)
}

fn decode_name_table(raw: &[u8], deflated: bool) -> Result<HashMap<NameValue, String>> {
    let plain;
    let bytes = if deflated {
        plain = inflate(raw)?;
        plain.as_slice()
    } else {
        raw
    };

    let mut reader = Cursor::new(bytes);
    let count = codec::read_u32(&mut reader)
        .map_err(|_| XdaError::InvalidNameTable("truncated name count".to_string()))?;
    let mut table = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let name_value = NameValue::read_from(&mut reader)
            .map_err(|_| XdaError::InvalidNameTable("truncated name value".to_string()))?;
        let path = codec::read_cstr(&mut reader, MAX_PATH_LENGTH + 1)
            .map_err(|_| XdaError::InvalidNameTable("unterminated path".to_string()))?;
        table.insert(name_value, path);
    }
    Ok(table)
}

fn decode_item_list(raw: &[u8], bits: BitsParam, deflated: bool) -> Result<Vec<OperRun>> {
    let plain;
    let bytes = if deflated {
        plain = inflate(raw)?;
        plain.as_slice()
    } else {
        raw
    };

    let record_length = 1 + bits.width() + codec::NAME_VALUE_LENGTH;
    let mut reader = Cursor::new(bytes);
    let mut runs: Vec<OperRun> = Vec::new();
    let mut remaining = bytes.len();

    while remaining >= record_length {
        remaining -= record_length;
        let mut op = [0u8; 1];
        reader.read_exact(&mut op)?;
        let item_offset = bits.read_from(&mut reader)?;
        let name_value = NameValue::read_from(&mut reader)?;
        if op[0] & OPERATOR_MASK == OPERATOR_END {
            break;
        }
        let operator = Operator::from_raw(op[0])?;
        match runs.last_mut() {
            Some(run) if run.name_value == name_value => run.ops.push((operator, item_offset)),
            _ => runs.push(OperRun {
                name_value,
                ops: vec![(operator, item_offset)],
            }),
        }
    }
    Ok(runs)
}

/// Serialize a NameTable: count then `nameValue · path · NUL` records
pub fn encode_name_table(entries: &[(NameValue, &str)]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    codec::write_u32(&mut bytes, entries.len() as u32)?;
    for (name_value, path) in entries {
        if path.len() > MAX_PATH_LENGTH {
            return Err(XdaError::PathTooLong);
        }
        name_value.write_to(&mut bytes)?;
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);
    }
    Ok(bytes)
}

/// Serialize an ItemList, END record included
pub fn encode_item_list(
    records: &[(Operator, u64, NameValue)],
    bits: BitsParam,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for (operator, item_offset, name_value) in records {
        bytes.push(*operator as u8);
        bits.write_to(&mut bytes, *item_offset)?;
        name_value.write_to(&mut bytes)?;
    }
    bytes.push(OPERATOR_END);
    bits.write_to(&mut bytes, 0)?;
    NameValue::sentinel().write_to(&mut bytes)?;
    Ok(bytes)
}
