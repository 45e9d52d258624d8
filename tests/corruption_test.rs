//! Corruption detection: damaged signatures, class markers, checksums,
//! truncations and broken entry chains must fail to open cleanly.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;
use xda_rs::{Ecs, ItemSource, XdaDocument, XdaError};

/// Create a valid one-entry document with bitsParam 4
fn create_test_document() -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = XdaDocument::create(temp_file.path(), 4).unwrap();
    doc.insert_item(
        "\\test.txt",
        ItemSource::Memory(b"Hello, World!".to_vec()),
        Ecs::none(),
    )
    .unwrap();
    doc.insert_item(
        "\\data.bin",
        ItemSource::Memory(vec![0xAB; 1024]),
        Ecs::none(),
    )
    .unwrap();
    doc.save().unwrap();
    temp_file
}

fn corrupt_byte_at(path: &std::path::Path, offset: u64, new_value: u8) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[new_value]).unwrap();
}

/// Read the firstEntryOffset field (bitsParam 4, so 4 bytes at 22)
fn first_entry_offset(path: &std::path::Path) -> u64 {
    let mut file = OpenOptions::new().read(true).open(path).unwrap();
    file.seek(SeekFrom::Start(22)).unwrap();
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf).unwrap();
    u32::from_le_bytes(buf) as u64
}

#[test]
fn test_corrupted_signature() {
    let temp_file = create_test_document();
    corrupt_byte_at(temp_file.path(), 0, 0xFF);

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::InvalidSignature)
    ));
}

#[test]
fn test_invalid_bits_param() {
    let temp_file = create_test_document();
    // bitsParam lives at byte 21
    corrupt_byte_at(temp_file.path(), 21, 3);

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::InvalidBitsParam(3))
    ));
}

#[test]
fn test_invalid_name_table_type() {
    let temp_file = create_test_document();
    // entryNameTableType lives at byte 20
    corrupt_byte_at(temp_file.path(), 20, 0x42);

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::InvalidNameTableType(0x42))
    ));
}

#[test]
fn test_corrupted_entry_class_marker() {
    let temp_file = create_test_document();
    let entry_position = first_entry_offset(temp_file.path());
    corrupt_byte_at(temp_file.path(), entry_position, b'X');

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::InvalidClassType { expected: "C.En" })
    ));
}

#[test]
fn test_corrupted_name_table_fails_checksum() {
    let temp_file = create_test_document();
    let entry_position = first_entry_offset(temp_file.path());

    // NameTable starts after the fixed fields: 4+4+4+4+1+16+4 with w=4
    corrupt_byte_at(temp_file.path(), entry_position + 37, 0xFF);

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_truncated_entry() {
    let temp_file = create_test_document();
    let entry_position = first_entry_offset(temp_file.path());

    let file = OpenOptions::new()
        .write(true)
        .open(temp_file.path())
        .unwrap();
    file.set_len(entry_position + 10).unwrap();

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::Io(_))
    ));
}

#[test]
fn test_nonzero_next_on_last_entry() {
    let temp_file = create_test_document();
    let entry_position = first_entry_offset(temp_file.path());

    // next lives at entry + 4 + 4 + w
    corrupt_byte_at(temp_file.path(), entry_position + 12, 0x01);

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::InvalidNextFieldOfLastEntry)
    ));
}

#[test]
fn test_entry_count_beyond_chain() {
    let temp_file = create_test_document();
    // entryCount lives at byte 16; claim two entries while one exists
    corrupt_byte_at(temp_file.path(), 16, 2);

    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::InvalidNextFieldOfLastEntry)
    ));
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        XdaDocument::open("/nonexistent/archive.xda"),
        Err(XdaError::Io(_))
    ));
}

#[test]
fn test_empty_file_is_not_a_document() {
    let temp_file = NamedTempFile::new().unwrap();
    assert!(matches!(
        XdaDocument::open(temp_file.path()),
        Err(XdaError::Io(_))
    ));
}
