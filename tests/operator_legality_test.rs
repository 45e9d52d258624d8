//! Usage-error matrix: which staged operations are legal for which
//! current item state, plus pack path validation.

use tempfile::NamedTempFile;
use xda_rs::{Ecs, ItemSource, XdaDocument, XdaError};

fn mem(bytes: &[u8]) -> ItemSource {
    ItemSource::Memory(bytes.to_vec())
}

fn new_doc(temp_file: &NamedTempFile) -> XdaDocument {
    XdaDocument::create(temp_file.path(), 4).unwrap()
}

#[test]
fn test_new_over_existing_item_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    doc.insert_item("\\a", mem(b"x"), Ecs::none()).unwrap();
    assert!(matches!(
        doc.insert_item("\\a", mem(b"y"), Ecs::none()),
        Err(XdaError::OperationNotAllowed(_))
    ));
}

#[test]
fn test_edits_on_missing_item_are_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    assert!(matches!(
        doc.replace_item("\\nope", mem(b"x"), Ecs::none()),
        Err(XdaError::ItemNotFound(_))
    ));
    assert!(matches!(
        doc.append_item("\\nope", mem(b"x"), Ecs::none()),
        Err(XdaError::ItemNotFound(_))
    ));
    assert!(matches!(
        doc.delete_item("\\nope"),
        Err(XdaError::ItemNotFound(_))
    ));
}

#[test]
fn test_only_new_is_legal_after_delete() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    doc.insert_item("\\a", mem(b"x"), Ecs::none()).unwrap();
    doc.save().unwrap();
    doc.delete_item("\\a").unwrap();

    assert!(matches!(
        doc.replace_item("\\a", mem(b"y"), Ecs::none()),
        Err(XdaError::OperationNotAllowed(_))
    ));
    assert!(matches!(
        doc.append_item("\\a", mem(b"y"), Ecs::none()),
        Err(XdaError::OperationNotAllowed(_))
    ));
    assert!(matches!(
        doc.delete_item("\\a"),
        Err(XdaError::OperationNotAllowed(_))
    ));
    assert!(doc.insert_item("\\a", mem(b"y"), Ecs::none()).is_ok());
}

#[test]
fn test_delete_of_committed_deleted_item_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    doc.insert_item("\\a", mem(b"x"), Ecs::none()).unwrap();
    doc.save().unwrap();
    doc.delete_item("\\a").unwrap();
    doc.save().unwrap();

    assert!(matches!(
        doc.delete_item("\\a"),
        Err(XdaError::OperationNotAllowed(_))
    ));
}

#[test]
fn test_extract_of_deleted_item_fails() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    doc.insert_item("\\a", mem(b"x"), Ecs::none()).unwrap();
    doc.delete_item("\\a").unwrap();
    assert!(matches!(
        doc.extract_item("\\a"),
        Err(XdaError::CannotExtractDeleted(_))
    ));
}

#[test]
fn test_extract_of_missing_item_fails() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    assert!(matches!(
        doc.extract_item("\\nope"),
        Err(XdaError::ItemNotFound(_))
    ));
}

#[test]
fn test_invalid_pack_paths_are_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);

    for path in ["", "no-lead", "\\", "\\bad|bar", "\\a\\", "\\col:on"] {
        assert!(
            matches!(
                doc.insert_item(path, mem(b"x"), Ecs::none()),
                Err(XdaError::InvalidPackPath(_))
            ),
            "path {path:?} should be rejected"
        );
    }

    let too_long = "\\".to_string() + &"x".repeat(300);
    assert!(matches!(
        doc.insert_item(&too_long, mem(b"x"), Ecs::none()),
        Err(XdaError::PathTooLong)
    ));
}

#[test]
fn test_failed_stage_leaves_document_unchanged() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut doc = new_doc(&temp_file);
    doc.insert_item("\\a", mem(b"x"), Ecs::none()).unwrap();
    let _ = doc.insert_item("\\a", mem(b"y"), Ecs::none());
    doc.save().unwrap();

    assert_eq!(doc.extract_item("\\a").unwrap(), b"x");
    assert_eq!(doc.entry_count(), 1);
}
