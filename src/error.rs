use std::io;
use thiserror::Error;

/// Result type for XDA operations
pub type Result<T> = std::result::Result<T, XdaError>;

/// Unified error type for all XDA operations
#[derive(Debug, Error)]
pub enum XdaError {
    // Format corruption errors
    #[error("Invalid signature in file header")]
    InvalidSignature,

    #[error("Invalid class marker: expected {expected}")]
    InvalidClassType { expected: &'static str },

    #[error("Invalid bitsParam: {0} (must be 2, 4 or 8)")]
    InvalidBitsParam(u8),

    #[error("Value {value:#x} does not fit a {width}-byte pointer field")]
    ValueOutOfRange { value: u64, width: usize },

    #[error("Invalid entryNameTableType: {0:#04x}")]
    InvalidNameTableType(u8),

    #[error("Invalid operator byte: {0:#04x}")]
    InvalidOperator(u8),

    #[error("ItemList has no operation record for a NameTable nameValue")]
    InvalidNameValue,

    #[error("Illegal operator sequence in item history")]
    InvalidOperationSequence,

    #[error("Invalid next field of last entry")]
    InvalidNextFieldOfLastEntry,

    #[error("Entry checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid NameTable: {0}")]
    InvalidNameTable(String),

    #[error("Invalid ItemList: {0}")]
    InvalidItemList(String),

    #[error("ECS chain is missing its terminator")]
    UnterminatedEcs,

    #[error("Unknown ECS codec tag: {0:#04x}")]
    UnknownEcsTag(u8),

    // Usage errors
    #[error("Invalid pack path: {0}")]
    InvalidPackPath(String),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Operation not allowed for current state of item: {0}")]
    OperationNotAllowed(String),

    #[error("Item has no extractable content: {0}")]
    InvalidItemContent(String),

    #[error("Cannot extract a deleted item: {0}")]
    CannotExtractDeleted(String),

    #[error("Path exceeds maximum encoded length")]
    PathTooLong,

    #[error("Document is not open")]
    DocumentClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
