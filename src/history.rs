//! Per-path operation histories.
//!
//! Every item in a document carries an ordered list of [`History`]
//! records, one per operation ever applied to its pack path. Records
//! parsed back from committed entries point at BitStream fragments;
//! records staged by the editing API still point at their caller-side
//! source until the next save writes them out.

use crate::error::{Result, XdaError};
use crate::format::bitstream::Ecs;
use crate::format::entry::Operator;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

/// Where a staged operation's content comes from
#[derive(Debug, Clone)]
pub enum ItemSource {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl ItemSource {
    /// Empty content, used for delete records which carry no payload
    pub fn empty() -> Self {
        Self::Memory(Vec::new())
    }

    pub fn open(&self) -> Result<Box<dyn Read + '_>> {
        match self {
            Self::File(path) => Ok(Box::new(File::open(path)?)),
            Self::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
        }
    }
}

/// One recorded operation on an item
#[derive(Debug, Clone)]
pub enum History {
    /// Staged by the editing API, not yet written to the file
    Pending {
        entry_no: u32,
        operator: Operator,
        source: ItemSource,
        ecs: Ecs,
    },
    /// Parsed from (or written into) an entry on disk; `position` is
    /// the absolute offset of the backing fragment
    Committed {
        entry_no: u32,
        operator: Operator,
        position: u64,
        length: u64,
        ecs: Ecs,
    },
}

impl History {
    pub fn entry_no(&self) -> u32 {
        match self {
            Self::Pending { entry_no, .. } | Self::Committed { entry_no, .. } => *entry_no,
        }
    }

    pub fn operator(&self) -> Operator {
        match self {
            Self::Pending { operator, .. } | Self::Committed { operator, .. } => *operator,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

/// An item's full recorded lifetime inside one document
#[derive(Debug, Clone)]
pub struct ItemInfo {
    pub path: String,
    pub histories: Vec<History>,
}

impl ItemInfo {
    pub fn new(path: String) -> Self {
        Self {
            path,
            histories: Vec::new(),
        }
    }

    pub fn last_operator(&self) -> Option<Operator> {
        self.histories.last().map(History::operator)
    }

    /// Whether the item currently exists (last operation is not a delete)
    pub fn is_live(&self) -> bool {
        !matches!(self.last_operator(), None | Some(Operator::Delete))
    }

    /// Check that `next` may legally follow the current tail.
    ///
    /// After a delete only a fresh NEW is allowed, and NEW itself is
    /// only allowed when the item does not currently exist.
    pub fn check_next_operator(&self, next: Operator) -> Result<()> {
        let allowed = match self.last_operator() {
            None | Some(Operator::Delete) => next == Operator::New,
            Some(_) => next != Operator::New,
        };
        if allowed {
            Ok(())
        } else {
            Err(XdaError::OperationNotAllowed(self.path.clone()))
        }
    }

    pub fn push(&mut self, history: History) {
        self.histories.push(history);
    }

    /// Index of the record extraction starts from: scan back over the
    /// trailing APPEND run to the NEW or REPLACE that anchors it.
    pub fn extraction_anchor(&self) -> Result<usize> {
        if !self.is_live() {
            return Err(XdaError::CannotExtractDeleted(self.path.clone()));
        }
        let mut index = self.histories.len() - 1;
        while self.histories[index].operator() == Operator::Append {
            if index == 0 {
                return Err(XdaError::InvalidItemContent(self.path.clone()));
            }
            index -= 1;
        }
        match self.histories[index].operator() {
            Operator::New | Operator::Replace => Ok(index),
            _ => Err(XdaError::InvalidItemContent(self.path.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(entry_no: u32, operator: Operator) -> History {
        History::Committed {
            entry_no,
            operator,
            position: 0,
            length: 0,
            ecs: Ecs::none(),
        }
    }

    #[test]
    fn test_operator_legality() {
        let mut info = ItemInfo::new("\\a".to_string());
        assert!(info.check_next_operator(Operator::New).is_ok());
        assert!(info.check_next_operator(Operator::Append).is_err());

        info.push(committed(1, Operator::New));
        assert!(info.check_next_operator(Operator::New).is_err());
        assert!(info.check_next_operator(Operator::Append).is_ok());
        assert!(info.check_next_operator(Operator::Replace).is_ok());
        assert!(info.check_next_operator(Operator::Delete).is_ok());

        info.push(committed(2, Operator::Delete));
        assert!(!info.is_live());
        assert!(info.check_next_operator(Operator::New).is_ok());
        assert!(info.check_next_operator(Operator::Replace).is_err());
    }

    #[test]
    fn test_extraction_anchor_scans_append_run() {
        let mut info = ItemInfo::new("\\a".to_string());
        info.push(committed(1, Operator::New));
        info.push(committed(2, Operator::Append));
        info.push(committed(2, Operator::Append));
        assert_eq!(info.extraction_anchor().unwrap(), 0);

        info.push(committed(3, Operator::Replace));
        assert_eq!(info.extraction_anchor().unwrap(), 3);
    }

    #[test]
    fn test_extraction_of_deleted_item_fails() {
        let mut info = ItemInfo::new("\\a".to_string());
        info.push(committed(1, Operator::New));
        info.push(committed(2, Operator::Delete));
        assert!(matches!(
            info.extraction_anchor(),
            Err(XdaError::CannotExtractDeleted(_))
        ));
    }
}
