//! The archive engine: an open XDA document with its in-memory item
//! map, staged edits and the save pipeline.
//!
//! A document keeps a read-only handle between saves. Edits are staged
//! as pending histories; `save_changes_with` reopens the file
//! read-write, tidies the pending tails into a minimal operation set,
//! appends one BitStream segment plus one entry, patches the prior
//! entry's next pointer and the header counters, then narrows the
//! handle back to read-only.

use crate::error::{Result, XdaError};
use crate::format::bitstream::{self, Ecs};
use crate::format::codec::{self, NameValue};
use crate::format::entry::{self, Entry, Operator, MAX_PATH_LENGTH};
use crate::format::header::Header;
use crate::history::{History, ItemInfo, ItemSource};
use crate::view::View;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info};

/// Format version written by this crate
pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

const DEFAULT_NAME_TABLE_TYPE: u8 = 0x00;

/// Pack paths: one or more `\segment` (or `/segment`) components, no
/// reserved characters inside a segment.
static PACK_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^([\\/][^\t:*?"<>|\\/]+)+$"#).unwrap());

fn validate_pack_path(path: &str) -> Result<()> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(XdaError::PathTooLong);
    }
    if !PACK_PATH.is_match(path) {
        return Err(XdaError::InvalidPackPath(path.to_string()));
    }
    Ok(())
}

/// One operation the tidy pass decided to write in the next entry
struct PlannedRecord {
    operator: Operator,
    source: ItemSource,
    ecs: Ecs,
}

/// What the tidy pass decided for one changed path
enum TidyOutcome {
    /// Never committed and ends deleted: drop the path entirely
    RemovePath,
    /// Pending tail cancels out against the committed state
    ClearPending,
    /// Write these records, in order
    Write(Vec<PlannedRecord>),
}

/// Collapse a changed item's pending tail into the minimal record run
/// that reproduces its final state on disk.
fn tidy_pending(info: &ItemInfo) -> TidyOutcome {
    let boundary = info
        .histories
        .iter()
        .position(History::is_pending)
        .unwrap_or(info.histories.len());
    let (committed, pending) = info.histories.split_at(boundary);
    let committed_live =
        matches!(committed.last().map(History::operator), Some(op) if op != Operator::Delete);

    let last = match pending.last() {
        Some(last) => last,
        None => return TidyOutcome::ClearPending,
    };

    if last.operator() == Operator::Delete {
        return if committed.is_empty() {
            TidyOutcome::RemovePath
        } else if committed_live {
            TidyOutcome::Write(vec![PlannedRecord {
                operator: Operator::Delete,
                source: ItemSource::empty(),
                ecs: Ecs::none(),
            }])
        } else {
            // already deleted on disk
            TidyOutcome::ClearPending
        };
    }

    let planned = |history: &History, operator: Operator| match history {
        History::Pending { source, ecs, .. } => Some(PlannedRecord {
            operator,
            source: source.clone(),
            ecs: ecs.clone(),
        }),
        History::Committed { .. } => None,
    };

    // Everything before the last NEW/REPLACE is shadowed by it; a pure
    // APPEND tail extends the committed content as-is.
    let anchor = pending
        .iter()
        .rposition(|h| matches!(h.operator(), Operator::New | Operator::Replace));
    let records = match anchor {
        None => pending
            .iter()
            .filter_map(|h| planned(h, h.operator()))
            .collect(),
        Some(index) => {
            let base = if committed_live {
                Operator::Replace
            } else {
                Operator::New
            };
            let mut records: Vec<PlannedRecord> =
                planned(&pending[index], base).into_iter().collect();
            records.extend(
                pending[index + 1..]
                    .iter()
                    .filter_map(|h| planned(h, h.operator())),
            );
            records
        }
    };
    TidyOutcome::Write(records)
}

/// An open XDA document
pub struct XdaDocument {
    path: PathBuf,
    file: Option<File>,
    header: Header,
    entries: Vec<Entry>,
    items: HashMap<String, ItemInfo>,
    changed: BTreeSet<String>,
    views: Vec<Rc<RefCell<dyn View>>>,
}

impl XdaDocument {
    /// Create a new empty document at `path`.
    ///
    /// The header is only written out by the first save; until then the
    /// file on disk stays empty.
    pub fn create<P: AsRef<Path>>(path: P, bits_param: u8) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let header = Header::create(
            MAJOR_VERSION,
            MINOR_VERSION,
            DEFAULT_NAME_TABLE_TYPE,
            bits_param,
        )?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let file = File::open(&path)?;
        debug!("created document at {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
            header,
            entries: Vec::new(),
            items: HashMap::new(),
            changed: BTreeSet::new(),
            views: Vec::new(),
        })
    }

    /// Open an existing document, parsing the header and replaying the
    /// whole entry chain into the item map.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let header = Header::parse(&mut file)?;
        let bits = header.bits_param();

        let mut position = match (header.entry_count(), header.first_entry_offset()) {
            (0, _) => None,
            (_, offset) if offset >= 0 => Some(offset as u64),
            _ => return Err(XdaError::InvalidNextFieldOfLastEntry),
        };
        let mut entries = Vec::with_capacity(header.entry_count() as usize);
        let mut items = HashMap::new();
        for index in 1..=header.entry_count() {
            let current = position.ok_or(XdaError::InvalidNextFieldOfLastEntry)?;
            let entry = Entry::parse(&mut file, current, index, bits, &mut items)?;
            position = (entry.next != 0).then_some(entry.next);
            entries.push(entry);
        }
        if position.is_some() {
            return Err(XdaError::InvalidNextFieldOfLastEntry);
        }

        info!(
            "opened {}: {} entries, {} items",
            path.display(),
            header.entry_count(),
            items.len()
        );
        Ok(Self {
            path,
            file: Some(file),
            header,
            entries,
            items,
            changed: BTreeSet::new(),
            views: Vec::new(),
        })
    }

    pub fn entry_count(&self) -> u32 {
        self.header.entry_count()
    }

    pub fn major_version(&self) -> u8 {
        self.header.major_version()
    }

    pub fn minor_version(&self) -> u8 {
        self.header.minor_version()
    }

    /// Whether `path` currently exists (pending edits included)
    pub fn has_item(&self, path: &str) -> bool {
        self.items.get(path).map(ItemInfo::is_live).unwrap_or(false)
    }

    /// All currently existing paths, sorted
    pub fn existing_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .items
            .values()
            .filter(|info| info.is_live())
            .map(|info| info.path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Register a view; every currently existing path is replayed to it
    /// as a NEW notification.
    pub fn register_view(&mut self, view: Rc<RefCell<dyn View>>) {
        for path in self.existing_paths() {
            view.borrow_mut().update(&path, Operator::New);
        }
        self.views.push(view);
    }

    fn notify(&self, path: &str, operator: Operator) {
        for view in &self.views {
            view.borrow_mut().update(path, operator);
        }
    }

    fn stage(
        &mut self,
        path: &str,
        operator: Operator,
        source: ItemSource,
        ecs: Ecs,
    ) -> Result<()> {
        if self.file.is_none() {
            return Err(XdaError::DocumentClosed);
        }
        validate_pack_path(path)?;
        let entry_no = self.header.entry_count() + 1;
        let info = match operator {
            Operator::New => self
                .items
                .entry(path.to_string())
                .or_insert_with(|| ItemInfo::new(path.to_string())),
            _ => self
                .items
                .get_mut(path)
                .ok_or_else(|| XdaError::ItemNotFound(path.to_string()))?,
        };
        info.check_next_operator(operator)?;
        info.push(History::Pending {
            entry_no,
            operator,
            source,
            ecs,
        });
        self.changed.insert(path.to_string());
        self.notify(path, operator);
        Ok(())
    }

    /// Stage a NEW item
    pub fn insert_item(&mut self, path: &str, source: ItemSource, ecs: Ecs) -> Result<()> {
        self.stage(path, Operator::New, source, ecs)
    }

    /// Stage replacement content for an existing item
    pub fn replace_item(&mut self, path: &str, source: ItemSource, ecs: Ecs) -> Result<()> {
        self.stage(path, Operator::Replace, source, ecs)
    }

    /// Stage appended content for an existing item
    pub fn append_item(&mut self, path: &str, source: ItemSource, ecs: Ecs) -> Result<()> {
        self.stage(path, Operator::Append, source, ecs)
    }

    /// Stage deletion of an existing item
    pub fn delete_item(&mut self, path: &str) -> Result<()> {
        self.stage(path, Operator::Delete, ItemSource::empty(), Ecs::none())
    }

    /// Stream an item's current logical content into `dst`
    pub fn extract_to<W: Write>(&mut self, path: &str, dst: &mut W) -> Result<u64> {
        let info = self
            .items
            .get(path)
            .ok_or_else(|| XdaError::ItemNotFound(path.to_string()))?;
        let anchor = info.extraction_anchor()?;
        let file = self.file.as_mut().ok_or(XdaError::DocumentClosed)?;
        let bits = self.header.bits_param();

        let mut total = 0;
        for history in &info.histories[anchor..] {
            total += match history {
                History::Committed { position, .. } => {
                    bitstream::extract_fragment(file, *position, bits, dst)?
                }
                // pending content is still raw on the caller's side
                History::Pending { source, .. } => {
                    let mut reader = source.open()?;
                    codec::copy_all(&mut reader, dst)?
                }
            };
        }
        Ok(total)
    }

    /// Extract an item's current logical content into memory
    pub fn extract_item(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.extract_to(path, &mut content)?;
        Ok(content)
    }

    /// Stage every file under the filesystem directory `dir` as a NEW
    /// item below the pack path `prefix`, recursing into
    /// subdirectories. Returns the number of items staged.
    pub fn insert_directory<P: AsRef<Path>>(
        &mut self,
        prefix: &str,
        dir: P,
        ecs: Ecs,
    ) -> Result<u32> {
        let mut staged = 0;
        for dir_entry in std::fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let child = format!("{prefix}\\{name}");
            if dir_entry.file_type()?.is_dir() {
                staged += self.insert_directory(&child, dir_entry.path(), ecs.clone())?;
            } else {
                self.insert_item(&child, ItemSource::File(dir_entry.path()), ecs.clone())?;
                staged += 1;
            }
        }
        Ok(staged)
    }

    /// Extract every item below the pack path `prefix` into the
    /// filesystem directory `target`, recreating the pack hierarchy.
    /// Returns the number of items extracted.
    pub fn extract_directory<P: AsRef<Path>>(&mut self, prefix: &str, target: P) -> Result<u32> {
        let target = target.as_ref();
        let mut extracted = 0;
        for path in self.existing_paths() {
            let rel = match path.strip_prefix(prefix) {
                // "\doc" must not capture "\docs\a": the remainder has
                // to open with a separator of its own
                Some(rel) if rel.starts_with(['\\', '/']) => rel,
                _ => continue,
            };
            let mut out_path = target.to_path_buf();
            for segment in rel.split(['\\', '/']).filter(|s| !s.is_empty()) {
                out_path.push(segment);
            }
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            self.extract_to(&path, &mut out)?;
            extracted += 1;
        }
        Ok(extracted)
    }

    /// Commit all staged edits as one new entry, deflating both tables
    pub fn save(&mut self) -> Result<()> {
        self.save_changes_with(true, true)
    }

    /// Commit all staged edits as one new entry.
    ///
    /// The flags choose whether the NameTable and ItemList are stored
    /// deflated.
    pub fn save_changes_with(
        &mut self,
        deflate_name_table: bool,
        deflate_item_list: bool,
    ) -> Result<()> {
        if self.file.is_none() {
            return Err(XdaError::DocumentClosed);
        }
        // a failed commit must not leave the document half-open
        if let Err(error) = self.commit_changes(deflate_name_table, deflate_item_list) {
            self.close();
            return Err(error);
        }
        Ok(())
    }

    fn commit_changes(&mut self, deflate_name_table: bool, deflate_item_list: bool) -> Result<()> {
        // widen the write window for the duration of the commit
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // the header goes out with the first save, even an empty one
        if self.header.entry_count() == 0 {
            self.header.write(&mut file)?;
        }

        if self.changed.is_empty() {
            debug!("save requested with no staged changes");
            file.sync_all()?;
            self.file = Some(File::open(&self.path)?);
            return Ok(());
        }

        let mut plans: Vec<(String, Vec<PlannedRecord>)> = Vec::new();
        let mut removed = Vec::new();
        let mut cleared = Vec::new();
        for path in &self.changed {
            let info = match self.items.get(path) {
                Some(info) => info,
                None => continue,
            };
            match tidy_pending(info) {
                TidyOutcome::RemovePath => removed.push(path.clone()),
                TidyOutcome::ClearPending => cleared.push(path.clone()),
                TidyOutcome::Write(records) => plans.push((path.clone(), records)),
            }
        }
        for path in &removed {
            self.items.remove(path);
        }
        for path in &cleared {
            if let Some(info) = self.items.get_mut(path) {
                info.histories.retain(|h| !h.is_pending());
            }
        }
        if plans.is_empty() {
            self.changed.clear();
            debug!("all staged changes cancelled out, nothing to write");
            file.sync_all()?;
            self.file = Some(File::open(&self.path)?);
            return Ok(());
        }

        let bits = self.header.bits_param();
        let next_index = self.header.entry_count() + 1;
        let bs_offset = bitstream::write_segment_marker(&mut file)?;

        let mut name_entries: Vec<(NameValue, String)> = Vec::new();
        let mut list_records: Vec<(Operator, u64, NameValue)> = Vec::new();
        let mut installs: Vec<(String, Vec<History>)> = Vec::new();
        let mut name_counter = 0u32;

        for (path, records) in &plans {
            name_counter += 1;
            let name_value = NameValue::from_ordinal(name_counter);
            name_entries.push((name_value, path.clone()));

            let mut committed = Vec::with_capacity(records.len());
            for record in records {
                if record.operator == Operator::Delete {
                    list_records.push((Operator::Delete, 0, name_value));
                    committed.push(History::Committed {
                        entry_no: next_index,
                        operator: Operator::Delete,
                        position: 0,
                        length: 0,
                        ecs: Ecs::none(),
                    });
                } else {
                    let mut source = record.source.open()?;
                    let (position, length) =
                        bitstream::write_fragment(&mut file, bits, &record.ecs, &mut *source)?;
                    list_records.push((record.operator, position - bs_offset, name_value));
                    committed.push(History::Committed {
                        entry_no: next_index,
                        operator: record.operator,
                        position,
                        length,
                        ecs: record.ecs.clone(),
                    });
                }
            }
            installs.push((path.clone(), committed));
        }

        let name_refs: Vec<(NameValue, &str)> = name_entries
            .iter()
            .map(|(nv, path)| (*nv, path.as_str()))
            .collect();
        let mut name_table = entry::encode_name_table(&name_refs)?;
        let mut item_list = entry::encode_item_list(&list_records, bits)?;
        let mut compress = 0u8;
        if deflate_name_table {
            name_table = entry::deflate(&name_table)?;
            compress |= entry::NAMETABLE_DEFLATED;
        }
        if deflate_item_list {
            item_list = entry::deflate(&item_list)?;
            compress |= entry::ITEMLIST_DEFLATED;
        }

        let new_entry = Entry::write(
            &mut file,
            next_index,
            bits,
            bs_offset,
            compress,
            &name_table,
            &item_list,
        )?;

        match self.entries.last_mut() {
            Some(prior) => prior.patch_next(&mut file, bits, new_entry.position)?,
            None => self
                .header
                .patch_first_entry_offset(&mut file, new_entry.position)?,
        }
        self.header.patch_entry_count(&mut file, next_index)?;
        file.sync_all()?;

        for (path, committed) in installs {
            if let Some(info) = self.items.get_mut(&path) {
                info.histories.retain(|h| !h.is_pending());
                info.histories.extend(committed);
            }
        }
        self.entries.push(new_entry);
        self.changed.clear();

        // narrow back to read-only
        self.file = Some(File::open(&self.path)?);
        info!(
            "committed entry {} ({} items) to {}",
            next_index,
            plans.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Write the current logical state of the document, pending edits
    /// included, to `target` as a fresh single-entry archive with this
    /// document's pointer width and both tables deflated.
    pub fn save_as<P: AsRef<Path>>(&mut self, target: P) -> Result<()> {
        self.save_as_with(target, self.header.bits_param() as u8, true, true)
    }

    /// Write the current logical state of the document, pending edits
    /// included, to `target` as a fresh single-entry archive.
    ///
    /// The snapshot gets its own pointer width and table-compression
    /// flags; this document itself is left untouched.
    pub fn save_as_with<P: AsRef<Path>>(
        &mut self,
        target: P,
        bits_param: u8,
        deflate_name_table: bool,
        deflate_item_list: bool,
    ) -> Result<()> {
        if self.file.is_none() {
            return Err(XdaError::DocumentClosed);
        }
        let target = target.as_ref();
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(target)?;

        let mut header = Header::create(
            self.header.major_version(),
            self.header.minor_version(),
            self.header.name_table_type(),
            bits_param,
        )?;
        header.write(&mut out)?;

        let paths = self.existing_paths();
        if paths.is_empty() {
            out.sync_all()?;
            info!("saved empty snapshot to {}", target.display());
            return Ok(());
        }

        let bits = header.bits_param();
        let src_bits = self.header.bits_param();
        let bs_offset = bitstream::write_segment_marker(&mut out)?;
        let mut name_entries: Vec<(NameValue, String)> = Vec::new();
        let mut list_records: Vec<(Operator, u64, NameValue)> = Vec::new();
        let mut name_counter = 0u32;

        for path in paths {
            // Single committed fragments move verbatim; multi-record or
            // pending content is flattened and re-encoded.
            let (committed_fragment, ecs) = {
                let info = self
                    .items
                    .get(&path)
                    .ok_or_else(|| XdaError::ItemNotFound(path.clone()))?;
                let anchor = info.extraction_anchor()?;
                let single = anchor + 1 == info.histories.len();
                match &info.histories[anchor] {
                    History::Committed { position, .. } if single => (Some(*position), Ecs::none()),
                    History::Committed { ecs, .. } | History::Pending { ecs, .. } => {
                        (None, ecs.clone())
                    }
                }
            };

            let (position, _) = match committed_fragment {
                Some(fragment) => {
                    let file = self.file.as_mut().ok_or(XdaError::DocumentClosed)?;
                    bitstream::clone_fragment(file, fragment, src_bits, &mut out, bits)?
                }
                None => {
                    let content = self.extract_item(&path)?;
                    bitstream::write_fragment(&mut out, bits, &ecs, &mut Cursor::new(content))?
                }
            };

            name_counter += 1;
            let name_value = NameValue::from_ordinal(name_counter);
            list_records.push((Operator::New, position - bs_offset, name_value));
            name_entries.push((name_value, path));
        }

        let name_refs: Vec<(NameValue, &str)> = name_entries
            .iter()
            .map(|(nv, path)| (*nv, path.as_str()))
            .collect();
        let mut name_table = entry::encode_name_table(&name_refs)?;
        let mut item_list = entry::encode_item_list(&list_records, bits)?;
        let mut compress = 0u8;
        if deflate_name_table {
            name_table = entry::deflate(&name_table)?;
            compress |= entry::NAMETABLE_DEFLATED;
        }
        if deflate_item_list {
            item_list = entry::deflate(&item_list)?;
            compress |= entry::ITEMLIST_DEFLATED;
        }

        let new_entry = Entry::write(&mut out, 1, bits, bs_offset, compress, &name_table, &item_list)?;
        header.patch_first_entry_offset(&mut out, new_entry.position)?;
        header.patch_entry_count(&mut out, 1)?;
        out.sync_all()?;

        info!(
            "saved snapshot of {} items to {}",
            name_counter,
            target.display()
        );
        Ok(())
    }

    /// Drop the file handle and all in-memory state. Any staged edits
    /// are lost.
    pub fn close(&mut self) {
        self.file = None;
        self.entries.clear();
        self.items.clear();
        self.changed.clear();
        self.views.clear();
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}
