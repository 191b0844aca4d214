/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::bitmap::codec::{self, CodecError};
use crate::bitmap::{Bitmap, BitmapError};
use crate::buffer::{BufferError, BufferPoolManager};
use crate::common::{PageIdT, RecordIdT, PAGE_SIZE};
use crate::disk::FileType;
use crate::index::{BitmapIndex, Comparator};
use crate::relation::{Record, RecordFormat};

use log::{debug, error};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::SplitWhitespace;
use std::sync::Arc;
use thiserror::Error;

/// One item of a postfix condition list: either a comparison against a named
/// attribute, or a binary operator combining the two preceding results.
/// An empty list selects every live record.
#[derive(Debug, Clone)]
pub enum Condition {
    Leaf {
        attribute: String,
        comparator: Comparator,
        value: String,
    },
    And,
    Or,
}

impl Condition {
    /// Convenience constructor for a comparison leaf.
    pub fn leaf(attribute: &str, comparator: Comparator, value: &str) -> Self {
        Condition::Leaf {
            attribute: attribute.to_string(),
            comparator,
            value: value.to_string(),
        }
    }
}

/// The index manager owns a single table: the existence bitmap naming which
/// record IDs are live, one bitmap index per attribute, and the record blobs
/// in the heap file behind the buffer pool.
///
/// Queries evaluate a postfix condition list to a bitmap; the bitmap's set
/// positions are the matching record IDs. Inserts reuse the lowest
/// reclaimable record ID before growing the ID space, appending a fresh heap
/// page whenever the space crosses a page boundary.
///
/// Index state persists in `<base>.txt` (written on close, restored on
/// open); record blobs persist in `<base>.db` through the buffer pool. The
/// manager itself is not thread-safe; callers serialize access externally.
pub struct IndexManager {
    /// Table name, for diagnostics.
    table_name: String,

    /// Path of the metadata file.
    metadata_path: PathBuf,

    /// The lowest record ID never yet allocated. Every bitmap in this
    /// manager has exactly this logical length.
    next_record_id: RecordIdT,

    /// Bit `r` is 1 iff record ID `r` is live.
    existence: Bitmap,

    /// Attribute name to bitmap index, ordered by name.
    indexes: BTreeMap<String, BitmapIndex>,

    /// Buffer pool for heap page access.
    buffer_pool: Arc<BufferPoolManager>,

    /// Caller-provided record layout.
    format: Box<dyn RecordFormat>,

    /// Record slots per heap page: floor(PAGE_SIZE / record size).
    records_per_page: u64,

    /// Set once `close` has written the metadata file.
    saved: bool,
}

impl IndexManager {
    /// Open the table at `<base>.txt`, restoring persisted index state if
    /// the metadata file exists and starting empty otherwise.
    pub fn open(
        base: &Path,
        buffer_pool: Arc<BufferPoolManager>,
        format: Box<dyn RecordFormat>,
    ) -> Result<Self, EngineError> {
        let record_size = format.record_size();
        assert!(
            record_size > 0 && record_size <= PAGE_SIZE as usize,
            "record size must fit within a page"
        );

        let table_name = base
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut manager = Self {
            table_name,
            metadata_path: base.with_extension("txt"),
            next_record_id: 0,
            existence: Bitmap::new(0),
            indexes: BTreeMap::new(),
            buffer_pool,
            format,
            records_per_page: (PAGE_SIZE as usize / record_size) as u64,
            saved: false,
        };

        if manager.metadata_path.exists() {
            manager.load_metadata()?;
            debug!(
                "restored table {} with {} live records, {} indexed attributes",
                manager.table_name,
                manager.existence.count_bits(),
                manager.indexes.len()
            );
        }
        Ok(manager)
    }

    /// Insert a record with the given attribute values.
    ///
    /// The lowest reclaimable record ID (existence bit 0) is reused if one
    /// exists; otherwise the ID space grows by one, resizing every bitmap
    /// and appending a heap page when the new ID starts a fresh page.
    pub fn insert(&mut self, attributes: &[(String, String)]) -> Result<(), EngineError> {
        // A cleared existence bit below next_record_id marks a removed
        // record whose slot can be reused.
        if let Some(pos) = (!&self.existence).iter().next() {
            return self.write_new_record(attributes, pos);
        }

        if self.next_record_id % self.records_per_page == 0 {
            let page_id = (self.next_record_id / self.records_per_page) as PageIdT;
            self.buffer_pool.append_new_page(FileType::Table, page_id)?;
            self.buffer_pool.unpin_page(FileType::Table, page_id, false);
        }

        self.next_record_id += 1;
        self.existence.resize(self.next_record_id);
        for index in self.indexes.values_mut() {
            index.resize(self.next_record_id);
        }

        self.write_new_record(attributes, self.next_record_id - 1)
    }

    /// Update every record matching the conditions, re-pointing its index
    /// bits and rewriting the affected blob bytes. Returns the number of
    /// records updated.
    pub fn update(
        &mut self,
        conditions: &[Condition],
        attributes: &[(String, String)],
    ) -> Result<u64, EngineError> {
        let matches = self.evaluate(conditions)?;

        for pos in matches.iter() {
            let len = self.next_record_id;
            for (name, value) in attributes {
                let index = self
                    .indexes
                    .entry(name.clone())
                    .or_insert_with(|| BitmapIndex::new(len));
                index.clear_all(pos)?;
                index.set(value, pos)?;
            }
            self.write_record_slot(pos, attributes, false)?;
        }

        Ok(matches.pop_count())
    }

    /// Remove every record matching the conditions. Returns the number of
    /// records removed. Heap pages are not reclaimed; the slots become
    /// reusable through the existence bitmap.
    pub fn remove(&mut self, conditions: &[Condition]) -> Result<u64, EngineError> {
        let matches = self.evaluate(conditions)?;

        for pos in matches.iter() {
            for index in self.indexes.values_mut() {
                index.clear_all(pos)?;
            }
            self.existence.clear_bit(pos)?;
        }

        Ok(matches.pop_count())
    }

    /// Return the number of records matching the conditions.
    pub fn count(&self, conditions: &[Condition]) -> Result<u64, EngineError> {
        Ok(self.evaluate(conditions)?.pop_count())
    }

    /// Return a lazy iterator over the records matching the conditions.
    ///
    /// The iterator snapshots the matching record IDs; it is not invalidated
    /// by later writes, but records removed after the snapshot yield
    /// whatever bytes the heap then holds.
    pub fn select(&self, conditions: &[Condition]) -> Result<RecordIterator, EngineError> {
        Ok(RecordIterator::new(
            self.evaluate(conditions)?,
            Arc::clone(&self.buffer_pool),
            self.format.record_size(),
        ))
    }

    /// Write the metadata file and consume the manager. On-disk index state
    /// is only guaranteed consistent after a successful close.
    pub fn close(mut self) -> Result<(), EngineError> {
        self.save_metadata()?;
        self.saved = true;
        debug!("closed table {}", self.table_name);
        Ok(())
    }

    /// Evaluate a postfix condition list to the bitmap of matching live
    /// records: leaves push their index's bitmap, operators combine the top
    /// two stack entries, and the single remaining bitmap is masked by the
    /// existence bitmap.
    fn evaluate(&self, conditions: &[Condition]) -> Result<Bitmap, EngineError> {
        if conditions.is_empty() {
            return Ok(self.existence.clone());
        }

        let mut stack: Vec<Bitmap> = Vec::new();
        for condition in conditions {
            match condition {
                Condition::Leaf {
                    attribute,
                    comparator,
                    value,
                } => {
                    let index = self
                        .indexes
                        .get(attribute)
                        .ok_or_else(|| EngineError::UnknownAttribute(attribute.clone()))?;
                    stack.push(index.evaluate(*comparator, value));
                }
                Condition::And | Condition::Or => {
                    let rhs = stack.pop().ok_or(EngineError::MalformedCondition)?;
                    let lhs = stack.last_mut().ok_or(EngineError::MalformedCondition)?;
                    match condition {
                        Condition::And => *lhs &= &rhs,
                        _ => *lhs |= &rhs,
                    }
                }
            }
        }

        if stack.len() != 1 {
            return Err(EngineError::MalformedCondition);
        }
        // .unwrap() ok since the stack holds exactly one bitmap.
        Ok(&stack.pop().unwrap() & &self.existence)
    }

    /// Make the given record ID live: mark existence, write the blob, and
    /// set the index bit for each provided attribute value.
    fn write_new_record(
        &mut self,
        attributes: &[(String, String)],
        pos: RecordIdT,
    ) -> Result<(), EngineError> {
        self.existence.set_bit(pos)?;
        self.write_record_slot(pos, attributes, true)?;

        let len = self.next_record_id;
        for (name, value) in attributes {
            let index = self
                .indexes
                .entry(name.clone())
                .or_insert_with(|| BitmapIndex::new(len));
            index.set(value, pos)?;
        }
        Ok(())
    }

    /// Write attribute values into the record's slot on its heap page:
    /// fetch, mutate the slot bytes, unpin dirty.
    fn write_record_slot(
        &self,
        pos: RecordIdT,
        attributes: &[(String, String)],
        init: bool,
    ) -> Result<(), EngineError> {
        let page_id = (pos / self.records_per_page) as PageIdT;
        let slot = (pos % self.records_per_page) as usize;
        let record_size = self.format.record_size();

        let frame = self.buffer_pool.fetch_page(FileType::Table, page_id)?;
        {
            let mut data = frame.data_mut();
            let slot_bytes = &mut data[slot * record_size..(slot + 1) * record_size];
            if init {
                self.format.init_record(slot_bytes);
            }
            for (name, value) in attributes {
                self.format.write_value(slot_bytes, name, value);
            }
        }
        self.buffer_pool.unpin_page(FileType::Table, page_id, true);
        Ok(())
    }

    /// Restore `next_record_id`, the existence bitmap, and every attribute
    /// index from the metadata file.
    fn load_metadata(&mut self) -> Result<(), EngineError> {
        let text = fs::read_to_string(&self.metadata_path)?;
        let mut tokens = text.split_whitespace();

        self.next_record_id = parse_token(&mut tokens)?;
        let attribute_count: usize = parse_token(&mut tokens)?;

        self.existence = Bitmap::new(self.next_record_id);
        let existence_bits = codec::decode(next_token(&mut tokens)?)?;
        for (pos, bit) in existence_bits.chars().enumerate() {
            if bit == '1' {
                self.existence.set_bit(pos as RecordIdT)?;
            }
        }

        for _ in 0..attribute_count {
            let name = next_token(&mut tokens)?.to_string();
            let value_count: usize = parse_token(&mut tokens)?;

            let mut index = BitmapIndex::new(self.next_record_id);
            for _ in 0..value_count {
                let value = next_token(&mut tokens)?;
                let bits = codec::decode(next_token(&mut tokens)?)?;
                for (pos, bit) in bits.chars().enumerate() {
                    if bit == '1' {
                        index.set(value, pos as RecordIdT)?;
                    }
                }
            }
            self.indexes.insert(name, index);
        }
        Ok(())
    }

    /// Write the metadata file: next record ID, attribute count, and the
    /// encoded existence bitmap, followed by each attribute's name, value
    /// count, and value/bitmap pairs. Ordered-map iteration keeps the token
    /// order stable across round trips.
    fn save_metadata(&self) -> Result<(), EngineError> {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {} ",
            self.next_record_id,
            self.indexes.len(),
            codec::encode(&self.existence)
        ));

        for (name, index) in &self.indexes {
            out.push_str(&format!("{} {} ", name, index.value_count()));
            for (value, bitmap) in index.value_bitmaps() {
                out.push_str(&format!("{} {} ", value, codec::encode(bitmap)));
            }
        }

        fs::write(&self.metadata_path, out)?;
        Ok(())
    }
}

impl Drop for IndexManager {
    /// Best-effort metadata save for managers dropped without an explicit
    /// close. Failures can only be logged from a destructor.
    fn drop(&mut self) {
        if !self.saved {
            if let Err(e) = self.save_metadata() {
                error!(
                    "failed to save metadata for table {} during teardown: {}",
                    self.table_name, e
                );
            }
        }
    }
}

/// A lazy iterator over the records named by a result bitmap.
///
/// The matching record IDs are snapshotted at construction and drained
/// last-in-first-out; each step fetches the containing heap page, copies the
/// record's bytes out, and unpins the page clean. Iteration order is not
/// part of the contract.
pub struct RecordIterator {
    /// Remaining record IDs, popped from the back.
    record_ids: Vec<RecordIdT>,
    buffer_pool: Arc<BufferPoolManager>,
    record_size: usize,
    records_per_page: u64,
}

impl RecordIterator {
    fn new(bitmap: Bitmap, buffer_pool: Arc<BufferPoolManager>, record_size: usize) -> Self {
        Self {
            record_ids: bitmap.iter().collect(),
            buffer_pool,
            record_size,
            records_per_page: (PAGE_SIZE as usize / record_size) as u64,
        }
    }

    fn read_record(&self, record_id: RecordIdT) -> Result<Record, EngineError> {
        let page_id = (record_id / self.records_per_page) as PageIdT;
        let slot = (record_id % self.records_per_page) as usize;

        let frame = self.buffer_pool.fetch_page(FileType::Table, page_id)?;
        let data = {
            let page = frame.data();
            page[slot * self.record_size..(slot + 1) * self.record_size].to_vec()
        };
        self.buffer_pool.unpin_page(FileType::Table, page_id, false);

        Ok(Record::new(record_id, data))
    }
}

impl Iterator for RecordIterator {
    type Item = Result<Record, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let record_id = self.record_ids.pop()?;
        Some(self.read_record(record_id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.record_ids.len(), Some(self.record_ids.len()))
    }
}

impl ExactSizeIterator for RecordIterator {}

/// Helpers for tokenizing the whitespace-separated metadata file.
fn next_token<'a>(tokens: &mut SplitWhitespace<'a>) -> Result<&'a str, EngineError> {
    tokens
        .next()
        .ok_or_else(|| EngineError::Metadata("unexpected end of metadata file".to_string()))
}

fn parse_token<T: std::str::FromStr>(tokens: &mut SplitWhitespace) -> Result<T, EngineError> {
    let token = next_token(tokens)?;
    token
        .parse()
        .map_err(|_| EngineError::Metadata(format!("malformed metadata token {:?}", token)))
}

/// Custom errors to be used by the index manager. The manager performs no
/// recovery; every failure surfaces to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error to be thrown when a bitmap position is addressed beyond the
    /// record ID space. Indicates an engine bug rather than caller misuse.
    #[error(transparent)]
    Bitmap(#[from] BitmapError),

    /// Error to be thrown when a stored bitmap fails to decode.
    #[error("failed to decode stored bitmap: {0}")]
    Codec(#[from] CodecError),

    /// Error to be thrown when the buffer pool cannot complete a page
    /// operation.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Error to be thrown when reading or writing the metadata file fails.
    #[error("metadata file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error to be thrown when the metadata file is structurally invalid.
    #[error("malformed metadata file: {0}")]
    Metadata(String),

    /// Error to be thrown when a postfix condition list does not reduce to
    /// exactly one bitmap.
    #[error("postfix condition list is malformed")]
    MalformedCondition,

    /// Error to be thrown when a condition names an attribute that no
    /// record has ever carried.
    #[error("no index exists for attribute {0:?}")]
    UnknownAttribute(String),
}
