/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

use crate::common::RecordIdT;

/// A database record: a fixed-size byte blob addressed by its record ID.
///
/// The engine never interprets the bytes; the attribute-to-byte-layout
/// mapping belongs to the caller's `RecordFormat`. Liveness is authoritative
/// in the engine's existence bitmap, not in the blob, so a record read for a
/// since-deleted ID holds whatever the heap last stored there.
pub struct Record {
    pub id: RecordIdT,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(id: RecordIdT, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The record interface the engine consumes: a fixed record size and the
/// ability to materialize attribute values into a record's slot bytes.
///
/// `floor(PAGE_SIZE / record_size())` records are packed per heap page.
/// Attribute names outside the format's layout are ignored here; the engine
/// still indexes them. Attributes whose range predicates rely on numeric
/// order must be presented as fixed-width zero-padded decimal strings, since
/// index keys compare lexicographically.
pub trait RecordFormat {
    /// Fixed record size in bytes. Must be positive and at most PAGE_SIZE.
    fn record_size(&self) -> usize;

    /// Write the all-null record into a fresh slot.
    fn init_record(&self, slot: &mut [u8]);

    /// Encode one named attribute value into the slot bytes.
    fn write_value(&self, slot: &mut [u8], name: &str, value: &str);
}
