//! The object dictionary: the addressable attribute store of a node,
//! keyed by 16-bit index and 8-bit sub-index.

mod entry;

pub use entry::{ObjData, ObjFlags, ObjKey, ObjectEntry};

use crate::hal::CoError;
use alloc::vec::Vec;

/// Ordered sequence of object entries with O(log n) lookup.
///
/// Entries are kept sorted by `(index, sub)`; the ordering is fixed once
/// the owning node is created. Lookups never mutate the dictionary.
pub struct ObjectDictionary {
    entries: Vec<ObjectEntry>,
}

impl ObjectDictionary {
    /// Creates an empty dictionary.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts an entry, keeping the sequence sorted. An entry with the
    /// same key replaces the previous one.
    pub fn add(&mut self, entry: ObjectEntry) {
        match self.entries.binary_search_by_key(&entry.key, |e| e.key) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    /// Finds the entry position for a key. Distinguishes a completely
    /// unknown index from a known index with a missing sub-index.
    pub fn find(&self, key: ObjKey) -> Result<usize, CoError> {
        match self.entries.binary_search_by_key(&key, |e| e.key) {
            Ok(pos) => Ok(pos),
            Err(pos) => {
                let index_present = self.entries.get(pos).is_some_and(|e| e.key.index == key.index)
                    || (pos > 0 && self.entries[pos - 1].key.index == key.index);
                if index_present {
                    Err(CoError::SubIdxNotFound)
                } else {
                    Err(CoError::ObjNotFound)
                }
            }
        }
    }

    /// Returns the entry for a key.
    pub fn entry(&self, key: ObjKey) -> Result<&ObjectEntry, CoError> {
        self.find(key).map(|pos| &self.entries[pos])
    }

    /// Returns the entry for a key, mutable.
    pub fn entry_mut(&mut self, key: ObjKey) -> Result<&mut ObjectEntry, CoError> {
        self.find(key).map(move |pos| &mut self.entries[pos])
    }

    /// True when an entry with this key exists.
    pub fn contains(&self, key: ObjKey) -> bool {
        self.find(key).is_ok()
    }

    /// Number of sub-entries (sub-index >= 1) present for an index.
    pub fn sub_count(&self, index: u16) -> usize {
        self.entries
            .iter()
            .filter(|e| e.key.index == index && e.key.sub > 0)
            .count()
    }

    /// Raw scalar read without access checks.
    pub fn value(&self, key: ObjKey) -> Result<u32, CoError> {
        self.entry(key)?.as_u32().ok_or(CoError::ObjRead)
    }

    /// Raw scalar write without access checks.
    pub fn set_value(&mut self, key: ObjKey, value: u32) -> Result<(), CoError> {
        self.entry_mut(key)?.set_u32(value)
    }
}

impl Default for ObjectDictionary {
    fn default() -> Self {
        Self::new()
    }
}
