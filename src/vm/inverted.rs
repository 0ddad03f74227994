//! Inverted Page Table
//!
//! System-wide index from (pid, vpn) to the translation entry held by the
//! owning process's page table. The frame pool is shared, so victims are
//! picked across every process through this table rather than by walking
//! each page table.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::entry::EntryRef;
use crate::types::{FrameNumber, PageKey, Pid};

/// Reverse index of every resident page
#[derive(Debug, Default)]
pub struct InvertedPageTable {
    entries: BTreeMap<PageKey, EntryRef>,
}

impl InvertedPageTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register an entry, returning any entry it replaced
    pub fn set(&mut self, key: PageKey, entry: EntryRef) -> Option<EntryRef> {
        self.entries.insert(key, entry)
    }

    /// Look up a resident page
    pub fn get(&self, key: PageKey) -> Option<&EntryRef> {
        self.entries.get(&key)
    }

    /// Drop a page from the index
    pub fn remove(&mut self, key: PageKey) -> Option<EntryRef> {
        self.entries.remove(&key)
    }

    /// Check if a page is resident
    pub fn contains(&self, key: PageKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Every page currently mapping a frame
    ///
    /// More than one owner means the frame pool is corrupted.
    pub fn owners_of(&self, frame: FrameNumber) -> Vec<PageKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.frame() == frame)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Resident pages of one process
    pub fn keys_of(&self, pid: Pid) -> Vec<PageKey> {
        self.entries
            .range(PageKey::new(pid, crate::types::Vpn(0))..)
            .take_while(|(k, _)| k.pid == pid)
            .map(|(k, _)| *k)
            .collect()
    }

    /// Number of resident pages of one process
    pub fn resident_count(&self, pid: Pid) -> usize {
        self.keys_of(pid).len()
    }

    /// Number of resident pages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all resident pages
    pub fn iter(&self) -> impl Iterator<Item = (&PageKey, &EntryRef)> {
        self.entries.iter()
    }
}
