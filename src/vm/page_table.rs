//! Per-Process Page Tables

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::entry::EntryRef;
use super::frame::FrameAllocator;
use crate::error::VmError;
use crate::types::{Pid, Vpn};

/// A page table shared between its process and the eviction path
pub type SharedPageTable = Arc<Mutex<PageTable>>;

/// Map from virtual page to translation entry for one process
///
/// Grows lazily, one entry per faulted page. Only the owning process's fault
/// path installs entries; eviction on behalf of another process removes them
/// while holding the memory lock.
#[derive(Debug)]
pub struct PageTable {
    pid: Pid,
    entries: BTreeMap<Vpn, EntryRef>,
}

impl PageTable {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            entries: BTreeMap::new(),
        }
    }

    /// Create a table ready to be shared with the memory manager
    pub fn shared(pid: Pid) -> SharedPageTable {
        Arc::new(Mutex::new(Self::new(pid)))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Look up an entry
    pub fn lookup(&self, vpn: Vpn) -> Option<&EntryRef> {
        self.entries.get(&vpn)
    }

    /// Look up an entry that still maps a frame
    pub fn lookup_valid(&self, vpn: Vpn) -> Option<&EntryRef> {
        self.lookup(vpn).filter(|e| e.is_valid())
    }

    /// Install an entry, returning any entry it replaced
    pub fn install(&mut self, vpn: Vpn, entry: EntryRef) -> Option<EntryRef> {
        self.entries.insert(vpn, entry)
    }

    /// Remove an entry
    pub fn remove(&mut self, vpn: Vpn) -> Option<EntryRef> {
        self.entries.remove(&vpn)
    }

    /// Free every frame this table maps and empty it
    ///
    /// Returns the pages that were resident. Stops at the first frame the
    /// allocator refuses; the remaining entries stay in the table.
    pub fn clear(&mut self, frames: &mut FrameAllocator) -> Result<Vec<Vpn>, VmError> {
        let mut released = Vec::with_capacity(self.entries.len());
        while let Some((vpn, entry)) = self.entries.pop_first() {
            if let Err(e) = frames.free(entry.frame()) {
                self.entries.insert(vpn, entry);
                return Err(e);
            }
            entry.invalidate();
            released.push(vpn);
        }
        Ok(released)
    }

    /// Resident pages in ascending order
    pub fn resident_vpns(&self) -> Vec<Vpn> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vpn, &EntryRef)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameNumber;
    use crate::vm::entry::{EntryFlags, TranslationEntry};

    #[test]
    fn test_install_lookup_remove() {
        let mut table = PageTable::new(Pid(1));
        let entry = TranslationEntry::shared(Vpn(3), FrameNumber(0), EntryFlags::empty());
        table.install(Vpn(3), entry.clone());

        assert!(table.lookup_valid(Vpn(3)).is_some());
        entry.invalidate();
        assert!(table.lookup(Vpn(3)).is_some());
        assert!(table.lookup_valid(Vpn(3)).is_none());

        assert!(table.remove(Vpn(3)).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear_frees_frames() {
        let mut frames = FrameAllocator::new(4);
        let mut table = PageTable::new(Pid(2));
        for vpn in 0..3 {
            let frame = frames.allocate().unwrap();
            table.install(
                Vpn(vpn),
                TranslationEntry::shared(Vpn(vpn), frame, EntryFlags::empty()),
            );
        }
        assert_eq!(frames.free_count(), 1);

        let released = table.clear(&mut frames).unwrap();
        assert_eq!(released, [Vpn(0), Vpn(1), Vpn(2)]);
        assert_eq!(frames.free_count(), 4);
        assert!(table.is_empty());
    }

    #[test]
    fn test_clear_stops_on_double_free() {
        let mut frames = FrameAllocator::new(2);
        let mut table = PageTable::new(Pid(2));
        // Frame 1 was never allocated, so freeing it is a double free
        table.install(
            Vpn(0),
            TranslationEntry::shared(Vpn(0), FrameNumber(1), EntryFlags::empty()),
        );
        assert_eq!(
            table.clear(&mut frames),
            Err(VmError::DoubleFree(FrameNumber(1)))
        );
        assert_eq!(table.len(), 1);
        // The refused entry still translates
        assert_eq!(
            table.lookup_valid(Vpn(0)).map(|e| e.frame()),
            Some(FrameNumber(1))
        );
    }
}
