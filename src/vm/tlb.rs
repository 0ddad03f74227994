//! Translation Lookaside Buffer
//!
//! [`Tlb`] models the processor's translation cache: a handful of slots, each
//! a copy of a translation entry, with no process tag. [`TlbShadow`] adds the
//! tag in software and keeps a saved copy of each switched-out process's
//! slots so they can be reinstalled when it runs again.
//!
//! Only the running process ever has live hardware slots. Installs on behalf
//! of a process that is not running go to its saved shadow instead.
//!
//! Slot replacement is round-robin and local to the cache; it has nothing to
//! do with the page replacement policy.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use heapless::Vec as FixedVec;

use super::entry::EntrySnapshot;
use crate::config::MAX_TLB_SIZE;
use crate::types::{PageKey, Pid, Vpn};

/// Saved TLB slots of one process, indexed like the hardware
pub type ShadowArray = FixedVec<Option<EntrySnapshot>, MAX_TLB_SIZE>;

fn empty_shadow(size: usize) -> ShadowArray {
    let mut shadow = ShadowArray::new();
    // size is bounded by MAX_TLB_SIZE at configuration time
    let _ = shadow.resize(size.min(MAX_TLB_SIZE), None);
    shadow
}

// ============================================================================
// Hardware TLB
// ============================================================================

/// Hardware translation cache
#[derive(Debug)]
pub struct Tlb {
    slots: ShadowArray,
}

impl Tlb {
    pub fn new(size: usize) -> Self {
        Self {
            slots: empty_shadow(size),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Read a slot
    pub fn read(&self, slot: usize) -> Option<EntrySnapshot> {
        self.slots.get(slot).copied().flatten()
    }

    /// Write a slot
    pub fn write(&mut self, slot: usize, entry: Option<EntrySnapshot>) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = entry;
        }
    }

    /// Valid slot translating `vpn`
    pub fn find(&self, vpn: Vpn) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(e) if e.vpn == vpn && e.is_valid()))
    }

    /// Invalidate every slot
    pub fn invalidate_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }
}

// ============================================================================
// TLB Shadow
// ============================================================================

/// Process-tagged view of the hardware TLB
#[derive(Debug)]
pub struct TlbShadow {
    hw: Tlb,
    tags: FixedVec<Option<Pid>, MAX_TLB_SIZE>,
    current: Option<Pid>,
    saved: BTreeMap<Pid, ShadowArray>,
    next_victim: usize,
}

impl TlbShadow {
    pub fn new(size: usize) -> Self {
        let hw = Tlb::new(size);
        let mut tags = FixedVec::new();
        let _ = tags.resize(hw.size(), None);
        Self {
            hw,
            tags,
            current: None,
            saved: BTreeMap::new(),
            next_victim: 0,
        }
    }

    /// Process whose mappings are live in hardware
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Number of hardware slots
    pub fn size(&self) -> usize {
        self.hw.size()
    }

    /// Install a copy of an entry for `pid`
    ///
    /// An idle TLB is claimed by the first process that installs into it.
    /// Returns the hardware slot used, or `None` if the copy went to the
    /// process's saved shadow because another process is running.
    pub fn install(&mut self, pid: Pid, entry: EntrySnapshot) -> Option<usize> {
        if self.current.is_none() {
            self.current = Some(pid);
        }

        if self.current == Some(pid) {
            let slot = self.slot_for(entry.vpn);
            self.hw.write(slot, Some(entry));
            self.tags[slot] = Some(pid);
            log::trace!(target: "vm", "tlb[{}] <- {}:{} frame {}", slot, pid, entry.vpn, entry.frame);
            return Some(slot);
        }

        let size = self.hw.size();
        let shadow = self.saved.entry(pid).or_insert_with(|| empty_shadow(size));
        let slot = shadow
            .iter()
            .position(|s| matches!(s, Some(e) if e.vpn == entry.vpn))
            .or_else(|| shadow.iter().position(|s| s.is_none()))
            .unwrap_or(entry.vpn.0 as usize % size);
        shadow[slot] = Some(entry);
        None
    }

    fn slot_for(&mut self, vpn: Vpn) -> usize {
        if let Some(slot) = self.hw.find(vpn) {
            return slot;
        }
        if let Some(slot) = (0..self.hw.size()).find(|&i| self.hw.read(i).is_none()) {
            return slot;
        }
        let slot = self.next_victim;
        self.next_victim = (self.next_victim + 1) % self.hw.size();
        slot
    }

    /// Cached translation for `pid`, if it is running and the page is cached
    pub fn lookup(&self, pid: Pid, vpn: Vpn) -> Option<EntrySnapshot> {
        if self.current != Some(pid) {
            return None;
        }
        let slot = self.hw.find(vpn)?;
        if self.tags[slot] != Some(pid) {
            return None;
        }
        self.hw.read(slot)
    }

    /// Context switch out: copy `pid`'s live slots aside and flush hardware
    pub fn save_and_invalidate(&mut self, pid: Pid) -> ShadowArray {
        if self.current != Some(pid) {
            return self
                .saved
                .get(&pid)
                .cloned()
                .unwrap_or_else(|| empty_shadow(self.hw.size()));
        }

        let mut shadow = empty_shadow(self.hw.size());
        for slot in 0..self.hw.size() {
            if self.tags[slot] == Some(pid) {
                shadow[slot] = self.hw.read(slot);
            }
        }
        self.flush_hardware();
        self.current = None;
        self.saved.insert(pid, shadow.clone());
        log::trace!(target: "vm", "tlb saved for {}", pid);
        shadow
    }

    /// Saved shadow of `pid`, removed from the table
    pub fn take_saved(&mut self, pid: Pid) -> ShadowArray {
        self.saved
            .remove(&pid)
            .unwrap_or_else(|| empty_shadow(self.hw.size()))
    }

    /// Context switch in: reinstall `pid`'s shadow
    ///
    /// Whatever another process left in hardware is saved for it first, so
    /// afterwards every valid slot is tagged `pid`. Returns the pages that
    /// were reinstalled.
    pub fn restore(&mut self, pid: Pid, shadow: ShadowArray) -> Vec<Vpn> {
        if let Some(prev) = self.current {
            if prev != pid {
                self.save_and_invalidate(prev);
            }
        }
        self.flush_hardware();
        self.saved.remove(&pid);
        self.current = Some(pid);
        self.next_victim = 0;

        let mut restored = Vec::new();
        for (slot, entry) in shadow.iter().enumerate().take(self.hw.size()) {
            if let Some(e) = entry.filter(|e| e.is_valid()) {
                self.hw.write(slot, Some(e));
                self.tags[slot] = Some(pid);
                restored.push(e.vpn);
            }
        }
        log::trace!(target: "vm", "tlb restored {} slots for {}", restored.len(), pid);
        restored
    }

    /// Drop every cached copy of one page, live or saved
    pub fn invalidate(&mut self, key: PageKey) -> bool {
        let mut found = false;
        if self.current == Some(key.pid) {
            for slot in 0..self.hw.size() {
                let hit = matches!(self.hw.read(slot), Some(e) if e.vpn == key.vpn);
                if hit && self.tags[slot] == Some(key.pid) {
                    self.hw.write(slot, None);
                    self.tags[slot] = None;
                    found = true;
                }
            }
        }
        if let Some(shadow) = self.saved.get_mut(&key.pid) {
            for entry in shadow.iter_mut() {
                if matches!(entry, Some(e) if e.vpn == key.vpn) {
                    *entry = None;
                    found = true;
                }
            }
        }
        found
    }

    /// Forget everything cached for a terminated process
    pub fn purge(&mut self, pid: Pid) {
        self.saved.remove(&pid);
        if self.current == Some(pid) {
            self.flush_hardware();
            self.current = None;
        }
    }

    /// Owner tag and contents of a hardware slot
    pub fn slot(&self, slot: usize) -> Option<(Pid, EntrySnapshot)> {
        let entry = self.hw.read(slot)?;
        let pid = (*self.tags.get(slot)?)?;
        Some((pid, entry))
    }

    /// Every valid hardware slot with its owner
    pub fn live_slots(&self) -> Vec<(Pid, EntrySnapshot)> {
        (0..self.hw.size()).filter_map(|i| self.slot(i)).collect()
    }

    /// Number of valid entries saved for a switched-out process
    pub fn saved_len(&self, pid: Pid) -> usize {
        self.saved
            .get(&pid)
            .map(|s| s.iter().filter(|e| e.is_some()).count())
            .unwrap_or(0)
    }

    fn flush_hardware(&mut self) {
        self.hw.invalidate_all();
        for tag in self.tags.iter_mut() {
            *tag = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameNumber;
    use crate::vm::entry::EntryFlags;

    fn snap(vpn: u32, frame: u32) -> EntrySnapshot {
        EntrySnapshot {
            vpn: Vpn(vpn),
            frame: FrameNumber(frame),
            flags: EntryFlags::VALID,
        }
    }

    #[test]
    fn test_round_robin_replacement() {
        let mut tlb = TlbShadow::new(2);
        let a = Pid(1);
        assert_eq!(tlb.install(a, snap(0, 0)), Some(0));
        assert_eq!(tlb.install(a, snap(1, 1)), Some(1));
        assert_eq!(tlb.install(a, snap(2, 2)), Some(0));
        assert_eq!(tlb.install(a, snap(3, 3)), Some(1));
        // Reinstalling a cached page reuses its slot
        assert_eq!(tlb.install(a, snap(3, 3)), Some(1));
        assert!(tlb.lookup(a, Vpn(0)).is_none());
        assert_eq!(tlb.lookup(a, Vpn(2)).map(|e| e.frame), Some(FrameNumber(2)));
    }

    #[test]
    fn test_switch_isolates_processes() {
        let mut tlb = TlbShadow::new(4);
        let (a, b) = (Pid(1), Pid(2));
        tlb.install(a, snap(0, 5));
        tlb.install(a, snap(1, 6));

        let shadow = tlb.save_and_invalidate(a);
        assert_eq!(shadow.iter().filter(|s| s.is_some()).count(), 2);
        assert!(tlb.live_slots().is_empty());

        let saved_b = tlb.take_saved(b);
        let restored = tlb.restore(b, saved_b);
        assert!(restored.is_empty());
        assert!(tlb.lookup(b, Vpn(0)).is_none());
        assert!(tlb.lookup(a, Vpn(0)).is_none());

        tlb.install(b, snap(0, 9));
        assert!(tlb.live_slots().iter().all(|(pid, _)| *pid == b));

        let saved_a = tlb.take_saved(a);
        let restored = tlb.restore(a, saved_a);
        assert_eq!(restored, [Vpn(0), Vpn(1)]);
        assert_eq!(tlb.lookup(a, Vpn(0)).map(|e| e.frame), Some(FrameNumber(5)));
        assert!(tlb.live_slots().iter().all(|(pid, _)| *pid == a));
        // b's live slot was saved when a switched in
        assert_eq!(tlb.saved_len(b), 1);
    }

    #[test]
    fn test_install_for_idle_process_goes_to_shadow() {
        let mut tlb = TlbShadow::new(2);
        tlb.install(Pid(1), snap(0, 0));
        assert_eq!(tlb.install(Pid(2), snap(7, 3)), None);
        assert_eq!(tlb.saved_len(Pid(2)), 1);
        assert!(tlb.lookup(Pid(2), Vpn(7)).is_none());
    }

    #[test]
    fn test_invalidate_live_and_saved() {
        let mut tlb = TlbShadow::new(2);
        let (a, b) = (Pid(1), Pid(2));
        tlb.install(a, snap(4, 1));
        tlb.install(b, snap(4, 2));

        assert!(tlb.invalidate(PageKey::new(a, Vpn(4))));
        assert!(tlb.lookup(a, Vpn(4)).is_none());
        assert!(tlb.invalidate(PageKey::new(b, Vpn(4))));
        assert_eq!(tlb.saved_len(b), 0);
        assert!(!tlb.invalidate(PageKey::new(b, Vpn(4))));
    }

    #[test]
    fn test_purge_running_process() {
        let mut tlb = TlbShadow::new(2);
        tlb.install(Pid(3), snap(0, 0));
        tlb.purge(Pid(3));
        assert_eq!(tlb.current(), None);
        assert!(tlb.live_slots().is_empty());
    }
}
