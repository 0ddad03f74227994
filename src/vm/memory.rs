//! Shared Paging State
//!
//! Everything the memory lock protects: physical memory, the free-frame
//! pool, the inverted table, the replacement policy, the swap store and the
//! registry of page tables used to remove victims from their owners.
//!
//! Frame accounting: `free + resident + in_flight == total` at every point
//! where the lock is released. A frame is in flight between being taken
//! from a victim and being installed for the faulting page.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::fault::FaultStats;
use super::frame::{FrameAllocator, PhysicalMemory};
use super::inverted::InvertedPageTable;
use super::page_table::SharedPageTable;
use super::policy::{EvictionPolicy, ReplacementPolicy};
use super::swap::SwapStore;
use super::tlb::TlbShadow;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::types::{FrameNumber, PageKey, Pid};

/// Result of tearing down one process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub frames_freed: usize,
    pub swap_slots_purged: usize,
}

/// State guarded by the memory lock
pub struct MemoryState {
    pub(crate) phys: PhysicalMemory,
    pub(crate) frames: FrameAllocator,
    pub(crate) ipt: InvertedPageTable,
    pub(crate) policy: ReplacementPolicy,
    pub(crate) swap: SwapStore,
    tables: BTreeMap<Pid, SharedPageTable>,
}

impl MemoryState {
    pub fn new(config: &VmConfig, swap: SwapStore) -> Self {
        Self {
            phys: PhysicalMemory::new(config.total_frames),
            frames: FrameAllocator::new(config.total_frames),
            ipt: InvertedPageTable::new(),
            policy: ReplacementPolicy::new(config.policy, config.seed),
            swap,
            tables: BTreeMap::new(),
        }
    }

    /// Make a process's page table reachable from the eviction path
    pub fn register(&mut self, pid: Pid, table: SharedPageTable) {
        self.tables.insert(pid, table);
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        self.tables.contains_key(&pid)
    }

    // ========================================================================
    // Allocation and eviction
    // ========================================================================

    /// Get a frame for a faulting page, evicting if the pool is empty
    ///
    /// The frame comes back in flight: counted neither as free nor resident.
    pub fn allocate_frame(
        &mut self,
        tlb: &Mutex<TlbShadow>,
        stats: &FaultStats,
    ) -> Result<FrameNumber, VmError> {
        if let Some(frame) = self.frames.allocate() {
            self.assert_accounting(1);
            return Ok(frame);
        }
        self.evict(tlb, stats)
    }

    /// Take the frame of a policy-chosen victim
    ///
    /// A failed swap write aborts the eviction with the victim still
    /// resident and every table untouched.
    fn evict(&mut self, tlb: &Mutex<TlbShadow>, stats: &FaultStats) -> Result<FrameNumber, VmError> {
        let Some(victim) = self.policy.choose() else {
            log::error!(target: "vm", "frame pool exhausted with nothing resident to evict");
            return Err(VmError::NoEvictionCandidate);
        };
        let entry = self
            .ipt
            .get(victim)
            .cloned()
            .ok_or(VmError::TableMismatch(victim))?;
        let frame = entry.frame();

        let swapped = entry.is_dirty() && !entry.is_image_backed();
        if swapped {
            self.swap.write(victim, self.phys.frame(frame))?;
            stats.incr_swap_outs();
        }

        // Owner's table first so a concurrent refill cannot re-cache the
        // page after the TLB is cleaned below
        if let Some(table) = self.tables.get(&victim.pid) {
            let mut table = table.lock();
            if table
                .lookup(victim.vpn)
                .is_some_and(|e| Arc::ptr_eq(e, &entry))
            {
                table.remove(victim.vpn);
            }
        }
        entry.invalidate();
        self.ipt.remove(victim);
        tlb.lock().invalidate(victim);
        self.policy.untrack(victim);

        stats.incr_evictions();
        self.assert_accounting(1);
        log::debug!(
            target: "vm",
            "evicted {} from frame {}{}",
            victim,
            frame,
            if swapped { " (swapped)" } else { "" }
        );
        Ok(frame)
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Drop one page entirely: frame, tables, policy, swap and TLB copies
    ///
    /// Returns true if the page was resident.
    pub fn release_page(&mut self, key: PageKey, tlb: &Mutex<TlbShadow>) -> Result<bool, VmError> {
        self.swap.discard(key);
        let Some(entry) = self.ipt.remove(key) else {
            return Ok(false);
        };
        if let Some(table) = self.tables.get(&key.pid) {
            table.lock().remove(key.vpn);
        }
        entry.invalidate();
        tlb.lock().invalidate(key);
        self.policy.untrack(key);
        self.frames.free(entry.frame())?;
        self.assert_accounting(0);
        Ok(true)
    }

    /// Free everything a terminated process holds
    pub fn teardown(&mut self, pid: Pid, tlb: &Mutex<TlbShadow>) -> Result<Teardown, VmError> {
        for key in self.ipt.keys_of(pid) {
            self.ipt.remove(key);
            self.policy.untrack(key);
        }

        let freed = match self.tables.remove(&pid) {
            Some(table) => table.lock().clear(&mut self.frames)?.len(),
            None => 0,
        };
        let purged = self.swap.purge(pid);
        tlb.lock().purge(pid);

        self.assert_accounting(0);
        Ok(Teardown {
            frames_freed: freed,
            swap_slots_purged: purged,
        })
    }

    /// Processes with a registered page table
    pub fn pids(&self) -> Vec<Pid> {
        self.tables.keys().copied().collect()
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Check `free + resident + in_flight == total`
    pub fn check_accounting(&self, in_flight: usize) -> Result<(), VmError> {
        let free = self.frames.free_count();
        let resident = self.ipt.len();
        let total = self.frames.total();
        if free + resident + in_flight != total {
            return Err(VmError::AccountingViolation {
                free,
                resident,
                in_flight,
                total,
            });
        }
        Ok(())
    }

    /// Fatal assertion on frame accounting
    pub fn assert_accounting(&self, in_flight: usize) {
        if let Err(e) = self.check_accounting(in_flight) {
            log::error!(target: "vm", "{}", e);
            panic!("{}", e);
        }
    }

    /// Check that no frame is mapped twice or mapped while free
    pub fn check_exclusive(&self) -> Result<(), VmError> {
        let mut seen = BTreeSet::new();
        for (_, entry) in self.ipt.iter() {
            let frame = entry.frame();
            if !seen.insert(frame) || self.frames.is_free(frame) {
                return Err(VmError::SharedFrame(frame));
            }
        }
        Ok(())
    }

    /// Check that the inverted table, page tables and policy agree
    pub fn check_tables(&self) -> Result<(), VmError> {
        for (key, entry) in self.ipt.iter() {
            let in_table = self
                .tables
                .get(&key.pid)
                .map(|t| t.lock().lookup(key.vpn).is_some_and(|e| Arc::ptr_eq(e, entry)))
                .unwrap_or(false);
            if !in_table || !entry.is_valid() || !self.policy.contains(*key) {
                return Err(VmError::TableMismatch(*key));
            }
        }
        for (pid, table) in self.tables.iter() {
            for (vpn, entry) in table.lock().iter() {
                let key = PageKey::new(*pid, *vpn);
                if entry.is_valid() && !self.ipt.contains(key) {
                    return Err(VmError::TableMismatch(key));
                }
            }
        }
        if self.policy.len() != self.ipt.len() {
            log::error!(
                target: "vm",
                "policy tracks {} pages but {} are resident",
                self.policy.len(),
                self.ipt.len()
            );
            return Err(VmError::AccountingViolation {
                free: self.frames.free_count(),
                resident: self.policy.len(),
                in_flight: 0,
                total: self.frames.total(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vpn;
    use crate::vm::entry::{EntryFlags, TranslationEntry};
    use crate::vm::page_table::PageTable;
    use crate::vm::policy::PolicyKind;
    use crate::vm::tlb::TlbShadow;

    fn state(frames: usize) -> (MemoryState, Mutex<TlbShadow>, SharedPageTable) {
        let config = VmConfig::default()
            .with_frames(frames)
            .with_policy(PolicyKind::Fifo);
        let mut mem = MemoryState::new(&config, SwapStore::new(None));
        let table = PageTable::shared(Pid(1));
        mem.register(Pid(1), table.clone());
        (mem, Mutex::new(TlbShadow::new(4)), table)
    }

    fn map(mem: &mut MemoryState, table: &SharedPageTable, vpn: u32, frame: FrameNumber, flags: EntryFlags) {
        let key = PageKey::new(Pid(1), Vpn(vpn));
        let entry = TranslationEntry::shared(Vpn(vpn), frame, flags);
        table.lock().install(Vpn(vpn), entry.clone());
        mem.ipt.set(key, entry);
        mem.policy.track_resident(key);
    }

    #[test]
    fn test_evicts_when_pool_empty() {
        let (mut mem, tlb, table) = state(2);
        let stats = FaultStats::new();
        for vpn in 0..2 {
            let frame = mem.allocate_frame(&tlb, &stats).unwrap();
            map(&mut mem, &table, vpn, frame, EntryFlags::IMAGE_BACKED);
        }

        // FIFO: page 0 goes first, clean so nothing is written
        let frame = mem.allocate_frame(&tlb, &stats).unwrap();
        assert_eq!(frame, FrameNumber(0));
        assert!(!mem.ipt.contains(PageKey::new(Pid(1), Vpn(0))));
        assert!(table.lock().lookup(Vpn(0)).is_none());
        assert!(mem.swap.is_empty());
        assert_eq!(mem.check_accounting(1), Ok(()));
        assert_eq!(stats.snapshot().evictions, 1);
    }

    #[test]
    fn test_dirty_victim_is_swapped() {
        let (mut mem, tlb, table) = state(1);
        let stats = FaultStats::new();
        let frame = mem.allocate_frame(&tlb, &stats).unwrap();
        mem.phys.frame_mut(frame).fill(0x33);
        map(&mut mem, &table, 5, frame, EntryFlags::DIRTY);

        mem.allocate_frame(&tlb, &stats).unwrap();
        assert!(mem.swap.contains(PageKey::new(Pid(1), Vpn(5))));
        assert_eq!(stats.snapshot().swap_outs, 1);
    }

    #[test]
    fn test_empty_policy_is_fatal_error() {
        let (mut mem, tlb, _table) = state(1);
        let stats = FaultStats::new();
        // Frame taken but never registered as resident
        let _ = mem.frames.allocate();
        assert_eq!(
            mem.allocate_frame(&tlb, &stats),
            Err(VmError::NoEvictionCandidate)
        );
    }

    #[test]
    fn test_teardown_frees_everything() {
        let (mut mem, tlb, table) = state(4);
        let stats = FaultStats::new();
        for vpn in 0..3 {
            let frame = mem.allocate_frame(&tlb, &stats).unwrap();
            map(&mut mem, &table, vpn, frame, EntryFlags::empty());
        }
        mem.swap.write(PageKey::new(Pid(1), Vpn(9)), &[0; crate::vm::PAGE_SIZE]).unwrap();

        let report = mem.teardown(Pid(1), &tlb).unwrap();
        assert_eq!(report.frames_freed, 3);
        assert_eq!(report.swap_slots_purged, 1);
        assert_eq!(mem.frames.free_count(), 4);
        assert!(mem.policy.is_empty());
        assert!(!mem.is_registered(Pid(1)));
    }

    #[test]
    fn test_release_page() {
        let (mut mem, tlb, table) = state(2);
        let stats = FaultStats::new();
        let frame = mem.allocate_frame(&tlb, &stats).unwrap();
        map(&mut mem, &table, 7, frame, EntryFlags::empty());

        let key = PageKey::new(Pid(1), Vpn(7));
        assert_eq!(mem.release_page(key, &tlb), Ok(true));
        assert_eq!(mem.release_page(key, &tlb), Ok(false));
        assert_eq!(mem.frames.free_count(), 2);
        assert_eq!(mem.check_tables(), Ok(()));
    }

    #[test]
    fn test_invariant_checks_detect_corruption() {
        let (mut mem, tlb, table) = state(2);
        let stats = FaultStats::new();
        let frame = mem.allocate_frame(&tlb, &stats).unwrap();
        map(&mut mem, &table, 0, frame, EntryFlags::empty());
        assert_eq!(mem.check_exclusive(), Ok(()));
        assert_eq!(mem.check_tables(), Ok(()));

        // Second mapping of the same frame
        mem.ipt.set(
            PageKey::new(Pid(1), Vpn(1)),
            TranslationEntry::shared(Vpn(1), frame, EntryFlags::empty()),
        );
        assert_eq!(mem.check_exclusive(), Err(VmError::SharedFrame(frame)));
        assert!(mem.check_accounting(0).is_err());
    }
}
