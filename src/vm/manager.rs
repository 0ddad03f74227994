//! Virtual Memory Manager
//!
//! One [`VirtualMemoryManager`] is built at boot and handed to every process
//! by reference. It owns the two kernel-wide locks:
//! - memory lock: frame pool, inverted table, policy, swap store, and any
//!   cross-process page table change made by eviction or teardown
//! - TLB lock: the hardware TLB and the saved per-process shadows
//!
//! Lock order is memory -> page table -> TLB. The TLB refill fast path takes
//! only page table -> TLB, and nothing waits for the memory lock while it
//! holds the TLB lock. The process registry is only ever held across a
//! memory lock acquisition when a process is created.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use super::address_space::{heap_pages, AddressLayout, ProcessVm};
use super::entry::{EntryFlags, EntryRef, EntrySnapshot};
use super::fault::{self, AccessType, FaultKind, FaultOutcome, FaultStats, FaultStatsSnapshot};
use super::loader::LazyLoader;
use super::memory::MemoryState;
use super::policy::{EvictionPolicy, PolicyKind};
use super::swap::{SwapDevice, SwapStore};
use super::tlb::TlbShadow;
use super::{addr_to_page, page_offset, page_to_addr, PAGE_SHIFT, PAGE_SIZE, VADDR_LIMIT};
use crate::config::VmConfig;
use crate::error::{Severity, VmError};
use crate::types::{FrameNumber, PageKey, Pid, Vpn};

// ============================================================================
// Reports
// ============================================================================

/// What a process gave back when it exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: Pid,
    pub frames_freed: usize,
    pub swap_slots_purged: usize,
}

/// A resolved virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u64,
    pub frame: FrameNumber,
    /// True if the TLB already held the translation
    pub hit: bool,
}

/// Point-in-time view of memory usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_frames: usize,
    pub free_frames: usize,
    pub resident_pages: usize,
    pub swap_slots: usize,
    pub policy: PolicyKind,
    /// Resident page count per live process
    pub resident_by_pid: Vec<(Pid, usize)>,
    pub faults: FaultStatsSnapshot,
}

// ============================================================================
// Manager
// ============================================================================

/// Kernel-wide demand paging manager
pub struct VirtualMemoryManager {
    config: VmConfig,
    memory: Mutex<MemoryState>,
    tlb: Mutex<TlbShadow>,
    processes: RwLock<BTreeMap<Pid, Arc<ProcessVm>>>,
    stats: FaultStats,
}

impl VirtualMemoryManager {
    /// Build a manager with a RAM swap store
    pub fn new(config: VmConfig) -> Result<Arc<Self>, VmError> {
        config.validate()?;
        let swap = SwapStore::new(config.swap_capacity);
        Ok(Self::build(config, swap))
    }

    /// Build a manager swapping to a specific device
    pub fn with_swap_device(
        config: VmConfig,
        device: Box<dyn SwapDevice>,
    ) -> Result<Arc<Self>, VmError> {
        config.validate()?;
        let swap = SwapStore::with_device(device, config.swap_capacity);
        Ok(Self::build(config, swap))
    }

    fn build(config: VmConfig, swap: SwapStore) -> Arc<Self> {
        log::info!(
            target: "vm",
            "vm: {} frames of {} bytes, {} TLB slots, {:?} replacement",
            config.total_frames,
            PAGE_SIZE,
            config.tlb_size,
            config.policy
        );
        Arc::new(Self {
            memory: Mutex::new(MemoryState::new(&config, swap)),
            tlb: Mutex::new(TlbShadow::new(config.tlb_size)),
            processes: RwLock::new(BTreeMap::new()),
            stats: FaultStats::new(),
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> FaultStatsSnapshot {
        self.stats.snapshot()
    }

    fn process(&self, pid: Pid) -> Result<Arc<ProcessVm>, VmError> {
        self.processes
            .read()
            .get(&pid)
            .cloned()
            .ok_or(VmError::UnknownProcess(pid))
    }

    /// Count and log a failed fault or access
    fn failed(&self, key: PageKey, err: VmError) -> VmError {
        self.stats.incr_failures();
        match err.severity() {
            Severity::Recoverable => {
                log::warn!(target: "vm", "access to {} failed: {} (code {})", key, err, err.syscall_code())
            }
            Severity::ProcessFatal => {
                log::warn!(target: "vm", "process {} cannot continue: {}", key.pid, err)
            }
            Severity::KernelFatal => log::error!(target: "vm", "paging state corrupted: {}", err),
        }
        err
    }

    // ========================================================================
    // Process lifecycle
    // ========================================================================

    /// Set up paging for a new process
    pub fn on_process_create(&self, pid: Pid, loader: Box<dyn LazyLoader>) -> Result<(), VmError> {
        let proc = Arc::new(ProcessVm::new(pid, loader, &self.config)?);
        let (image_pages, stack_base) = {
            let layout = proc.layout.lock();
            (layout.image_pages(), layout.stack_base())
        };

        let mut processes = self.processes.write();
        if processes.contains_key(&pid) {
            return Err(VmError::DuplicateProcess(pid));
        }
        self.memory.lock().register(pid, proc.page_table.clone());
        processes.insert(pid, proc);
        log::debug!(
            target: "vm",
            "process {}: {} image pages, stack at page {}",
            pid,
            image_pages,
            stack_base
        );
        Ok(())
    }

    /// Context switch out: save and flush `pid`'s TLB slots
    pub fn on_context_switch_out(&self, pid: Pid) {
        self.tlb.lock().save_and_invalidate(pid);
    }

    /// Context switch in: reinstall `pid`'s saved TLB slots
    ///
    /// Restored pages that are still resident are reported to the policy as
    /// used. Returns how many slots were reinstalled.
    pub fn on_context_switch_in(&self, pid: Pid) -> Result<usize, VmError> {
        self.process(pid)?;
        let restored = {
            let mut tlb = self.tlb.lock();
            let shadow = tlb.take_saved(pid);
            tlb.restore(pid, shadow)
        };

        let mut mem = self.memory.lock();
        for vpn in restored.iter() {
            let key = PageKey::new(pid, *vpn);
            if mem.ipt.contains(key) {
                mem.policy.track_resident(key);
            }
        }
        Ok(restored.len())
    }

    /// Release everything a terminated process holds
    pub fn on_process_exit(&self, pid: Pid) -> Result<ExitReport, VmError> {
        self.processes
            .write()
            .remove(&pid)
            .ok_or(VmError::UnknownProcess(pid))?;

        let teardown = self.memory.lock().teardown(pid, &self.tlb)?;
        let report = ExitReport {
            pid,
            frames_freed: teardown.frames_freed,
            swap_slots_purged: teardown.swap_slots_purged,
        };
        log::debug!(
            target: "vm",
            "process {} exit: {} frames freed, {} swap slots purged",
            pid,
            report.frames_freed,
            report.swap_slots_purged
        );
        Ok(report)
    }

    /// Tear down every process and empty the swap store
    pub fn shutdown(&self) -> Result<Vec<ExitReport>, VmError> {
        let pids: Vec<Pid> = self.processes.read().keys().copied().collect();
        let mut reports = Vec::with_capacity(pids.len());
        for pid in pids {
            reports.push(self.on_process_exit(pid)?);
        }
        let mut mem = self.memory.lock();
        mem.swap.clear();
        mem.assert_accounting(0);
        log::info!(target: "vm", "vm shutdown: {} processes torn down", reports.len());
        Ok(reports)
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Processor entry point for a TLB miss at `vaddr`
    pub fn on_translation_miss(&self, pid: Pid, vaddr: u64) -> Result<FaultOutcome, VmError> {
        let proc = self.process(pid)?;
        let vpn = addr_to_page(vaddr)?;
        let key = PageKey::new(pid, vpn);

        // Resident page: refill without touching the frame pool
        {
            let table = proc.page_table.lock();
            if let Some(entry) = table.lookup_valid(vpn) {
                let frame = entry.frame();
                self.tlb.lock().install(pid, entry.snapshot());
                self.stats.incr_tlb_refills();
                log::trace!(target: "vm", "tlb refill {}", key);
                return Ok(FaultOutcome {
                    kind: FaultKind::TlbRefill,
                    frame,
                });
            }
        }

        let mut mem = self.memory.lock();
        let (entry, kind) = fault::resolve(&mut mem, &self.tlb, &proc, vpn, &self.stats)
            .map_err(|e| self.failed(key, e))?;
        if kind == FaultKind::TlbRefill {
            self.stats.incr_tlb_refills();
        }
        self.tlb.lock().install(pid, entry.snapshot());
        Ok(FaultOutcome {
            kind,
            frame: entry.frame(),
        })
    }

    /// Resolve one page for an access and apply its side effects
    ///
    /// Marks the entry used (and dirty for writes), tells the policy, and
    /// refreshes the TLB copy. Caller holds the memory lock.
    fn access_page(
        &self,
        mem: &mut MemoryState,
        proc: &ProcessVm,
        vpn: Vpn,
        access: AccessType,
    ) -> Result<(EntryRef, FaultKind), VmError> {
        let key = PageKey::new(proc.pid, vpn);
        let (entry, kind) = fault::resolve(mem, &self.tlb, proc, vpn, &self.stats)?;
        if access.is_write() {
            if entry.is_read_only() {
                return Err(VmError::ReadOnly(key));
            }
            entry.set_dirty();
        } else {
            entry.set_used();
        }
        mem.policy.touch(key);
        self.tlb.lock().install(proc.pid, entry.snapshot());
        Ok((entry, kind))
    }

    /// Simulated MMU: translate `vaddr` for `access`, faulting if needed
    pub fn translate(&self, pid: Pid, vaddr: u64, access: AccessType) -> Result<Translation, VmError> {
        let proc = self.process(pid)?;
        let vpn = addr_to_page(vaddr)?;
        let key = PageKey::new(pid, vpn);
        let hit = self.tlb.lock().lookup(pid, vpn).is_some();

        let mut mem = self.memory.lock();
        let (entry, kind) = self
            .access_page(&mut mem, &proc, vpn, access)
            .map_err(|e| self.failed(key, e))?;
        if !hit && kind == FaultKind::TlbRefill {
            self.stats.incr_tlb_refills();
        }

        let frame = entry.frame();
        Ok(Translation {
            paddr: (u64::from(frame.0) << PAGE_SHIFT) | page_offset(vaddr) as u64,
            frame,
            hit,
        })
    }

    // ========================================================================
    // Explicit memory access
    // ========================================================================

    /// Walk `[vaddr, vaddr + len)` page by page under the memory lock
    ///
    /// `f` gets the frame bytes for each piece and the offset of that piece
    /// within the whole range. Returning false stops the walk early.
    fn for_each_piece<F>(
        &self,
        pid: Pid,
        vaddr: u64,
        len: usize,
        access: AccessType,
        mut f: F,
    ) -> Result<usize, VmError>
    where
        F: FnMut(&mut [u8], usize) -> bool,
    {
        let proc = self.process(pid)?;
        let end = vaddr
            .checked_add(len as u64)
            .ok_or(VmError::InvalidArgument)?;
        if vaddr >= VADDR_LIMIT || end > VADDR_LIMIT {
            return Err(VmError::BadAddress(vaddr));
        }

        let mut mem = self.memory.lock();
        let mut addr = vaddr;
        while addr < end {
            let vpn = addr_to_page(addr)?;
            let offset = page_offset(addr);
            let n = (PAGE_SIZE - offset).min((end - addr) as usize);

            let (entry, _) = self
                .access_page(&mut mem, &proc, vpn, access)
                .map_err(|e| self.failed(PageKey::new(pid, vpn), e))?;
            let frame = mem.phys.frame_mut(entry.frame());
            let done = (addr - vaddr) as usize;
            if !f(&mut frame[offset..offset + n], done) {
                return Ok(done + n);
            }
            addr += n as u64;
        }
        Ok(len)
    }

    /// Copy bytes out of a process's address space
    pub fn read_bytes(&self, pid: Pid, vaddr: u64, len: usize) -> Result<Vec<u8>, VmError> {
        // Grows page by page; `len` comes straight from user code
        let mut out = Vec::new();
        self.for_each_piece(pid, vaddr, len, AccessType::Read, |piece, _| {
            out.extend_from_slice(piece);
            true
        })?;
        Ok(out)
    }

    /// Copy bytes into a process's address space
    pub fn write_bytes(&self, pid: Pid, vaddr: u64, data: &[u8]) -> Result<usize, VmError> {
        self.for_each_piece(pid, vaddr, data.len(), AccessType::Write, |piece, done| {
            piece.copy_from_slice(&data[done..done + piece.len()]);
            true
        })
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    ///
    /// The terminator must appear within `max_len + 1` bytes and before the
    /// end of the address space.
    pub fn read_string(&self, pid: Pid, vaddr: u64, max_len: usize) -> Result<String, VmError> {
        let span = max_len.checked_add(1).ok_or(VmError::InvalidArgument)?;
        let span = (span as u64).min(VADDR_LIMIT.saturating_sub(vaddr)) as usize;
        let mut bytes = Vec::new();
        let mut terminated = false;
        self.for_each_piece(pid, vaddr, span, AccessType::Read, |piece, _| {
            match piece.iter().position(|&b| b == 0) {
                Some(nul) => {
                    bytes.extend_from_slice(&piece[..nul]);
                    terminated = true;
                    false
                }
                None => {
                    bytes.extend_from_slice(piece);
                    true
                }
            }
        })?;
        if !terminated {
            return Err(VmError::InvalidArgument);
        }
        String::from_utf8(bytes).map_err(|_| VmError::InvalidArgument)
    }

    // ========================================================================
    // Heap
    // ========================================================================

    /// Reserve a zero-filled heap segment of at least `bytes`
    pub fn allocate_heap(&self, pid: Pid, bytes: usize) -> Result<u64, VmError> {
        let proc = self.process(pid)?;
        let pages = heap_pages(bytes)?;
        let first = proc.layout.lock().reserve_heap(pages)?;
        log::debug!(target: "vm", "process {} heap: {} pages at page {}", pid, pages, first);
        Ok(page_to_addr(first))
    }

    /// Release the heap segment starting at `vaddr`
    ///
    /// Returns how many of its pages were resident.
    pub fn free_heap(&self, pid: Pid, vaddr: u64) -> Result<usize, VmError> {
        let proc = self.process(pid)?;
        if page_offset(vaddr) != 0 {
            return Err(VmError::UnknownSegment(vaddr));
        }
        let first = addr_to_page(vaddr).map_err(|_| VmError::UnknownSegment(vaddr))?;
        let pages = proc
            .layout
            .lock()
            .release_heap(first)
            .ok_or(VmError::UnknownSegment(vaddr))?;

        let mut mem = self.memory.lock();
        let mut released = 0;
        for n in 0..pages {
            if mem.release_page(PageKey::new(pid, first.offset(n)), &self.tlb)? {
                released += 1;
            }
        }
        Ok(released)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Copy of a process's layout
    pub fn layout(&self, pid: Pid) -> Result<AddressLayout, VmError> {
        Ok(self.process(pid)?.layout.lock().clone())
    }

    pub fn is_resident(&self, pid: Pid, vpn: Vpn) -> bool {
        self.memory.lock().ipt.contains(PageKey::new(pid, vpn))
    }

    /// Frame holding a resident page
    pub fn frame_of(&self, pid: Pid, vpn: Vpn) -> Option<FrameNumber> {
        self.memory
            .lock()
            .ipt
            .get(PageKey::new(pid, vpn))
            .map(|e| e.frame())
    }

    /// Flags of a resident page's entry
    pub fn entry_flags(&self, pid: Pid, vpn: Vpn) -> Option<EntryFlags> {
        self.memory
            .lock()
            .ipt
            .get(PageKey::new(pid, vpn))
            .map(|e| e.flags())
    }

    /// Pages mapping a frame
    pub fn owners_of(&self, frame: FrameNumber) -> Vec<PageKey> {
        self.memory.lock().ipt.owners_of(frame)
    }

    pub fn swap_contains(&self, pid: Pid, vpn: Vpn) -> bool {
        self.memory.lock().swap.contains(PageKey::new(pid, vpn))
    }

    pub fn free_frames(&self) -> usize {
        self.memory.lock().frames.free_count()
    }

    /// Resident pages of one process
    pub fn resident_count(&self, pid: Pid) -> usize {
        self.memory.lock().ipt.resident_count(pid)
    }

    /// Valid hardware TLB slots with their owners
    pub fn tlb_slots(&self) -> Vec<(Pid, EntrySnapshot)> {
        self.tlb.lock().live_slots()
    }

    /// Cached translation, as the processor would see it
    pub fn tlb_lookup(&self, pid: Pid, vpn: Vpn) -> Option<EntrySnapshot> {
        self.tlb.lock().lookup(pid, vpn)
    }

    pub fn tlb_owner(&self) -> Option<Pid> {
        self.tlb.lock().current()
    }

    /// Memory usage summary
    pub fn snapshot(&self) -> MemorySnapshot {
        let pids: Vec<Pid> = self.processes.read().keys().copied().collect();
        let mem = self.memory.lock();
        MemorySnapshot {
            total_frames: mem.frames.total(),
            free_frames: mem.frames.free_count(),
            resident_pages: mem.ipt.len(),
            swap_slots: mem.swap.len(),
            policy: mem.policy.kind(),
            resident_by_pid: pids
                .into_iter()
                .map(|pid| (pid, mem.ipt.resident_count(pid)))
                .collect(),
            faults: self.stats.snapshot(),
        }
    }

    /// Check every structural invariant
    pub fn check_invariants(&self) -> Result<(), VmError> {
        let mem = self.memory.lock();
        mem.check_accounting(0)?;
        mem.check_exclusive()?;
        mem.check_tables()
    }
}
