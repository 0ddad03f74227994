//! Page Fault Handling
//!
//! A fault for (pid, vpn) moves through `Miss -> Resolving -> Installed`, or
//! ends in `Fatal`. Resolution classifies the page, takes a frame (evicting
//! if the pool is empty), fills it from swap, zeroes or the image, and
//! registers the new entry with both page tables and the policy.
//!
//! Resolution runs with the memory lock held by the caller; the caller also
//! installs the result into the TLB before releasing it.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::address_space::ProcessVm;
use super::entry::{EntryFlags, EntryRef, TranslationEntry};
use super::memory::MemoryState;
use super::policy::EvictionPolicy;
use super::tlb::TlbShadow;
use crate::error::VmError;
use crate::types::{FrameNumber, PageKey, Vpn};

// ============================================================================
// Fault Types
// ============================================================================

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    pub fn is_write(&self) -> bool {
        matches!(self, AccessType::Write)
    }
}

/// How a fault was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Page was resident; only the TLB copy was missing
    TlbRefill,
    /// Page read back from swap
    SwapIn,
    /// Fresh stack, argument or heap page
    ZeroFill,
    /// Page rebuilt from the executable image
    ImageLoad,
}

/// Result of a translation miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultOutcome {
    pub kind: FaultKind,
    pub frame: FrameNumber,
}

/// Fault state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultState {
    /// Translation missing
    Miss,
    /// Frame being found and filled
    Resolving,
    /// Entry registered and cached
    Installed,
    /// Fault cannot be resolved
    Fatal,
}

impl FaultState {
    /// Check if a transition is legal
    pub fn can_transition(self, next: FaultState) -> bool {
        matches!(
            (self, next),
            (FaultState::Miss, FaultState::Resolving)
                | (FaultState::Miss, FaultState::Installed)
                | (FaultState::Miss, FaultState::Fatal)
                | (FaultState::Resolving, FaultState::Installed)
                | (FaultState::Resolving, FaultState::Fatal)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FaultState::Installed | FaultState::Fatal)
    }
}

/// Tracks one fault through its states
#[derive(Debug)]
pub struct FaultContext {
    pub key: PageKey,
    state: FaultState,
}

impl FaultContext {
    pub fn new(key: PageKey) -> Self {
        Self {
            key,
            state: FaultState::Miss,
        }
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    /// Move to the next state
    pub fn advance(&mut self, next: FaultState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal fault transition {:?} -> {:?} for {}",
            self.state,
            next,
            self.key
        );
        self.state = next;
    }

    /// Mark the fault fatal and hand the error back
    pub fn fail(&mut self, err: VmError) -> VmError {
        self.advance(FaultState::Fatal);
        err
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault and paging counters
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Faults that needed a frame
    pub total: AtomicU64,
    /// Misses satisfied from the page table
    pub tlb_refills: AtomicU64,
    pub swap_ins: AtomicU64,
    pub zero_fills: AtomicU64,
    pub image_loads: AtomicU64,
    pub evictions: AtomicU64,
    /// Evictions that wrote the victim to swap
    pub swap_outs: AtomicU64,
    /// Faults or accesses that failed
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            tlb_refills: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            zero_fills: AtomicU64::new(0),
            image_loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_tlb_refills(&self) {
        self.tlb_refills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_evictions(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_swap_outs(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a resolved fault by kind
    pub fn record(&self, kind: FaultKind) {
        let counter = match kind {
            FaultKind::TlbRefill => &self.tlb_refills,
            FaultKind::SwapIn => &self.swap_ins,
            FaultKind::ZeroFill => &self.zero_fills,
            FaultKind::ImageLoad => &self.image_loads,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get statistics snapshot
    pub fn snapshot(&self) -> FaultStatsSnapshot {
        FaultStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            tlb_refills: self.tlb_refills.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
            image_loads: self.image_loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Fault statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultStatsSnapshot {
    pub total: u64,
    pub tlb_refills: u64,
    pub swap_ins: u64,
    pub zero_fills: u64,
    pub image_loads: u64,
    pub evictions: u64,
    pub swap_outs: u64,
    pub failures: u64,
}

// ============================================================================
// Resolution
// ============================================================================

/// Decide where a non-resident page comes from
///
/// Swap wins over the image so that written `.data` pages come back with
/// their new contents.
pub(crate) fn classify(mem: &MemoryState, proc: &ProcessVm, vpn: Vpn) -> Option<FaultKind> {
    let key = PageKey::new(proc.pid, vpn);
    if mem.swap.contains(key) {
        Some(FaultKind::SwapIn)
    } else if proc.is_anonymous(vpn) {
        Some(FaultKind::ZeroFill)
    } else if proc.loader.is_image_backed(vpn) {
        Some(FaultKind::ImageLoad)
    } else {
        None
    }
}

/// Resolve a fault for one page of `proc`
///
/// Returns the authoritative entry and how it was obtained. A page that is
/// already resident comes back as [`FaultKind::TlbRefill`] without touching
/// the frame pool; counting refills is left to the caller.
pub(crate) fn resolve(
    mem: &mut MemoryState,
    tlb: &Mutex<TlbShadow>,
    proc: &ProcessVm,
    vpn: Vpn,
    stats: &FaultStats,
) -> Result<(EntryRef, FaultKind), VmError> {
    let key = PageKey::new(proc.pid, vpn);
    let mut ctx = FaultContext::new(key);

    if let Some(entry) = proc.page_table.lock().lookup_valid(vpn).cloned() {
        ctx.advance(FaultState::Installed);
        return Ok((entry, FaultKind::TlbRefill));
    }

    stats.incr_total();
    let Some(kind) = classify(mem, proc, vpn) else {
        log::error!(target: "vm", "fault on {}: page is not swapped, anonymous or in the image", key);
        return Err(ctx.fail(VmError::UnmappedPage(key)));
    };
    ctx.advance(FaultState::Resolving);

    let frame = mem
        .allocate_frame(tlb, stats)
        .map_err(|e| ctx.fail(e))?;

    let flags = match populate(mem, proc, key, kind, frame) {
        Ok(flags) => flags,
        Err(e) => {
            mem.frames.free(frame)?;
            return Err(ctx.fail(e));
        }
    };

    let entry = TranslationEntry::shared(vpn, frame, flags);
    proc.page_table.lock().install(vpn, entry.clone());
    mem.ipt.set(key, entry.clone());
    mem.policy.track_resident(key);
    mem.assert_accounting(0);

    ctx.advance(FaultState::Installed);
    stats.record(kind);
    log::debug!(target: "vm", "fault {} -> frame {} ({:?})", key, frame, kind);
    Ok((entry, kind))
}

/// Fill a freshly allocated frame and work out the entry's flags
fn populate(
    mem: &mut MemoryState,
    proc: &ProcessVm,
    key: PageKey,
    kind: FaultKind,
    frame: FrameNumber,
) -> Result<EntryFlags, VmError> {
    let vpn = key.vpn;
    let mut protection = EntryFlags::empty();
    if proc.loader.is_image_backed(vpn) {
        if proc.loader.is_read_only(vpn) {
            protection = protection.union(EntryFlags::READ_ONLY);
        }
        if proc.loader.is_executable(vpn) {
            protection = protection.union(EntryFlags::EXECUTABLE);
        }
    }

    match kind {
        FaultKind::SwapIn => {
            mem.swap.read(key, mem.phys.frame_mut(frame))?;
            Ok(protection)
        }
        FaultKind::ZeroFill => {
            mem.phys.zero(frame);
            Ok(EntryFlags::empty())
        }
        FaultKind::ImageLoad => {
            proc.loader
                .load_into(vpn, mem.phys.frame_mut(frame))
                .map_err(|e| {
                    log::warn!(target: "vm", "image load of {} failed: {}", key, e);
                    VmError::ImageLoad(key)
                })?;
            Ok(protection.union(EntryFlags::IMAGE_BACKED))
        }
        FaultKind::TlbRefill => Ok(protection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::types::Pid;
    use crate::vm::loader::SectionImage;
    use crate::vm::swap::SwapStore;
    use alloc::boxed::Box;

    fn setup(frames: usize) -> (MemoryState, Mutex<TlbShadow>, ProcessVm) {
        let config = VmConfig::default().with_frames(frames).with_stack_pages(2);
        let mut mem = MemoryState::new(&config, SwapStore::new(None));
        let proc = ProcessVm::new(Pid(1), Box::new(SectionImage::patterned(2, true)), &config).unwrap();
        mem.register(proc.pid, proc.page_table.clone());
        (mem, Mutex::new(TlbShadow::new(config.tlb_size)), proc)
    }

    #[test]
    fn test_fault_state_transitions() {
        assert!(FaultState::Miss.can_transition(FaultState::Resolving));
        assert!(FaultState::Resolving.can_transition(FaultState::Installed));
        assert!(FaultState::Miss.can_transition(FaultState::Fatal));
        assert!(!FaultState::Installed.can_transition(FaultState::Resolving));
        assert!(!FaultState::Fatal.can_transition(FaultState::Installed));
        assert!(FaultState::Fatal.is_terminal());
    }

    #[test]
    fn test_resolve_image_then_refill() {
        let (mut mem, tlb, proc) = setup(4);
        let stats = FaultStats::new();

        let (entry, kind) = resolve(&mut mem, &tlb, &proc, Vpn(1), &stats).unwrap();
        assert_eq!(kind, FaultKind::ImageLoad);
        assert!(entry.is_read_only());
        assert!(entry.is_image_backed());
        assert!(mem.phys.frame(entry.frame()).iter().all(|&b| b == 1));

        let (again, kind) = resolve(&mut mem, &tlb, &proc, Vpn(1), &stats).unwrap();
        assert_eq!(kind, FaultKind::TlbRefill);
        assert_eq!(again.frame(), entry.frame());
        assert_eq!(stats.snapshot().image_loads, 1);
        assert_eq!(stats.snapshot().total, 1);
    }

    #[test]
    fn test_resolve_stack_zero_fills() {
        let (mut mem, tlb, proc) = setup(4);
        let stats = FaultStats::new();

        let (entry, kind) = resolve(&mut mem, &tlb, &proc, Vpn(2), &stats).unwrap();
        assert_eq!(kind, FaultKind::ZeroFill);
        assert!(!entry.is_read_only());
        assert!(!entry.is_image_backed());
        assert!(mem.phys.frame(entry.frame()).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_resolve_unmapped_is_fatal() {
        let (mut mem, tlb, proc) = setup(4);
        let stats = FaultStats::new();
        let err = resolve(&mut mem, &tlb, &proc, Vpn(100), &stats).unwrap_err();
        assert_eq!(err, VmError::UnmappedPage(PageKey::new(Pid(1), Vpn(100))));
        assert_eq!(mem.frames.free_count(), 4);
    }

    #[test]
    fn test_swap_wins_over_image() {
        let (mut mem, tlb, proc) = setup(4);
        let stats = FaultStats::new();
        let key = PageKey::new(Pid(1), Vpn(0));
        mem.swap.write(key, &[0x5A; crate::vm::PAGE_SIZE]).unwrap();

        let (entry, kind) = resolve(&mut mem, &tlb, &proc, Vpn(0), &stats).unwrap();
        assert_eq!(kind, FaultKind::SwapIn);
        assert!(!entry.is_dirty());
        assert!(!entry.is_image_backed());
        assert!(mem.phys.frame(entry.frame()).iter().all(|&b| b == 0x5A));
    }
}
