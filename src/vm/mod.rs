//! Demand-Paged Virtual Memory Subsystem
//!
//! Gives every process a private address space backed by a small shared pool
//! of physical frames and a swap store:
//! - entry: translation entries, the authoritative page records
//! - frame: physical memory and the free-frame pool
//! - inverted: system-wide (pid, vpn) index used to pick victims
//! - page_table: per-process vpn -> entry maps
//! - policy: replacement policies
//! - swap: keyed backing store for evicted dirty pages
//! - tlb: hardware translation cache and its per-process shadow
//! - loader: executable image capability
//! - fault: page fault resolution
//! - memory: state behind the memory lock, eviction and teardown
//! - address_space: per-process layout and the process-side handle
//! - manager: the kernel-wide manager tying it all together

pub mod address_space;
pub mod entry;
pub mod fault;
pub mod frame;
pub mod inverted;
pub mod loader;
pub mod manager;
pub mod memory;
pub mod page_table;
pub mod policy;
pub mod swap;
pub mod tlb;

pub use address_space::{AddressLayout, AddressSpace, ProcessVm};
pub use entry::{EntryFlags, EntryRef, EntrySnapshot, TranslationEntry};
pub use fault::{AccessType, FaultKind, FaultOutcome, FaultState, FaultStats, FaultStatsSnapshot};
pub use frame::{FrameAllocator, PhysicalMemory};
pub use inverted::InvertedPageTable;
pub use loader::{LazyLoader, LoadError, Section, SectionImage};
pub use manager::{ExitReport, MemorySnapshot, Translation, VirtualMemoryManager};
pub use page_table::{PageTable, SharedPageTable};
pub use policy::{EvictionPolicy, PolicyKind, ReplacementPolicy};
pub use swap::{RamSwapDevice, SwapDevice, SwapStore};
pub use tlb::{ShadowArray, Tlb, TlbShadow};

use crate::error::VmError;
use crate::types::Vpn;

// ============================================================================
// Constants
// ============================================================================

/// Page size of the simulated processor
pub const PAGE_SIZE: usize = 1024;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 10;

/// Pages in one 32-bit address space
pub const MAX_PAGES: u32 = 1 << (32 - PAGE_SHIFT);

/// First address past the end of every address space
pub const VADDR_LIMIT: u64 = (MAX_PAGES as u64) << PAGE_SHIFT;

/// Virtual page containing an address
pub fn addr_to_page(addr: u64) -> Result<Vpn, VmError> {
    if addr >= VADDR_LIMIT {
        return Err(VmError::BadAddress(addr));
    }
    Ok(Vpn((addr >> PAGE_SHIFT) as u32))
}

/// First address of a virtual page
pub const fn page_to_addr(vpn: Vpn) -> u64 {
    (vpn.0 as u64) << PAGE_SHIFT
}

/// Offset of an address within its page
pub const fn page_offset(addr: u64) -> usize {
    (addr as usize) & (PAGE_SIZE - 1)
}

/// Pages needed to hold `bytes`
pub const fn pages_for(bytes: usize) -> u32 {
    ((bytes + PAGE_SIZE - 1) / PAGE_SIZE) as u32
}
