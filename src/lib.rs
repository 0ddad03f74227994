//! demand_vm - demand-paged virtual memory for a teaching kernel
//!
//! Gives each process a private address space backed by a small shared pool
//! of physical frames, a swap store for evicted dirty pages, and a software
//! tagged TLB that survives context switches.
//!
//! The kernel builds one [`VirtualMemoryManager`] at boot and hands it to
//! every process through an [`AddressSpace`] handle.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel code often needs explicit casts between page and address widths
#![allow(clippy::unnecessary_cast)]
// Manual ceiling division is clearer in page arithmetic
#![allow(clippy::manual_div_ceil)]

extern crate alloc;

// Core types
pub mod types;

pub mod config;
pub mod console;
pub mod error;
pub mod vm;

pub use config::VmConfig;
pub use error::{ConfigError, Severity, SwapError, VmError};
pub use types::{FrameNumber, PageKey, Pid, Vpn};
pub use vm::{AccessType, AddressSpace, PolicyKind, VirtualMemoryManager, PAGE_SIZE};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = "demand_vm";

/// Install the kernel console as the log sink
///
/// Returns false if another logger was installed first.
pub fn init(level: log::LevelFilter) -> bool {
    console::init(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "demand_vm");
        assert!(!VERSION.is_empty());
    }
}
