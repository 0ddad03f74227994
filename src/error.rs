//! Error taxonomy for the paging subsystem
//!
//! Every error carries a [`Severity`] so callers can tell a failed syscall
//! from a process that must be killed or a kernel that must stop.

use thiserror::Error;

use crate::types::{FrameNumber, PageKey, Pid};

/// How far an error reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The operation failed; the caller gets an error code and carries on
    Recoverable,
    /// The faulting process cannot continue and must be terminated
    ProcessFatal,
    /// Shared paging structures are inconsistent; the kernel cannot continue
    KernelFatal,
}

/// Swap store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwapError {
    /// The backing device failed to transfer a slot
    #[error("swap device I/O failed on slot {slot}")]
    Io { slot: usize },
    /// A bounded store has no room for another page
    #[error("swap space exhausted ({capacity} slots)")]
    Full { capacity: usize },
    /// A read was issued for a page that was never written out
    #[error("no swap slot for {0}")]
    Missing(PageKey),
}

/// Configuration validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("physical memory must have at least one frame")]
    NoFrames,
    #[error("TLB size {0} is outside 1..={max}", max = crate::config::MAX_TLB_SIZE)]
    TlbSize(usize),
    #[error("stack must span at least one page")]
    NoStack,
    #[error("stack of {0} pages exceeds {max}", max = crate::config::MAX_STACK_PAGES)]
    StackTooLarge(u32),
    #[error("bounded swap store needs a non-zero capacity")]
    ZeroSwap,
}

/// Paging subsystem errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("frame {0} is already free")]
    DoubleFree(FrameNumber),
    #[error("frame {0} is outside physical memory")]
    InvalidFrame(FrameNumber),
    #[error("unknown process {0}")]
    UnknownProcess(Pid),
    #[error("process {0} already has an address space")]
    DuplicateProcess(Pid),
    #[error("page {0} is neither swapped, anonymous nor image-backed")]
    UnmappedPage(PageKey),
    #[error("address {0:#x} is outside every address space")]
    BadAddress(u64),
    #[error("{image_pages} image pages and {stack_pages} stack pages do not fit an address space")]
    LayoutOverflow { image_pages: u32, stack_pages: u32 },
    #[error("write to read-only page {0}")]
    ReadOnly(PageKey),
    #[error("image load failed for page {0}")]
    ImageLoad(PageKey),
    #[error("no heap segment starts at {0:#x}")]
    UnknownSegment(u64),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no resident page to evict while the frame pool is exhausted")]
    NoEvictionCandidate,
    #[error("frame accounting violated: {free} free + {resident} resident + {in_flight} in flight != {total}")]
    AccountingViolation {
        free: usize,
        resident: usize,
        in_flight: usize,
        total: usize,
    },
    #[error("frame {0} is mapped by more than one page")]
    SharedFrame(FrameNumber),
    #[error("inverted and per-process page tables disagree on {0}")]
    TableMismatch(PageKey),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VmError {
    /// Classify the error
    pub fn severity(&self) -> Severity {
        match self {
            VmError::DoubleFree(_)
            | VmError::InvalidFrame(_)
            | VmError::DuplicateProcess(_)
            | VmError::ImageLoad(_)
            | VmError::UnknownSegment(_)
            | VmError::InvalidArgument
            | VmError::LayoutOverflow { .. }
            | VmError::Config(_) => Severity::Recoverable,
            VmError::Swap(SwapError::Io { .. }) | VmError::Swap(SwapError::Full { .. }) => {
                Severity::Recoverable
            }
            VmError::UnknownProcess(_)
            | VmError::UnmappedPage(_)
            | VmError::BadAddress(_)
            | VmError::ReadOnly(_) => Severity::ProcessFatal,
            VmError::Swap(SwapError::Missing(_))
            | VmError::NoEvictionCandidate
            | VmError::AccountingViolation { .. }
            | VmError::SharedFrame(_)
            | VmError::TableMismatch(_) => Severity::KernelFatal,
        }
    }

    /// Value handed back to user code when a syscall fails with this error
    pub fn syscall_code(&self) -> i32 {
        match self {
            VmError::UnmappedPage(_)
            | VmError::BadAddress(_)
            | VmError::ReadOnly(_)
            | VmError::UnknownSegment(_) => -14,
            VmError::Swap(SwapError::Full { .. }) | VmError::LayoutOverflow { .. } => -12,
            VmError::InvalidArgument => -22,
            _ => -1,
        }
    }

    /// True if the kernel itself must stop
    pub fn is_kernel_fatal(&self) -> bool {
        self.severity() == Severity::KernelFatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vpn;

    #[test]
    fn test_severity() {
        let key = PageKey::new(Pid(1), Vpn(9));
        assert_eq!(VmError::DoubleFree(FrameNumber(2)).severity(), Severity::Recoverable);
        assert_eq!(VmError::UnmappedPage(key).severity(), Severity::ProcessFatal);
        assert_eq!(VmError::NoEvictionCandidate.severity(), Severity::KernelFatal);
        assert_eq!(
            VmError::from(SwapError::Io { slot: 3 }).severity(),
            Severity::Recoverable
        );
        assert!(VmError::from(SwapError::Missing(key)).is_kernel_fatal());
    }

    #[test]
    fn test_syscall_codes() {
        let key = PageKey::new(Pid(1), Vpn(0));
        assert_eq!(VmError::ReadOnly(key).syscall_code(), -14);
        assert_eq!(
            VmError::from(SwapError::Full { capacity: 4 }).syscall_code(),
            -12
        );
        assert_eq!(VmError::DoubleFree(FrameNumber(0)).syscall_code(), -1);
        assert_eq!(VmError::BadAddress(1 << 40).syscall_code(), -14);
    }
}
