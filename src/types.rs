//! Common types used across the paging subsystem
//!
//! Identifiers are small value types so that composite keys can be
//! compared, ordered and hashed without any string handling.

use core::fmt;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

/// Virtual page number (page-granular part of a virtual address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vpn(pub u32);

impl Vpn {
    /// Page number `n` pages above this one
    pub const fn offset(self, n: u32) -> Self {
        Vpn(self.0 + n)
    }
}

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FrameNumber(pub u32);

impl FrameNumber {
    /// Frame number as an index into physical memory
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Composite (process, page) key used by the inverted table, the eviction
/// policy and the swap store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub pid: Pid,
    pub vpn: Vpn,
}

impl PageKey {
    pub const fn new(pid: Pid, vpn: Vpn) -> Self {
        Self { pid, vpn }
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Vpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.vpn)
    }
}
