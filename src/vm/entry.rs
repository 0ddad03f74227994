//! Translation Entries
//!
//! A translation entry is the single source of truth for where a resident
//! page lives and how it may be accessed. The per-process page table owns it;
//! the inverted table holds a second reference to the same allocation, and
//! the TLB only ever holds [`EntrySnapshot`] copies.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::{FrameNumber, Vpn};

// ============================================================================
// Entry Flags
// ============================================================================

/// Translation entry status and protection bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(u32);

impl EntryFlags {
    /// Entry maps a resident frame
    pub const VALID: Self = Self(0x0001);
    /// Writes are refused
    pub const READ_ONLY: Self = Self(0x0002);
    /// Page was referenced since it was loaded
    pub const USED: Self = Self(0x0004);
    /// Page was written since it was loaded or last flushed
    pub const DIRTY: Self = Self(0x0008);
    /// Page holds instructions
    pub const EXECUTABLE: Self = Self(0x0010);
    /// Frame contents can be rebuilt from the executable image
    pub const IMAGE_BACKED: Self = Self(0x0020);

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x003f)
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Translation Entry
// ============================================================================

/// Authoritative record for one resident (pid, vpn)
///
/// The frame is fixed for the lifetime of the entry: a page that is evicted
/// and faulted back in gets a fresh entry. Status bits are atomic so the
/// table lock does not have to be held to mark a page used or dirty.
#[derive(Debug)]
pub struct TranslationEntry {
    vpn: Vpn,
    frame: FrameNumber,
    flags: AtomicU32,
}

/// Shared handle to a translation entry
pub type EntryRef = Arc<TranslationEntry>;

impl TranslationEntry {
    /// Create a valid entry
    pub fn new(vpn: Vpn, frame: FrameNumber, flags: EntryFlags) -> Self {
        Self {
            vpn,
            frame,
            flags: AtomicU32::new(flags.union(EntryFlags::VALID).bits()),
        }
    }

    /// Create a shared valid entry
    pub fn shared(vpn: Vpn, frame: FrameNumber, flags: EntryFlags) -> EntryRef {
        Arc::new(Self::new(vpn, frame, flags))
    }

    pub fn vpn(&self) -> Vpn {
        self.vpn
    }

    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Get entry flags
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set entry flags
    pub fn set_flags(&self, flags: EntryFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// Clear entry flags
    pub fn clear_flags(&self, flags: EntryFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Check if entry has specific flags
    pub fn has_flags(&self, flags: EntryFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn is_valid(&self) -> bool {
        self.has_flags(EntryFlags::VALID)
    }

    pub fn is_read_only(&self) -> bool {
        self.has_flags(EntryFlags::READ_ONLY)
    }

    pub fn is_executable(&self) -> bool {
        self.has_flags(EntryFlags::EXECUTABLE)
    }

    pub fn is_used(&self) -> bool {
        self.has_flags(EntryFlags::USED)
    }

    pub fn is_dirty(&self) -> bool {
        self.has_flags(EntryFlags::DIRTY)
    }

    pub fn is_image_backed(&self) -> bool {
        self.has_flags(EntryFlags::IMAGE_BACKED)
    }

    /// Mark page as referenced
    pub fn set_used(&self) {
        self.set_flags(EntryFlags::USED);
    }

    /// Mark page as written
    ///
    /// A written page no longer matches the image, so it stops being
    /// image-backed and will be flushed to swap when evicted.
    pub fn set_dirty(&self) {
        self.flags.fetch_or(
            EntryFlags::DIRTY.union(EntryFlags::USED).bits(),
            Ordering::SeqCst,
        );
        self.clear_flags(EntryFlags::IMAGE_BACKED);
    }

    /// Drop the mapping; any copy taken afterwards is invalid
    pub fn invalidate(&self) {
        self.clear_flags(EntryFlags::VALID);
    }

    /// Copy for the TLB
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            vpn: self.vpn,
            frame: self.frame,
            flags: self.flags(),
        }
    }
}

/// Point-in-time copy of a translation entry, as held by a TLB slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub vpn: Vpn,
    pub frame: FrameNumber,
    pub flags: EntryFlags,
}

impl EntrySnapshot {
    pub fn is_valid(&self) -> bool {
        self.flags.contains(EntryFlags::VALID)
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(EntryFlags::READ_ONLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_valid() {
        let entry = TranslationEntry::new(Vpn(3), FrameNumber(1), EntryFlags::READ_ONLY);
        assert!(entry.is_valid());
        assert!(entry.is_read_only());
        assert!(!entry.is_dirty());
        assert!(!entry.is_used());
    }

    #[test]
    fn test_dirty_drops_image_backing() {
        let entry = TranslationEntry::new(Vpn(0), FrameNumber(0), EntryFlags::IMAGE_BACKED);
        assert!(entry.is_image_backed());

        entry.set_dirty();
        assert!(entry.is_dirty());
        assert!(entry.is_used());
        assert!(!entry.is_image_backed());
    }

    #[test]
    fn test_snapshot_tracks_invalidation() {
        let entry = TranslationEntry::shared(Vpn(9), FrameNumber(4), EntryFlags::empty());
        let before = entry.snapshot();
        entry.invalidate();
        let after = entry.snapshot();

        assert!(before.is_valid());
        assert!(!after.is_valid());
        assert_eq!(after.frame, FrameNumber(4));
    }
}
