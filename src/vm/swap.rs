//! Swap Store
//!
//! Keyed backing store for evicted dirty pages. The store keeps an in-memory
//! map from (pid, vpn) to a slot on a [`SwapDevice`]; each slot is exactly
//! one page. The map is working state, not durable: nothing about swap
//! survives a kernel restart.
//!
//! Slots freed by purge or discard are reused before the device grows. A
//! store built with a capacity refuses new keys once every slot is taken.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

use super::PAGE_SIZE;
use crate::error::SwapError;
use crate::types::{PageKey, Pid, Vpn};

// ============================================================================
// Swap Device
// ============================================================================

/// Block device holding swap slots
pub trait SwapDevice: Send {
    /// Read one page-sized slot into `buf`
    fn read_slot(&mut self, slot: usize, buf: &mut [u8]) -> Result<(), SwapError>;

    /// Write one page-sized slot, growing the device if needed
    fn write_slot(&mut self, slot: usize, buf: &[u8]) -> Result<(), SwapError>;

    /// Slots currently backed by the device
    fn slot_count(&self) -> usize;
}

/// Swap device kept in kernel memory
#[derive(Debug, Default)]
pub struct RamSwapDevice {
    data: Vec<u8>,
}

impl RamSwapDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwapDevice for RamSwapDevice {
    fn read_slot(&mut self, slot: usize, buf: &mut [u8]) -> Result<(), SwapError> {
        let start = slot * PAGE_SIZE;
        let src = self
            .data
            .get(start..start + PAGE_SIZE)
            .ok_or(SwapError::Io { slot })?;
        buf[..PAGE_SIZE].copy_from_slice(src);
        Ok(())
    }

    fn write_slot(&mut self, slot: usize, buf: &[u8]) -> Result<(), SwapError> {
        let start = slot * PAGE_SIZE;
        if self.data.len() < start + PAGE_SIZE {
            self.data.resize(start + PAGE_SIZE, 0);
        }
        self.data[start..start + PAGE_SIZE].copy_from_slice(&buf[..PAGE_SIZE]);
        Ok(())
    }

    fn slot_count(&self) -> usize {
        self.data.len() / PAGE_SIZE
    }
}

// ============================================================================
// Swap Store
// ============================================================================

/// Keyed page store on top of a swap device
pub struct SwapStore {
    device: Box<dyn SwapDevice>,
    index: BTreeMap<PageKey, usize>,
    free_slots: BTreeSet<usize>,
    next_slot: usize,
    capacity: Option<usize>,
}

impl SwapStore {
    /// Create a store on a RAM device
    pub fn new(capacity: Option<usize>) -> Self {
        Self::with_device(Box::new(RamSwapDevice::new()), capacity)
    }

    /// Create a store on a specific device
    pub fn with_device(device: Box<dyn SwapDevice>, capacity: Option<usize>) -> Self {
        Self {
            device,
            index: BTreeMap::new(),
            free_slots: BTreeSet::new(),
            next_slot: 0,
            capacity,
        }
    }

    /// Check if a page has a slot
    pub fn contains(&self, key: PageKey) -> bool {
        self.index.contains_key(&key)
    }

    /// Write a page, overwriting any earlier copy of the same key
    pub fn write(&mut self, key: PageKey, bytes: &[u8]) -> Result<(), SwapError> {
        let (slot, fresh) = match self.index.get(&key) {
            Some(&slot) => (slot, false),
            None => (self.claim_slot()?, true),
        };

        if let Err(e) = self.device.write_slot(slot, bytes) {
            if fresh {
                self.release_slot(slot);
            }
            log::warn!(target: "vm", "swap write of {} failed: {}", key, e);
            return Err(e);
        }

        self.index.insert(key, slot);
        log::debug!(target: "vm", "swap out {} -> slot {}", key, slot);
        Ok(())
    }

    /// Read a page into `buf`
    ///
    /// The caller must have checked [`contains`](Self::contains); a missing
    /// key is reported as [`SwapError::Missing`].
    pub fn read(&mut self, key: PageKey, buf: &mut [u8]) -> Result<(), SwapError> {
        let slot = *self.index.get(&key).ok_or(SwapError::Missing(key))?;
        self.device.read_slot(slot, buf)?;
        log::debug!(target: "vm", "swap in {} <- slot {}", key, slot);
        Ok(())
    }

    /// Drop one page's slot
    pub fn discard(&mut self, key: PageKey) -> bool {
        match self.index.remove(&key) {
            Some(slot) => {
                self.release_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Drop every slot of a terminated process, returning how many
    pub fn purge(&mut self, pid: Pid) -> usize {
        let keys: Vec<PageKey> = self
            .index
            .range(PageKey::new(pid, Vpn(0))..)
            .take_while(|(k, _)| k.pid == pid)
            .map(|(k, _)| *k)
            .collect();
        for key in &keys {
            self.discard(*key);
        }
        keys.len()
    }

    /// Drop every slot
    pub fn clear(&mut self) {
        self.index.clear();
        self.free_slots.clear();
        self.next_slot = 0;
    }

    /// Slots holding a page
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Configured slot limit
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Slots the device has grown to
    pub fn device_slots(&self) -> usize {
        self.device.slot_count()
    }

    fn claim_slot(&mut self) -> Result<usize, SwapError> {
        if let Some(slot) = self.free_slots.pop_first() {
            return Ok(slot);
        }
        if let Some(capacity) = self.capacity {
            if self.next_slot >= capacity {
                return Err(SwapError::Full { capacity });
            }
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(slot)
    }

    fn release_slot(&mut self, slot: usize) {
        self.free_slots.insert(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn key(pid: u32, vpn: u32) -> PageKey {
        PageKey::new(Pid(pid), Vpn(vpn))
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    fn page_buffer() -> Vec<u8> {
        page(0)
    }

    #[test]
    fn test_write_read() {
        let mut swap = SwapStore::new(None);
        swap.write(key(1, 4), &page(0x44)).unwrap();
        assert!(swap.contains(key(1, 4)));
        assert!(!swap.contains(key(2, 4)));

        let mut buf = page_buffer();
        swap.read(key(1, 4), &mut buf).unwrap();
        assert_eq!(buf, page(0x44));
    }

    #[test]
    fn test_overwrite_keeps_one_slot() {
        let mut swap = SwapStore::new(None);
        swap.write(key(1, 0), &page(1)).unwrap();
        swap.write(key(1, 0), &page(2)).unwrap();
        assert_eq!(swap.len(), 1);
        assert_eq!(swap.device_slots(), 1);

        let mut buf = page_buffer();
        swap.read(key(1, 0), &mut buf).unwrap();
        assert_eq!(buf[0], 2);
    }

    #[test]
    fn test_missing_key() {
        let mut swap = SwapStore::new(None);
        let mut buf = page_buffer();
        assert_eq!(
            swap.read(key(3, 3), &mut buf),
            Err(SwapError::Missing(key(3, 3)))
        );
    }

    #[test]
    fn test_purge_only_touches_one_process() {
        let mut swap = SwapStore::new(None);
        for vpn in 0..3 {
            swap.write(key(1, vpn), &page(1)).unwrap();
            swap.write(key(2, vpn), &page(2)).unwrap();
        }
        assert_eq!(swap.purge(Pid(1)), 3);
        assert!((0..3).all(|vpn| !swap.contains(key(1, vpn))));
        assert!((0..3).all(|vpn| swap.contains(key(2, vpn))));
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut swap = SwapStore::new(None);
        swap.write(key(1, 0), &page(1)).unwrap();
        swap.write(key(1, 1), &page(1)).unwrap();
        swap.discard(key(1, 0));
        swap.write(key(2, 9), &page(9)).unwrap();
        assert_eq!(swap.device_slots(), 2);
    }

    #[test]
    fn test_bounded_store_fills_up() {
        let mut swap = SwapStore::new(Some(2));
        swap.write(key(1, 0), &page(0)).unwrap();
        swap.write(key(1, 1), &page(1)).unwrap();
        assert_eq!(
            swap.write(key(1, 2), &page(2)),
            Err(SwapError::Full { capacity: 2 })
        );
        // Overwriting an existing key needs no new slot
        assert_eq!(swap.write(key(1, 1), &page(7)), Ok(()));
    }
}
