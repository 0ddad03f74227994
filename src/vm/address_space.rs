//! Process Address Spaces
//!
//! Layout of every address space, from page 0 up:
//!
//! ```text
//! | image sections | stack (stack_pages) | args | heap segments ...
//! ```
//!
//! The image part is described by the process's [`LazyLoader`]. Stack,
//! argument and heap pages are anonymous: they are zero-filled on first
//! touch and only ever come back from swap after that.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::fault::{AccessType, FaultOutcome};
use super::loader::LazyLoader;
use super::manager::{ExitReport, Translation, VirtualMemoryManager};
use super::page_table::{PageTable, SharedPageTable};
use super::{page_to_addr, pages_for, MAX_PAGES};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::types::{Pid, Vpn};

// ============================================================================
// Layout
// ============================================================================

/// Anonymous regions of one address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLayout {
    image_pages: u32,
    stack_pages: u32,
    /// Next page handed out to the heap
    heap_top: Vpn,
    /// Live heap segments: first page -> page count
    heap_segments: BTreeMap<Vpn, u32>,
}

impl AddressLayout {
    pub fn new(image_pages: u32, stack_pages: u32) -> Result<Self, VmError> {
        // stack, then one argument page, then the heap
        let heap_base = image_pages
            .checked_add(stack_pages)
            .and_then(|n| n.checked_add(1))
            .filter(|&n| n <= MAX_PAGES)
            .ok_or(VmError::LayoutOverflow {
                image_pages,
                stack_pages,
            })?;
        Ok(Self {
            image_pages,
            stack_pages,
            heap_top: Vpn(heap_base),
            heap_segments: BTreeMap::new(),
        })
    }

    pub fn image_pages(&self) -> u32 {
        self.image_pages
    }

    /// Lowest stack page
    pub fn stack_base(&self) -> Vpn {
        Vpn(self.image_pages)
    }

    /// Page just past the stack, where argv is marshalled
    pub fn args_page(&self) -> Vpn {
        self.stack_base().offset(self.stack_pages)
    }

    /// Initial stack pointer: the stack grows down from the argument page
    pub fn initial_sp(&self) -> u64 {
        page_to_addr(self.args_page())
    }

    pub fn heap_base(&self) -> Vpn {
        self.args_page().offset(1)
    }

    pub fn is_stack(&self, vpn: Vpn) -> bool {
        vpn >= self.stack_base() && vpn < self.args_page()
    }

    pub fn is_args(&self, vpn: Vpn) -> bool {
        vpn == self.args_page()
    }

    /// Check if a page belongs to a live heap segment
    pub fn is_heap(&self, vpn: Vpn) -> bool {
        self.heap_segments
            .range(..=vpn)
            .next_back()
            .is_some_and(|(first, pages)| vpn < first.offset(*pages))
    }

    /// Check if a page is zero-filled on first touch
    pub fn is_anonymous(&self, vpn: Vpn) -> bool {
        self.is_stack(vpn) || self.is_args(vpn) || self.is_heap(vpn)
    }

    /// Reserve a heap segment of `pages` pages
    pub fn reserve_heap(&mut self, pages: u32) -> Result<Vpn, VmError> {
        if pages == 0 {
            return Err(VmError::InvalidArgument);
        }
        let first = self.heap_top;
        let end = first.0.checked_add(pages).ok_or(VmError::InvalidArgument)?;
        // Keep every page addressable
        if end > MAX_PAGES {
            return Err(VmError::InvalidArgument);
        }
        self.heap_top = Vpn(end);
        self.heap_segments.insert(first, pages);
        Ok(first)
    }

    /// Forget the heap segment starting at `first`, returning its size
    pub fn release_heap(&mut self, first: Vpn) -> Option<u32> {
        self.heap_segments.remove(&first)
    }

    /// Live heap segments
    pub fn heap_segments(&self) -> Vec<(Vpn, u32)> {
        self.heap_segments.iter().map(|(v, p)| (*v, *p)).collect()
    }
}

// ============================================================================
// Per-process state
// ============================================================================

/// Paging state of one process, shared with the manager
pub struct ProcessVm {
    pub pid: Pid,
    pub page_table: SharedPageTable,
    pub loader: Box<dyn LazyLoader>,
    pub layout: Mutex<AddressLayout>,
}

impl ProcessVm {
    pub fn new(pid: Pid, loader: Box<dyn LazyLoader>, config: &VmConfig) -> Result<Self, VmError> {
        let layout = AddressLayout::new(loader.page_count(), config.stack_pages)?;
        Ok(Self {
            pid,
            page_table: PageTable::shared(pid),
            loader,
            layout: Mutex::new(layout),
        })
    }

    pub fn is_anonymous(&self, vpn: Vpn) -> bool {
        self.layout.lock().is_anonymous(vpn)
    }
}

// ============================================================================
// Address Space handle
// ============================================================================

/// Handle a process uses to reach its own address space
///
/// Holds an explicit reference to the manager; dropping the handle does not
/// tear the address space down, [`exit`](Self::exit) does.
#[derive(Clone)]
pub struct AddressSpace {
    vm: Arc<VirtualMemoryManager>,
    pid: Pid,
}

impl AddressSpace {
    /// Create the address space of a new process
    pub fn create(
        vm: &Arc<VirtualMemoryManager>,
        pid: Pid,
        loader: Box<dyn LazyLoader>,
    ) -> Result<Self, VmError> {
        vm.on_process_create(pid, loader)?;
        Ok(Self {
            vm: Arc::clone(vm),
            pid,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn manager(&self) -> &Arc<VirtualMemoryManager> {
        &self.vm
    }

    /// Copy of the current layout
    pub fn layout(&self) -> Result<AddressLayout, VmError> {
        self.vm.layout(self.pid)
    }

    pub fn fault(&self, vaddr: u64) -> Result<FaultOutcome, VmError> {
        self.vm.on_translation_miss(self.pid, vaddr)
    }

    pub fn translate(&self, vaddr: u64, access: AccessType) -> Result<Translation, VmError> {
        self.vm.translate(self.pid, vaddr, access)
    }

    pub fn read_bytes(&self, vaddr: u64, len: usize) -> Result<Vec<u8>, VmError> {
        self.vm.read_bytes(self.pid, vaddr, len)
    }

    pub fn write_bytes(&self, vaddr: u64, data: &[u8]) -> Result<usize, VmError> {
        self.vm.write_bytes(self.pid, vaddr, data)
    }

    pub fn read_string(&self, vaddr: u64, max_len: usize) -> Result<String, VmError> {
        self.vm.read_string(self.pid, vaddr, max_len)
    }

    /// Reserve a zero-filled heap segment, returning its address
    pub fn allocate_heap(&self, bytes: usize) -> Result<u64, VmError> {
        self.vm.allocate_heap(self.pid, bytes)
    }

    pub fn free_heap(&self, vaddr: u64) -> Result<usize, VmError> {
        self.vm.free_heap(self.pid, vaddr)
    }

    pub fn switch_out(&self) {
        self.vm.on_context_switch_out(self.pid)
    }

    pub fn switch_in(&self) -> Result<usize, VmError> {
        self.vm.on_context_switch_in(self.pid)
    }

    /// Tear the address space down
    pub fn exit(self) -> Result<ExitReport, VmError> {
        self.vm.on_process_exit(self.pid)
    }
}

/// Pages a heap request of `bytes` needs
pub(crate) fn heap_pages(bytes: usize) -> Result<u32, VmError> {
    match pages_for(bytes) {
        0 => Err(VmError::InvalidArgument),
        pages => Ok(pages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::loader::SectionImage;

    #[test]
    fn test_layout_regions() {
        let layout = AddressLayout::new(4, 2).unwrap();
        assert_eq!(layout.stack_base(), Vpn(4));
        assert!(layout.is_stack(Vpn(5)));
        assert!(!layout.is_stack(Vpn(6)));
        assert!(layout.is_args(Vpn(6)));
        assert_eq!(layout.heap_base(), Vpn(7));
        assert_eq!(layout.initial_sp(), page_to_addr(Vpn(6)));
        assert!(!layout.is_anonymous(Vpn(3)));
        assert!(!layout.is_anonymous(Vpn(7)));
    }

    #[test]
    fn test_heap_segments() {
        let mut layout = AddressLayout::new(1, 1).unwrap();
        let a = layout.reserve_heap(2).unwrap();
        let b = layout.reserve_heap(1).unwrap();
        assert_eq!(a, Vpn(3));
        assert_eq!(b, Vpn(5));
        assert!(layout.is_heap(Vpn(4)));
        assert!(layout.is_anonymous(Vpn(5)));
        assert!(!layout.is_heap(Vpn(6)));

        assert_eq!(layout.release_heap(a), Some(2));
        assert!(!layout.is_heap(Vpn(3)));
        assert!(layout.is_heap(Vpn(5)));
        assert_eq!(layout.release_heap(Vpn(4)), None);
        assert_eq!(layout.reserve_heap(0), Err(VmError::InvalidArgument));
    }

    #[test]
    fn test_layout_must_fit_address_space() {
        assert_eq!(
            AddressLayout::new(u32::MAX, 8),
            Err(VmError::LayoutOverflow {
                image_pages: u32::MAX,
                stack_pages: 8
            })
        );
        assert!(AddressLayout::new(MAX_PAGES - 9, 8).is_ok());
        assert!(AddressLayout::new(MAX_PAGES - 8, 8).is_err());

        // The heap may run up to the last page and no further
        let mut layout = AddressLayout::new(1, 1).unwrap();
        let room = MAX_PAGES - layout.heap_base().0;
        assert_eq!(layout.reserve_heap(room + 1), Err(VmError::InvalidArgument));
        assert!(layout.reserve_heap(room).is_ok());
        assert_eq!(layout.reserve_heap(1), Err(VmError::InvalidArgument));
    }

    #[test]
    fn test_process_layout_follows_image() {
        let config = VmConfig::default().with_stack_pages(3);
        let proc = ProcessVm::new(Pid(9), Box::new(SectionImage::patterned(5, true)), &config).unwrap();
        assert!(proc.is_anonymous(Vpn(5)));
        assert!(proc.is_anonymous(Vpn(8)));
        assert!(!proc.is_anonymous(Vpn(4)));
        assert_eq!(proc.page_table.lock().pid(), Pid(9));
    }

    #[test]
    fn test_heap_pages() {
        assert_eq!(heap_pages(1), Ok(1));
        assert_eq!(heap_pages(crate::vm::PAGE_SIZE * 2), Ok(2));
        assert_eq!(heap_pages(0), Err(VmError::InvalidArgument));
    }
}
