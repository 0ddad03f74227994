//! Boot-time configuration of the virtual memory manager

use crate::error::ConfigError;
use crate::vm::policy::PolicyKind;

/// Largest TLB the simulated processor can carry
pub const MAX_TLB_SIZE: usize = 64;

/// Default number of physical frames
pub const DEFAULT_FRAMES: usize = 16;

/// Default number of TLB slots
pub const DEFAULT_TLB_SIZE: usize = 4;

/// Default number of stack pages per process
pub const DEFAULT_STACK_PAGES: u32 = 8;

/// Largest stack a process may be given
pub const MAX_STACK_PAGES: u32 = 1 << 16;

/// Default seed for the random replacement policy
pub const DEFAULT_SEED: u64 = 0x5eed_cafe;

/// Virtual memory manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical frames shared by all processes
    pub total_frames: usize,
    /// Hardware TLB slots
    pub tlb_size: usize,
    /// Stack pages reserved above each image
    pub stack_pages: u32,
    /// Swap slots, or `None` for a store that grows on demand
    pub swap_capacity: Option<usize>,
    /// Page replacement policy
    pub policy: PolicyKind,
    /// Seed for randomized policies
    pub seed: u64,
}

impl VmConfig {
    pub fn with_frames(mut self, total_frames: usize) -> Self {
        self.total_frames = total_frames;
        self
    }

    pub fn with_tlb_size(mut self, tlb_size: usize) -> Self {
        self.tlb_size = tlb_size;
        self
    }

    pub fn with_stack_pages(mut self, stack_pages: u32) -> Self {
        self.stack_pages = stack_pages;
        self
    }

    pub fn with_swap_capacity(mut self, capacity: Option<usize>) -> Self {
        self.swap_capacity = capacity;
        self
    }

    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check the configuration before the manager is built from it
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.tlb_size == 0 || self.tlb_size > MAX_TLB_SIZE {
            return Err(ConfigError::TlbSize(self.tlb_size));
        }
        if self.stack_pages == 0 {
            return Err(ConfigError::NoStack);
        }
        if self.stack_pages > MAX_STACK_PAGES {
            return Err(ConfigError::StackTooLarge(self.stack_pages));
        }
        if self.swap_capacity == Some(0) {
            return Err(ConfigError::ZeroSwap);
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            total_frames: DEFAULT_FRAMES,
            tlb_size: DEFAULT_TLB_SIZE,
            stack_pages: DEFAULT_STACK_PAGES,
            swap_capacity: None,
            policy: PolicyKind::Random,
            seed: DEFAULT_SEED,
        }
    }
}
