//! Page Replacement Policies
//!
//! The frame allocator only talks to the [`EvictionPolicy`] capability.
//! Concrete policies form a closed set, [`ReplacementPolicy`], chosen once
//! when the manager is built:
//! - Random: uniform choice over resident pages (baseline)
//! - Fifo: oldest resident page first
//! - Clock: second chance, fed by `touch` on every access

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::vec::Vec;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::types::PageKey;

/// Resident-set bookkeeping used to pick eviction victims
pub trait EvictionPolicy {
    /// Start tracking a resident page; tracking it again counts as a use
    fn track_resident(&mut self, key: PageKey);

    /// Stop tracking a page that is no longer resident
    fn untrack(&mut self, key: PageKey);

    /// Pick a victim among tracked pages, without untracking it
    ///
    /// Returns `None` only when nothing is tracked.
    fn choose(&mut self) -> Option<PageKey>;

    /// Note an access to a tracked page
    fn touch(&mut self, _key: PageKey) {}

    /// Check if a page is tracked
    fn contains(&self, key: PageKey) -> bool;

    /// Number of tracked pages
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Available policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    Random,
    Fifo,
    Clock,
}

// ============================================================================
// Random
// ============================================================================

/// Uniform random replacement
///
/// Keys live in a dense vector so a random index is a random page; the side
/// index makes removal of an arbitrary key a swap-remove.
#[derive(Debug)]
pub struct RandomReplace {
    keys: Vec<PageKey>,
    index: BTreeMap<PageKey, usize>,
    rng: SmallRng,
}

impl RandomReplace {
    pub fn new(seed: u64) -> Self {
        Self {
            keys: Vec::new(),
            index: BTreeMap::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl EvictionPolicy for RandomReplace {
    fn track_resident(&mut self, key: PageKey) {
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key, self.keys.len());
        self.keys.push(key);
    }

    fn untrack(&mut self, key: PageKey) {
        let Some(pos) = self.index.remove(&key) else {
            return;
        };
        self.keys.swap_remove(pos);
        if let Some(moved) = self.keys.get(pos) {
            self.index.insert(*moved, pos);
        }
    }

    fn choose(&mut self) -> Option<PageKey> {
        if self.keys.is_empty() {
            return None;
        }
        let pos = self.rng.gen_range(0..self.keys.len());
        Some(self.keys[pos])
    }

    fn contains(&self, key: PageKey) -> bool {
        self.index.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

// ============================================================================
// FIFO
// ============================================================================

/// First-in first-out replacement
#[derive(Debug, Default)]
pub struct FifoReplace {
    queue: VecDeque<PageKey>,
    members: BTreeSet<PageKey>,
}

impl FifoReplace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for FifoReplace {
    fn track_resident(&mut self, key: PageKey) {
        if self.members.insert(key) {
            self.queue.push_back(key);
        }
    }

    fn untrack(&mut self, key: PageKey) {
        if self.members.remove(&key) {
            if let Some(pos) = self.queue.iter().position(|k| *k == key) {
                self.queue.remove(pos);
            }
        }
    }

    fn choose(&mut self) -> Option<PageKey> {
        self.queue.front().copied()
    }

    fn contains(&self, key: PageKey) -> bool {
        self.members.contains(&key)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Second-chance (clock) replacement
///
/// The hand sweeps the ring; a referenced page has its bit cleared and is
/// skipped, the first unreferenced page is the victim. New pages enter just
/// behind the hand with their bit clear.
#[derive(Debug, Default)]
pub struct ClockReplace {
    ring: Vec<PageKey>,
    referenced: BTreeMap<PageKey, bool>,
    hand: usize,
}

impl ClockReplace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for ClockReplace {
    fn track_resident(&mut self, key: PageKey) {
        if let Some(bit) = self.referenced.get_mut(&key) {
            *bit = true;
            return;
        }
        self.referenced.insert(key, false);
        self.ring.insert(self.hand, key);
        self.hand = (self.hand + 1) % self.ring.len();
    }

    fn untrack(&mut self, key: PageKey) {
        if self.referenced.remove(&key).is_none() {
            return;
        }
        if let Some(pos) = self.ring.iter().position(|k| *k == key) {
            self.ring.remove(pos);
            if pos < self.hand {
                self.hand -= 1;
            }
            if self.hand >= self.ring.len() {
                self.hand = 0;
            }
        }
    }

    fn choose(&mut self) -> Option<PageKey> {
        if self.ring.is_empty() {
            return None;
        }
        // Two sweeps always find a page: the first clears every bit
        for _ in 0..2 * self.ring.len() {
            let key = self.ring[self.hand];
            match self.referenced.get_mut(&key) {
                Some(bit) if *bit => {
                    *bit = false;
                    self.hand = (self.hand + 1) % self.ring.len();
                }
                _ => return Some(key),
            }
        }
        Some(self.ring[self.hand])
    }

    fn touch(&mut self, key: PageKey) {
        if let Some(bit) = self.referenced.get_mut(&key) {
            *bit = true;
        }
    }

    fn contains(&self, key: PageKey) -> bool {
        self.referenced.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.ring.len()
    }
}

// ============================================================================
// Policy selection
// ============================================================================

/// The configured replacement policy
#[derive(Debug)]
pub enum ReplacementPolicy {
    Random(RandomReplace),
    Fifo(FifoReplace),
    Clock(ClockReplace),
}

impl ReplacementPolicy {
    pub fn new(kind: PolicyKind, seed: u64) -> Self {
        match kind {
            PolicyKind::Random => Self::Random(RandomReplace::new(seed)),
            PolicyKind::Fifo => Self::Fifo(FifoReplace::new()),
            PolicyKind::Clock => Self::Clock(ClockReplace::new()),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Random(_) => PolicyKind::Random,
            Self::Fifo(_) => PolicyKind::Fifo,
            Self::Clock(_) => PolicyKind::Clock,
        }
    }

    fn inner(&self) -> &dyn EvictionPolicy {
        match self {
            Self::Random(p) => p,
            Self::Fifo(p) => p,
            Self::Clock(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn EvictionPolicy {
        match self {
            Self::Random(p) => p,
            Self::Fifo(p) => p,
            Self::Clock(p) => p,
        }
    }
}

impl EvictionPolicy for ReplacementPolicy {
    fn track_resident(&mut self, key: PageKey) {
        self.inner_mut().track_resident(key)
    }

    fn untrack(&mut self, key: PageKey) {
        self.inner_mut().untrack(key)
    }

    fn choose(&mut self) -> Option<PageKey> {
        self.inner_mut().choose()
    }

    fn touch(&mut self, key: PageKey) {
        self.inner_mut().touch(key)
    }

    fn contains(&self, key: PageKey) -> bool {
        self.inner().contains(key)
    }

    fn len(&self) -> usize {
        self.inner().len()
    }
}
