//! Property tests: frame accounting, frame exclusivity and data integrity
//! hold over arbitrary interleavings of accesses, context switches, heap
//! traffic and exits.

use std::collections::BTreeMap;

use demand_vm::vm::{page_to_addr, SectionImage};
use demand_vm::{FrameNumber, Pid, PolicyKind, VirtualMemoryManager, VmConfig, Vpn};
use proptest::prelude::*;

const PROCS: u32 = 3;
const IMAGE_PAGES: u32 = 3;
const STACK_PAGES: u32 = 4;
/// Stack pages plus the argument page
const WRITABLE: core::ops::Range<u32> = IMAGE_PAGES..IMAGE_PAGES + STACK_PAGES + 1;

#[derive(Debug, Clone)]
enum Op {
    Read { pid: u32, vpn: u32 },
    Write { pid: u32, vpn: u32, byte: u8 },
    Switch { pid: u32 },
    Restart { pid: u32 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..PROCS, 0..WRITABLE.end).prop_map(|(pid, vpn)| Op::Read { pid, vpn }),
        4 => (0..PROCS, WRITABLE, any::<u8>()).prop_map(|(pid, vpn, byte)| Op::Write { pid, vpn, byte }),
        1 => (0..PROCS).prop_map(|pid| Op::Switch { pid }),
        1 => (0..PROCS).prop_map(|pid| Op::Restart { pid }),
    ]
}

fn arb_policy() -> impl Strategy<Value = PolicyKind> {
    prop_oneof![
        Just(PolicyKind::Random),
        Just(PolicyKind::Fifo),
        Just(PolicyKind::Clock),
    ]
}

fn spawn(vm: &VirtualMemoryManager, pid: Pid) {
    vm.on_process_create(pid, Box::new(SectionImage::patterned(IMAGE_PAGES, true)))
        .unwrap();
}

/// First byte a page should hold if nothing was written to it
fn initial_byte(vpn: u32) -> u8 {
    if vpn < IMAGE_PAGES {
        vpn as u8
    } else {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn paging_state_stays_consistent(
        frames in 1usize..6,
        tlb_size in 1usize..5,
        policy in arb_policy(),
        seed in any::<u64>(),
        ops in prop::collection::vec(arb_op(), 1..80),
    ) {
        let config = VmConfig::default()
            .with_frames(frames)
            .with_tlb_size(tlb_size)
            .with_stack_pages(STACK_PAGES)
            .with_policy(policy)
            .with_seed(seed);
        let vm = VirtualMemoryManager::new(config).unwrap();
        for pid in 0..PROCS {
            spawn(&vm, Pid(pid));
        }
        let mut written: BTreeMap<(u32, u32), u8> = BTreeMap::new();
        let mut running: Option<u32> = None;

        for op in ops {
            match op {
                Op::Read { pid, vpn } => {
                    let got = vm.read_bytes(Pid(pid), page_to_addr(Vpn(vpn)), 1).unwrap();
                    let want = written.get(&(pid, vpn)).copied().unwrap_or(initial_byte(vpn));
                    prop_assert_eq!(got[0], want);
                }
                Op::Write { pid, vpn, byte } => {
                    vm.write_bytes(Pid(pid), page_to_addr(Vpn(vpn)), &[byte]).unwrap();
                    written.insert((pid, vpn), byte);
                }
                Op::Switch { pid } => {
                    if let Some(prev) = running {
                        vm.on_context_switch_out(Pid(prev));
                    }
                    vm.on_context_switch_in(Pid(pid)).unwrap();
                    prop_assert!(vm.tlb_slots().iter().all(|(owner, _)| *owner == Pid(pid)));
                    running = Some(pid);
                }
                Op::Restart { pid } => {
                    let resident = vm.resident_count(Pid(pid));
                    let free = vm.free_frames();
                    let report = vm.on_process_exit(Pid(pid)).unwrap();
                    prop_assert_eq!(report.frames_freed, resident);
                    prop_assert_eq!(vm.free_frames(), free + resident);
                    for vpn in 0..WRITABLE.end {
                        prop_assert!(!vm.swap_contains(Pid(pid), Vpn(vpn)));
                    }
                    written.retain(|(owner, _), _| *owner != pid);
                    if running == Some(pid) {
                        running = None;
                    }
                    spawn(&vm, Pid(pid));
                }
            }

            prop_assert_eq!(vm.check_invariants(), Ok(()));
            let snap = vm.snapshot();
            prop_assert_eq!(snap.free_frames + snap.resident_pages, frames);
            for frame in 0..frames as u32 {
                prop_assert!(vm.owners_of(FrameNumber(frame)).len() <= 1);
            }
        }
    }

    #[test]
    fn heap_segments_release_exactly_their_pages(
        sizes in prop::collection::vec(1usize..3000, 1..6),
        touch in prop::collection::vec(any::<bool>(), 6),
    ) {
        let config = VmConfig::default().with_frames(64);
        let vm = VirtualMemoryManager::new(config).unwrap();
        spawn(&vm, Pid(1));

        let segments: Vec<u64> = sizes
            .iter()
            .map(|&bytes| vm.allocate_heap(Pid(1), bytes).unwrap())
            .collect();
        let mut expected = Vec::new();
        for (i, (&base, &bytes)) in segments.iter().zip(sizes.iter()).enumerate() {
            let resident = if touch[i] {
                vm.write_bytes(Pid(1), base, &vec![0xEE; bytes]).unwrap();
                demand_vm::vm::pages_for(bytes) as usize
            } else {
                0
            };
            expected.push(resident);
        }

        for (base, resident) in segments.into_iter().zip(expected) {
            let free = vm.free_frames();
            prop_assert_eq!(vm.free_heap(Pid(1), base), Ok(resident));
            prop_assert_eq!(vm.free_frames(), free + resident);
        }
        prop_assert_eq!(vm.resident_count(Pid(1)), 0);
        prop_assert_eq!(vm.check_invariants(), Ok(()));
    }
}
