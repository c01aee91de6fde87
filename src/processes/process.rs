//! Process control blocks, as far as the memory subsystem sees them.
//!
//! Scheduling state and register context belong to the scheduler; what
//! lives here is the part every other subsystem needs — a pid and the
//! process's `MemoryLayout`.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::memory::addr::PhysAddr;
use crate::memory::layout::MemoryLayout;
use crate::memory::vmm::VirtualMemoryManager;

// process counter must be monotonic across concurrent spawns
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

pub struct Process {
    pub pid: u32,
    pub state: ProcessState,
    pub layout: MemoryLayout,
}

impl Process {
    /// Creates a process with a fresh layout seeded with the built-in
    /// kernel-shared pages. The ELF loader adds code/data pages on top.
    pub fn new(vmm: &VirtualMemoryManager, all_data_is_kernel: bool) -> Self {
        let mut layout = MemoryLayout::new(all_data_is_kernel);
        // The built-in region is identity-mapped static data.
        for vaddr in vmm.builtin_process_vaddrs() {
            layout.add_kernel_page(PhysAddr::new(vaddr.as_u32()), vaddr);
        }

        Process {
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            state: ProcessState::New,
            layout,
        }
    }
}
