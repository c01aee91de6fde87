//! Scoped access to another process's memory.
//!
//! Syscall and pipe handlers regularly have to dereference buffers that
//! live in a different address space — a request block handed to the
//! kernel, a pipe payload owned by the peer. [`ForeignMemoryAccess`]
//! merges the target layout into the active one for the lifetime of the
//! guard and is guaranteed to unmerge on drop, whatever path control
//! takes out of the handler.

use crate::memory::layout::MemoryLayout;
use crate::memory::tlb;
use crate::memory::vmm::VirtualMemoryManager;
use crate::sched::PreemptGuard;

/// Live window onto a foreign process's pages.
///
/// Holds the active layout mutably for its lifetime: nothing else can
/// switch or mutate it while the window is open.
pub struct ForeignMemoryAccess<'a> {
    active: &'a mut MemoryLayout,
    target: &'a MemoryLayout,
    vmm: &'a VirtualMemoryManager,
    _guard: PreemptGuard,
}

impl<'a> ForeignMemoryAccess<'a> {
    /// Merges `target` into `active` (kernel-mode flags) and returns the
    /// guard that undoes it.
    pub fn enable(
        active: &'a mut MemoryLayout,
        target: &'a MemoryLayout,
        vmm: &'a VirtualMemoryManager,
    ) -> Self {
        let guard = PreemptGuard::new();
        active.merge(target, false, vmm);
        tlb::flush_all();

        ForeignMemoryAccess {
            active,
            target,
            vmm,
            _guard: guard,
        }
    }

    /// The active layout with the foreign pages spliced in.
    pub fn layout(&self) -> &MemoryLayout {
        self.active
    }
}

impl Drop for ForeignMemoryAccess<'_> {
    fn drop(&mut self) {
        self.active.unmerge(self.target, self.vmm);
        tlb::flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::PAGE_SIZE;
    use crate::memory::addr::VirtAddr;
    use crate::memory::test_support::fresh_vmm;
    use crate::processes::process::Process;

    #[test]
    fn foreign_pages_visible_only_while_guard_lives() {
        let vmm = fresh_vmm();

        // kernel context: its own layout, active
        let mut kernel = Process::new(&vmm, true);
        kernel.layout.switch_from(false, None, &vmm);

        // a process with one private data page, not currently active
        let mut target = Process::new(&vmm, false);
        let frame = vmm.reserve_phys_pages(1).unwrap();
        let buffer = VirtAddr::new(0x0900_0000);
        target.layout.add_data_page(frame, buffer);

        assert!(!vmm.is_virtual_mapped(buffer));
        let pages_before = kernel.layout.page_count();

        {
            let access = ForeignMemoryAccess::enable(&mut kernel.layout, &target.layout, &vmm);
            // the foreign buffer resolves from kernel context now
            assert_eq!(vmm.translate(buffer), frame);
            assert!(access.layout().contains(buffer));
            assert!(access.layout().contains_all_virtual_addresses(buffer, PAGE_SIZE));
        }

        // window closed: transient pages gone, original layout intact
        assert!(!vmm.is_virtual_mapped(buffer));
        assert!(!kernel.layout.contains(buffer));
        assert_eq!(kernel.layout.page_count(), pages_before);
    }

    #[test]
    fn shared_pages_survive_the_window() {
        let vmm = fresh_vmm();

        let mut kernel = Process::new(&vmm, true);
        kernel.layout.switch_from(false, None, &vmm);

        // both layouts are seeded with the built-in pages, so the merge
        // imports nothing for them and the unmerge must leave them alone
        let target = Process::new(&vmm, false);
        let builtin = VirtAddr::new(crate::constants::memory::BUILTIN_DATA_START);

        {
            let _access = ForeignMemoryAccess::enable(&mut kernel.layout, &target.layout, &vmm);
        }

        assert!(kernel.layout.contains(builtin));
        assert!(vmm.is_virtual_mapped(builtin));
    }
}
