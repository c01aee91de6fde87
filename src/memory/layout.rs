//! Per-process page ownership and the switch/merge/unmerge protocol.
//!
//! A `MemoryLayout` records which virtual pages a process owns and which
//! frames back them, split into code, data and kernel categories. It does
//! not touch hardware until the layout is activated: `switch_from` diffs
//! against the previously active layout and issues the live (un)map calls,
//! and `merge`/`unmerge` splice another process's pages into the active
//! layout for the duration of a cross-process access.

use alloc::collections::BTreeMap;

use crate::constants::memory::PAGE_SIZE;
use crate::memory::addr::{PhysAddr, VirtAddr};
use crate::memory::page_table::PageFlags;
use crate::memory::vmm::{UpdateUsedPages, VirtualMemoryManager};
use crate::sched::PreemptGuard;

/// Ownership category of a page within a layout.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PageKind {
    Code,
    Data,
    Kernel,
}

/// One owned page: its backing frame, and whether it arrived through
/// `merge` (and therefore leaves through `unmerge`).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PageEntry {
    pub phys: PhysAddr,
    pub merged: bool,
}

/// Per-process descriptor of owned pages.
///
/// Invariant: a virtual address appears in at most one of the three maps.
pub struct MemoryLayout {
    code_pages: BTreeMap<VirtAddr, PageEntry>,
    data_pages: BTreeMap<VirtAddr, PageEntry>,
    kernel_pages: BTreeMap<VirtAddr, PageEntry>,
    /// Kernel-resident processes keep even their data kernel-only.
    all_data_is_kernel: bool,
}

/// Map/unmap flags for an owned page when its layout goes live.
///
/// User-mode activation drops `KERNEL_ONLY` from code and data; kernel
/// pages stay privileged no matter who runs.
fn flags_for(kind: PageKind, is_user_mode: bool) -> PageFlags {
    let mut flags = match kind {
        PageKind::Code => PageFlags::PRESENT,
        PageKind::Data => PageFlags::PRESENT | PageFlags::WRITEABLE,
        PageKind::Kernel => {
            return PageFlags::PRESENT | PageFlags::WRITEABLE | PageFlags::KERNEL_ONLY
        }
    };
    if !is_user_mode {
        flags |= PageFlags::KERNEL_ONLY;
    }
    flags
}

impl MemoryLayout {
    pub fn new(all_data_is_kernel: bool) -> Self {
        MemoryLayout {
            code_pages: BTreeMap::new(),
            data_pages: BTreeMap::new(),
            kernel_pages: BTreeMap::new(),
            all_data_is_kernel,
        }
    }

    fn map_of(&self, kind: PageKind) -> &BTreeMap<VirtAddr, PageEntry> {
        match kind {
            PageKind::Code => &self.code_pages,
            PageKind::Data => &self.data_pages,
            PageKind::Kernel => &self.kernel_pages,
        }
    }

    fn map_of_mut(&mut self, kind: PageKind) -> &mut BTreeMap<VirtAddr, PageEntry> {
        match kind {
            PageKind::Code => &mut self.code_pages,
            PageKind::Data => &mut self.data_pages,
            PageKind::Kernel => &mut self.kernel_pages,
        }
    }

    /// Looks `vaddr`'s page up across all three maps.
    pub fn lookup(&self, vaddr: VirtAddr) -> Option<(PageKind, PageEntry)> {
        let page = vaddr.page_base();
        for kind in [PageKind::Code, PageKind::Data, PageKind::Kernel] {
            if let Some(entry) = self.map_of(kind).get(&page) {
                return Some((kind, *entry));
            }
        }
        None
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.lookup(vaddr).is_some()
    }

    pub fn page_count(&self) -> usize {
        self.code_pages.len() + self.data_pages.len() + self.kernel_pages.len()
    }

    fn iter_all(&self) -> impl Iterator<Item = (PageKind, VirtAddr, PageEntry)> + '_ {
        let tag = |kind: PageKind| move |(v, e): (&VirtAddr, &PageEntry)| (kind, *v, *e);
        self.code_pages
            .iter()
            .map(tag(PageKind::Code))
            .chain(self.data_pages.iter().map(tag(PageKind::Data)))
            .chain(self.kernel_pages.iter().map(tag(PageKind::Kernel)))
    }

    fn add(&mut self, kind: PageKind, paddr: PhysAddr, vaddr: VirtAddr, merged: bool) {
        debug_assert!(paddr.is_page_aligned() && vaddr.is_page_aligned());

        if let Some((existing, _)) = self.lookup(vaddr) {
            // Non-fatal; the existing mapping wins.
            log::warn!("duplicate {vaddr:?} added as {kind:?}, already owned as {existing:?}");
            return;
        }
        self.map_of_mut(kind).insert(vaddr, PageEntry { phys: paddr, merged });
    }

    pub fn add_code_page(&mut self, paddr: PhysAddr, vaddr: VirtAddr) {
        self.add(PageKind::Code, paddr, vaddr, false);
    }

    pub fn add_data_page(&mut self, paddr: PhysAddr, vaddr: VirtAddr) {
        if self.all_data_is_kernel {
            self.add_kernel_page(paddr, vaddr);
        } else {
            self.add(PageKind::Data, paddr, vaddr, false);
        }
    }

    pub fn add_kernel_page(&mut self, paddr: PhysAddr, vaddr: VirtAddr) {
        self.add(PageKind::Kernel, paddr, vaddr, false);
    }

    /// Removes `vaddr`'s page from whichever map holds it.
    pub fn remove_page(&mut self, vaddr: VirtAddr) -> Option<PageEntry> {
        let page = vaddr.page_base();
        self.code_pages
            .remove(&page)
            .or_else(|| self.data_pages.remove(&page))
            .or_else(|| self.kernel_pages.remove(&page))
    }

    /// Removes every owned page overlapping `size` bytes from `start`.
    pub fn remove_pages(&mut self, start: VirtAddr, size: usize) {
        let mut addr = start.page_base().as_u32() as u64;
        let end = start.as_u32() as u64 + size as u64;
        while addr < end {
            let _ = self.remove_page(VirtAddr::new(addr as u32));
            addr += PAGE_SIZE as u64;
        }
    }

    /// Activates this layout, diffing against the previously active one.
    ///
    /// Pages of `previous` absent here are unmapped live; the frames stay
    /// reserved, only the virtual bitmap is released. Then every owned
    /// page goes live with flags for `is_user_mode`. Pages present in
    /// both layouts with an identical live PTE are skipped.
    ///
    /// Precondition: runs with preemption off; the guard enforces it.
    pub fn switch_from(
        &self,
        is_user_mode: bool,
        previous: Option<&MemoryLayout>,
        vmm: &VirtualMemoryManager,
    ) {
        let _guard = PreemptGuard::new();

        if let Some(previous) = previous {
            for (_, vaddr, _) in previous.iter_all() {
                if !self.contains(vaddr) {
                    vmm.unmap(vaddr, PAGE_SIZE, UpdateUsedPages::VIRTUAL);
                }
            }
        }

        for (kind, vaddr, entry) in self.iter_all() {
            let flags = flags_for(kind, is_user_mode);
            let in_previous = previous.is_some_and(|p| p.contains(vaddr));
            if in_previous && vmm.mapping_matches(entry.phys, vaddr, flags) {
                continue;
            }
            vmm.map(entry.phys, vaddr, PAGE_SIZE, flags, UpdateUsedPages::VIRTUAL);
        }
    }

    /// Splices `other`'s pages into this (active) layout.
    ///
    /// Every page of `other` not already owned here is inserted with the
    /// merge tag and mapped live, letting the running thread dereference
    /// structures that live in `other`'s address space without switching
    /// layouts. Pages already owned are left as they are.
    pub fn merge(&mut self, other: &MemoryLayout, is_user_mode: bool, vmm: &VirtualMemoryManager) {
        let _guard = PreemptGuard::new();

        for (kind, vaddr, entry) in other.iter_all() {
            if let Some((_, existing)) = self.lookup(vaddr) {
                debug_assert_eq!(
                    existing.phys, entry.phys,
                    "merge collision at {vaddr:?}: frames disagree"
                );
                continue;
            }
            self.map_of_mut(kind)
                .insert(vaddr, PageEntry { phys: entry.phys, merged: true });
            vmm.map(
                entry.phys,
                vaddr,
                PAGE_SIZE,
                flags_for(kind, is_user_mode),
                UpdateUsedPages::VIRTUAL,
            );
        }
    }

    /// Undoes a [`Self::merge`] of `other`.
    ///
    /// Only pages of `other` carrying the merge tag here are removed and
    /// unmapped. Pages owned independently before the merge carry no tag
    /// and must never be touched.
    pub fn unmerge(&mut self, other: &MemoryLayout, vmm: &VirtualMemoryManager) {
        let _guard = PreemptGuard::new();

        for (_, vaddr, _) in other.iter_all() {
            let tagged = self.lookup(vaddr).is_some_and(|(_, entry)| entry.merged);
            if tagged {
                let _ = self.remove_page(vaddr);
                vmm.unmap(vaddr, PAGE_SIZE, UpdateUsedPages::VIRTUAL);
            }
        }
    }

    /// True when any page of `[start, start + size)` is owned here.
    /// Validates untrusted pointers before the kernel dereferences them.
    pub fn contains_any_virtual_addresses(&self, start: VirtAddr, size: usize) -> bool {
        let mut addr = start.page_base().as_u32() as u64;
        let end = start.as_u32() as u64 + size as u64;
        while addr < end {
            if self.contains(VirtAddr::new(addr as u32)) {
                return true;
            }
            addr += PAGE_SIZE as u64;
        }
        false
    }

    /// True when every page of `[start, start + size)` is owned here.
    pub fn contains_all_virtual_addresses(&self, start: VirtAddr, size: usize) -> bool {
        let mut addr = start.page_base().as_u32() as u64;
        let end = start.as_u32() as u64 + size as u64;
        while addr < end {
            if !self.contains(VirtAddr::new(addr as u32)) {
                return false;
            }
            addr += PAGE_SIZE as u64;
        }
        true
    }

    /// True when any owned frame overlaps `[start, start + size)` physical.
    pub fn contains_any_physical_addresses(&self, start: PhysAddr, size: usize) -> bool {
        let begin = start.as_u32() as u64;
        let end = begin + size as u64;
        self.iter_all().any(|(_, _, entry)| {
            let frame = entry.phys.as_u32() as u64;
            frame < end && frame + PAGE_SIZE as u64 > begin
        })
    }

    /// True when every frame of `[start, start + size)` physical is owned.
    pub fn contains_all_physical_addresses(&self, start: PhysAddr, size: usize) -> bool {
        let mut frame = start.page_base().as_u32() as u64;
        let end = start.as_u32() as u64 + size as u64;
        while frame < end {
            let owned = self
                .iter_all()
                .any(|(_, _, entry)| entry.phys.as_u32() as u64 == frame);
            if !owned {
                return false;
            }
            frame += PAGE_SIZE as u64;
        }
        true
    }

    /// Forward lookup, offset-preserving.
    pub fn physical_address_of(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.lookup(vaddr)
            .map(|(_, entry)| PhysAddr::new(entry.phys.as_u32() + vaddr.page_offset()))
    }

    /// Reverse lookup, offset-preserving.
    pub fn virtual_address_of(&self, paddr: PhysAddr) -> Option<VirtAddr> {
        let frame = paddr.page_base();
        self.iter_all()
            .find(|(_, _, entry)| entry.phys == frame)
            .map(|(_, vaddr, _)| VirtAddr::new(vaddr.as_u32() + paddr.page_offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::memory::PAGE_SIZE;
    use crate::memory::test_support::fresh_vmm;

    const CODE_VADDR: VirtAddr = VirtAddr::new(0x0804_8000);
    const DATA_VADDR: VirtAddr = VirtAddr::new(0x0805_0000);

    #[test]
    fn duplicate_add_keeps_existing_entry() {
        let mut layout = MemoryLayout::new(false);
        layout.add_code_page(PhysAddr::new(0x0100_0000), CODE_VADDR);
        layout.add_data_page(PhysAddr::new(0x0200_0000), CODE_VADDR);

        let (kind, entry) = layout.lookup(CODE_VADDR).unwrap();
        assert_eq!(kind, PageKind::Code);
        assert_eq!(entry.phys, PhysAddr::new(0x0100_0000));
        assert_eq!(layout.page_count(), 1);
    }

    #[test]
    fn all_data_is_kernel_redirects_data_pages() {
        let mut layout = MemoryLayout::new(true);
        layout.add_data_page(PhysAddr::new(0x0100_0000), DATA_VADDR);

        let (kind, _) = layout.lookup(DATA_VADDR).unwrap();
        assert_eq!(kind, PageKind::Kernel);
    }

    #[test]
    fn remove_page_searches_every_map() {
        let mut layout = MemoryLayout::new(false);
        layout.add_code_page(PhysAddr::new(0x0100_0000), CODE_VADDR);
        layout.add_kernel_page(PhysAddr::new(0x0200_0000), DATA_VADDR);

        assert!(layout.remove_page(CODE_VADDR).is_some());
        assert!(layout.remove_page(DATA_VADDR).is_some());
        assert!(layout.remove_page(DATA_VADDR).is_none());
        assert_eq!(layout.page_count(), 0);
    }

    #[test]
    fn remove_pages_clears_a_range() {
        let mut layout = MemoryLayout::new(false);
        for page in 0..4u32 {
            layout.add_data_page(
                PhysAddr::new(0x0100_0000 + page * PAGE_SIZE as u32),
                VirtAddr::new(DATA_VADDR.as_u32() + page * PAGE_SIZE as u32),
            );
        }

        layout.remove_pages(DATA_VADDR, 2 * PAGE_SIZE);
        assert_eq!(layout.page_count(), 2);
        assert!(!layout.contains(DATA_VADDR));
        assert!(layout.contains(VirtAddr::new(DATA_VADDR.as_u32() + 2 * PAGE_SIZE as u32)));
    }

    #[test]
    fn first_switch_maps_user_code_without_kernel_only() {
        let vmm = fresh_vmm();
        let frame = vmm.reserve_phys_pages(1).unwrap();

        let mut layout = MemoryLayout::new(false);
        layout.add_code_page(frame, CODE_VADDR);
        layout.switch_from(true, None, &vmm);

        assert!(vmm.is_virtual_mapped(CODE_VADDR));
        assert_eq!(vmm.translate(CODE_VADDR), frame);
        // user mode: present, user-allowed, read-only code
        assert!(vmm.mapping_matches(frame, CODE_VADDR, PageFlags::PRESENT));
    }

    #[test]
    fn kernel_mode_switch_keeps_pages_privileged() {
        let vmm = fresh_vmm();
        let frame = vmm.reserve_phys_pages(1).unwrap();

        let mut layout = MemoryLayout::new(false);
        layout.add_data_page(frame, DATA_VADDR);
        layout.switch_from(false, None, &vmm);

        assert!(vmm.mapping_matches(
            frame,
            DATA_VADDR,
            PageFlags::PRESENT | PageFlags::WRITEABLE | PageFlags::KERNEL_ONLY,
        ));
    }

    #[test]
    fn switch_diff_unmaps_only_departed_pages() {
        let vmm = fresh_vmm();
        let frames = vmm.reserve_phys_pages(3).unwrap();
        let frame = |index: u32| PhysAddr::new(frames.as_u32() + index * PAGE_SIZE as u32);
        let vaddr = |index: u32| VirtAddr::new(0x0804_8000 + index * PAGE_SIZE as u32);

        // previous owns pages 0 and 1; next owns pages 1 and 2
        let mut previous = MemoryLayout::new(false);
        previous.add_data_page(frame(0), vaddr(0));
        previous.add_data_page(frame(1), vaddr(1));
        previous.switch_from(true, None, &vmm);

        let mut next = MemoryLayout::new(false);
        next.add_data_page(frame(1), vaddr(1));
        next.add_data_page(frame(2), vaddr(2));
        next.switch_from(true, Some(&previous), &vmm);

        // departed page: unmapped, frame still reserved
        assert!(!vmm.is_virtual_mapped(vaddr(0)));
        assert!(!vmm.is_virt_page_used(vaddr(0)));
        assert!(vmm.is_frame_used(frame(0)));

        // shared and fresh pages are live
        assert_eq!(vmm.translate(vaddr(1)), frame(1));
        assert_eq!(vmm.translate(vaddr(2)), frame(2));
    }

    #[test]
    fn merge_imports_only_missing_pages_and_unmerge_removes_exactly_them() {
        let vmm = fresh_vmm();
        let shared = vmm.reserve_phys_pages(1).unwrap();
        let foreign = vmm.reserve_phys_pages(1).unwrap();
        let shared_vaddr = VirtAddr::new(0x0900_0000);
        let foreign_vaddr = VirtAddr::new(0x0901_0000);

        // the active (kernel) layout owns the shared page independently
        let mut active = MemoryLayout::new(true);
        active.add_data_page(shared, shared_vaddr);
        active.switch_from(false, None, &vmm);

        // the other process owns the shared page and one of its own
        let mut other = MemoryLayout::new(true);
        other.add_data_page(shared, shared_vaddr);
        other.add_data_page(foreign, foreign_vaddr);

        active.merge(&other, false, &vmm);

        // imported page: tagged, live, translating to the foreign frame
        let (_, entry) = active.lookup(foreign_vaddr).unwrap();
        assert!(entry.merged);
        assert_eq!(vmm.translate(foreign_vaddr), foreign);
        // pre-existing page: untagged
        assert!(!active.lookup(shared_vaddr).unwrap().1.merged);

        active.unmerge(&other, &vmm);

        // transient page gone, independent page untouched
        assert!(!active.contains(foreign_vaddr));
        assert!(!vmm.is_virtual_mapped(foreign_vaddr));
        assert!(active.contains(shared_vaddr));
        assert_eq!(vmm.translate(shared_vaddr), shared);
    }

    #[test]
    fn double_merge_is_idempotent() {
        let vmm = fresh_vmm();
        let foreign = vmm.reserve_phys_pages(1).unwrap();
        let foreign_vaddr = VirtAddr::new(0x0901_0000);

        let mut active = MemoryLayout::new(true);
        let mut other = MemoryLayout::new(true);
        other.add_data_page(foreign, foreign_vaddr);

        active.merge(&other, false, &vmm);
        active.merge(&other, false, &vmm);
        assert_eq!(active.page_count(), 1);

        active.unmerge(&other, &vmm);
        assert_eq!(active.page_count(), 0);
        assert!(!vmm.is_virtual_mapped(foreign_vaddr));
    }

    #[test]
    fn membership_queries_cover_all_maps() {
        let mut layout = MemoryLayout::new(false);
        layout.add_code_page(PhysAddr::new(0x0100_0000), CODE_VADDR);
        layout.add_data_page(PhysAddr::new(0x0100_1000), DATA_VADDR);

        // virtual side
        assert!(layout.contains_any_virtual_addresses(CODE_VADDR, 2 * PAGE_SIZE));
        assert!(layout.contains_all_virtual_addresses(CODE_VADDR, PAGE_SIZE));
        // the page after the code page is unowned
        assert!(!layout.contains_all_virtual_addresses(CODE_VADDR, 2 * PAGE_SIZE));
        assert!(!layout.contains_any_virtual_addresses(VirtAddr::new(0x0700_0000), PAGE_SIZE));

        // an unaligned span reaching one byte into an owned page counts
        assert!(layout.contains_any_virtual_addresses(
            VirtAddr::new(CODE_VADDR.as_u32() - 8),
            16
        ));

        // physical side
        assert!(layout.contains_any_physical_addresses(PhysAddr::new(0x0100_0000), PAGE_SIZE));
        assert!(layout.contains_all_physical_addresses(PhysAddr::new(0x0100_0000), 2 * PAGE_SIZE));
        assert!(!layout.contains_all_physical_addresses(PhysAddr::new(0x0100_0000), 3 * PAGE_SIZE));
        assert!(!layout.contains_any_physical_addresses(PhysAddr::new(0x0200_0000), PAGE_SIZE));
    }

    #[test]
    fn forward_and_reverse_lookup_preserve_offsets() {
        let mut layout = MemoryLayout::new(false);
        layout.add_data_page(PhysAddr::new(0x0100_0000), DATA_VADDR);

        assert_eq!(
            layout.physical_address_of(VirtAddr::new(DATA_VADDR.as_u32() + 0x123)),
            Some(PhysAddr::new(0x0100_0123))
        );
        assert_eq!(
            layout.virtual_address_of(PhysAddr::new(0x0100_0456)),
            Some(VirtAddr::new(DATA_VADDR.as_u32() + 0x456))
        );
        assert_eq!(layout.physical_address_of(VirtAddr::new(0x0700_0000)), None);
        assert_eq!(layout.virtual_address_of(PhysAddr::new(0x0700_0000)), None);
    }
}
