//! The process-wide virtual memory manager.
//!
//! Single entry point over the page-table driver and the occupancy
//! bitmaps. The whole state sits behind one spin lock so that every
//! "find a free range, then map it" sequence is atomic with respect to
//! allocation from interrupt handlers; the lock busy-waits and never
//! yields.

use bitflags::bitflags;
use core::fmt;
use spin::Mutex;

use crate::constants::memory::{
    HIGH_HALF_BASE, INVALID_ADDRESS_SENTINEL, KERNEL_FIXED_MEMORY_END, KERNEL_FIXED_MEMORY_START,
    LOW_MEMORY_END, PAGE_COUNT, PAGE_SIZE,
};
use crate::memory::addr::{PhysAddr, VirtAddr};
use crate::memory::bitmap::PageBitmap;
use crate::memory::page_table::{PageFlags, PageTableDriver, PageTableStorage};

bitflags! {
    /// Which occupancy bitmaps a map/unmap call updates.
    ///
    /// `VIRTUAL`-only unmap releases the page while the frame stays
    /// reserved — the rebind case during layout switches.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct UpdateUsedPages: u8 {
        const VIRTUAL  = 1 << 0;
        const PHYSICAL = 1 << 1;
        const BOTH     = Self::VIRTUAL.bits() | Self::PHYSICAL.bits();
    }
}

/// Allocation failures surfaced to callers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemError {
    /// No contiguous free physical or virtual range of the requested size.
    /// Raised before any side effect.
    OutOfMemory,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory => write!(f, "no contiguous free page range of requested size"),
        }
    }
}

struct VmState {
    used_phys_pages: PageBitmap,
    used_virt_pages: PageBitmap,
    /// Monotonic: set on every mapping, never cleared. Kernel allocations
    /// search this one so they never reuse an address that was ever mapped.
    all_used_virt_pages: PageBitmap,
    driver: PageTableDriver,
}

impl VmState {
    fn map_page(&mut self, paddr: PhysAddr, vaddr: VirtAddr, flags: PageFlags, update: UpdateUsedPages) {
        self.driver.map(paddr, vaddr, flags);
        if update.contains(UpdateUsedPages::VIRTUAL) {
            self.used_virt_pages.set(vaddr.page_index());
            self.all_used_virt_pages.set(vaddr.page_index());
        }
        if update.contains(UpdateUsedPages::PHYSICAL) {
            self.used_phys_pages.set(paddr.page_index());
        }
    }

    fn unmap_page(&mut self, vaddr: VirtAddr, update: UpdateUsedPages) {
        let previous = self.driver.unmap(vaddr);
        if update.contains(UpdateUsedPages::VIRTUAL) {
            self.used_virt_pages.clear(vaddr.page_index());
        }
        if update.contains(UpdateUsedPages::PHYSICAL) {
            if let Some(paddr) = previous {
                self.used_phys_pages.clear(paddr.page_index());
            }
        }
    }

    /// Marks an identity-mapped bootstrap range used in every bitmap.
    fn reserve_identity(&mut self, start: u32, end: u32) {
        let mut addr = start;
        while addr < end {
            let index = (addr as usize) / PAGE_SIZE;
            self.used_phys_pages.set(index);
            self.used_virt_pages.set(index);
            self.all_used_virt_pages.set(index);
            addr += PAGE_SIZE as u32;
        }
    }
}

/// Process-wide façade over the page-table driver; arbitrates every
/// allocation+mapping sequence.
pub struct VirtualMemoryManager {
    state: Mutex<VmState>,
}

impl VirtualMemoryManager {
    /// Bootstraps paging: builds the kernel mappings and seeds the bitmaps
    /// with everything `map_kernel` established.
    pub fn init(storage: &'static mut PageTableStorage) -> Self {
        let mut driver = PageTableDriver::new(storage);
        driver.map_kernel();

        let mut state = VmState {
            used_phys_pages: PageBitmap::new(PAGE_COUNT),
            used_virt_pages: PageBitmap::new(PAGE_COUNT),
            all_used_virt_pages: PageBitmap::new(PAGE_COUNT),
            driver,
        };

        // Low memory: identity view plus the high-half alias. Page 0 is
        // unmapped but stays reserved so it can never be handed out.
        state.reserve_identity(0, LOW_MEMORY_END);
        let mut addr = HIGH_HALF_BASE;
        while addr - HIGH_HALF_BASE < LOW_MEMORY_END {
            let index = (addr as usize) / PAGE_SIZE;
            state.used_virt_pages.set(index);
            state.all_used_virt_pages.set(index);
            addr += PAGE_SIZE as u32;
        }
        state.reserve_identity(KERNEL_FIXED_MEMORY_START, KERNEL_FIXED_MEMORY_END);

        VirtualMemoryManager {
            state: Mutex::new(state),
        }
    }

    fn check_address(addr: u32) {
        if addr == INVALID_ADDRESS_SENTINEL {
            log::error!("invalid address sentinel {addr:#010x} reached map/unmap");
            panic!("invalid address sentinel reached map/unmap");
        }
    }

    /// Maps `size` bytes (rounded up to whole pages) starting at the given
    /// physical/virtual pair.
    pub fn map(&self, paddr: PhysAddr, vaddr: VirtAddr, size: usize, flags: PageFlags, update: UpdateUsedPages) {
        Self::check_address(paddr.as_u32());
        Self::check_address(vaddr.as_u32());

        let mut state = self.state.lock();
        for page in 0..size.div_ceil(PAGE_SIZE) {
            let offset = (page * PAGE_SIZE) as u32;
            state.map_page(
                PhysAddr::new(paddr.as_u32() + offset),
                VirtAddr::new(vaddr.as_u32() + offset),
                flags,
                update,
            );
        }
    }

    /// Unmaps `size` bytes (rounded up to whole pages) starting at `vaddr`.
    pub fn unmap(&self, vaddr: VirtAddr, size: usize, update: UpdateUsedPages) {
        Self::check_address(vaddr.as_u32());

        let mut state = self.state.lock();
        for page in 0..size.div_ceil(PAGE_SIZE) {
            let offset = (page * PAGE_SIZE) as u32;
            state.unmap_page(VirtAddr::new(vaddr.as_u32() + offset), update);
        }
    }

    /// Allocates and maps one free page. See [`Self::map_free_pages`].
    pub fn map_free_page(&self, flags: PageFlags) -> Result<VirtAddr, MemError> {
        self.map_free_pages(flags, 1)
    }

    /// Finds `count` contiguous free virtual pages and `count` contiguous
    /// free physical frames and maps them, atomically under the allocation
    /// lock. Fails with no side effect when either search comes up empty.
    pub fn map_free_pages(&self, flags: PageFlags, count: usize) -> Result<VirtAddr, MemError> {
        let mut state = self.state.lock();
        let virt = state
            .used_virt_pages
            .find_contiguous_clear_entries(count)
            .ok_or(MemError::OutOfMemory)?;
        let phys = state
            .used_phys_pages
            .find_contiguous_clear_entries(count)
            .ok_or(MemError::OutOfMemory)?;

        Self::commit_range(&mut state, phys, virt, flags, count);
        Ok(VirtAddr::new((virt * PAGE_SIZE) as u32))
    }

    /// Like [`Self::map_free_pages`], but the virtual search runs on the
    /// monotonic bitmap: a kernel allocation never lands on any address
    /// that was ever mapped, even one unmapped since. The bitmap only
    /// grows, so kernel churn spends 4 GiB of virtual space over the
    /// machine's lifetime.
    pub fn map_free_pages_for_kernel(&self, flags: PageFlags, count: usize) -> Result<VirtAddr, MemError> {
        let mut state = self.state.lock();
        let virt = state
            .all_used_virt_pages
            .find_contiguous_clear_entries(count)
            .ok_or(MemError::OutOfMemory)?;
        let phys = state
            .used_phys_pages
            .find_contiguous_clear_entries(count)
            .ok_or(MemError::OutOfMemory)?;

        Self::commit_range(&mut state, phys, virt, flags, count);
        Ok(VirtAddr::new((virt * PAGE_SIZE) as u32))
    }

    /// Maps caller-supplied physical frames (DMA buffers, device windows)
    /// at a freshly found free virtual range.
    pub fn map_free_physical_pages(
        &self,
        paddr: PhysAddr,
        flags: PageFlags,
        count: usize,
    ) -> Result<VirtAddr, MemError> {
        Self::check_address(paddr.as_u32());

        let mut state = self.state.lock();
        let virt = state
            .used_virt_pages
            .find_contiguous_clear_entries(count)
            .ok_or(MemError::OutOfMemory)?;

        Self::commit_range(&mut state, paddr.page_index(), virt, flags, count);
        Ok(VirtAddr::new((virt * PAGE_SIZE) as u32))
    }

    // Once both ranges are secured nothing below may fail; the driver
    // writes PTEs into fixed storage and cannot run out of anything.
    fn commit_range(state: &mut VmState, phys: usize, virt: usize, flags: PageFlags, count: usize) {
        for page in 0..count {
            state.map_page(
                PhysAddr::new(((phys + page) * PAGE_SIZE) as u32),
                VirtAddr::new(((virt + page) * PAGE_SIZE) as u32),
                flags,
                UpdateUsedPages::BOTH,
            );
        }
    }

    /// Reserves `count` contiguous free physical frames without mapping
    /// them. For loaders and DMA setup that pick the virtual side
    /// themselves.
    pub fn reserve_phys_pages(&self, count: usize) -> Result<PhysAddr, MemError> {
        let mut state = self.state.lock();
        let phys = state
            .used_phys_pages
            .find_contiguous_clear_entries(count)
            .ok_or(MemError::OutOfMemory)?;
        for page in 0..count {
            state.used_phys_pages.set(phys + page);
        }
        Ok(PhysAddr::new((phys * PAGE_SIZE) as u32))
    }

    /// Probes for a free virtual range without committing it.
    pub fn find_free_virt_pages(&self, count: usize) -> Option<VirtAddr> {
        let state = self.state.lock();
        state
            .used_virt_pages
            .find_contiguous_clear_entries(count)
            .map(|index| VirtAddr::new((index * PAGE_SIZE) as u32))
    }

    /// Probes for a free physical range without committing it.
    pub fn find_free_phys_pages(&self, count: usize) -> Option<PhysAddr> {
        let state = self.state.lock();
        state
            .used_phys_pages
            .find_contiguous_clear_entries(count)
            .map(|index| PhysAddr::new((index * PAGE_SIZE) as u32))
    }

    pub fn is_virtual_mapped(&self, vaddr: VirtAddr) -> bool {
        self.state.lock().driver.is_virtual_mapped(vaddr)
    }

    /// See [`PageTableDriver::translate`]; callers pre-check the mapping.
    pub fn translate(&self, vaddr: VirtAddr) -> PhysAddr {
        self.state.lock().driver.translate(vaddr)
    }

    pub fn mapping_matches(&self, paddr: PhysAddr, vaddr: VirtAddr, flags: PageFlags) -> bool {
        self.state.lock().driver.mapping_matches(paddr, vaddr, flags)
    }

    pub fn are_any_physical_mapped(&self, start: PhysAddr, end: PhysAddr) -> bool {
        self.state.lock().driver.are_any_physical_mapped(start, end)
    }

    pub fn is_within_kernel_fixed_memory(&self, vaddr: VirtAddr) -> bool {
        self.state.lock().driver.is_within_kernel_fixed_memory(vaddr)
    }

    pub fn builtin_process_vaddrs(
        &self,
    ) -> arrayvec::ArrayVec<VirtAddr, { crate::constants::memory::BUILTIN_DATA_MAX_PAGES }> {
        self.state.lock().driver.builtin_process_vaddrs()
    }

    pub fn is_frame_used(&self, paddr: PhysAddr) -> bool {
        self.state.lock().used_phys_pages.is_set(paddr.page_index())
    }

    pub fn is_virt_page_used(&self, vaddr: VirtAddr) -> bool {
        self.state.lock().used_virt_pages.is_set(vaddr.page_index())
    }
}
