//! The two-level hardware page-table driver.
//!
//! One page directory of 1024 entries; each present entry points at one of
//! 1024 page tables of 1024 entries, mapping 4 KiB a piece. The directory
//! and every table live in [`PageTableStorage`], a fixed kernel-memory
//! region reserved at link time — page tables cannot come from the heap,
//! because the heap only works once they do.

use arrayvec::ArrayVec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::constants::memory::{
    BUILTIN_DATA_END, BUILTIN_DATA_MAX_PAGES, BUILTIN_DATA_START, EBDA_END, EBDA_START,
    HIGH_HALF_BASE, KERNEL_FIXED_MEMORY_END, KERNEL_FIXED_MEMORY_START, LOW_MEMORY_END, PAGE_SIZE,
    PAGE_TABLE_AREA_START,
};
use crate::memory::addr::{PhysAddr, VirtAddr};
use crate::memory::tlb;

/// Entries per directory and per table.
pub const ENTRIES: usize = 1024;

/// Frame address bits of a PTE; the rest is flags.
const FRAME_MASK: u32 = 0xFFFF_F000;

bitflags! {
    /// Hardware page-table entry bits.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITEABLE     = 1 << 1;
        const USER_ALLOWED  = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const GLOBAL        = 1 << 8;
    }
}

bitflags! {
    /// Public mapping flags, translated to the hardware encoding on map.
    ///
    /// Absence of `KERNEL_ONLY` makes a page user-accessible.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct PageFlags: u32 {
        const PRESENT     = 1 << 0;
        const WRITEABLE   = 1 << 1;
        const KERNEL_ONLY = 1 << 2;
    }
}

impl PageFlags {
    /// Hardware encoding of the public flag set.
    pub fn encode(self) -> PteFlags {
        let mut pte = PteFlags::empty();
        if self.contains(PageFlags::PRESENT) {
            pte |= PteFlags::PRESENT;
        }
        if self.contains(PageFlags::WRITEABLE) {
            pte |= PteFlags::WRITEABLE;
        }
        if !self.contains(PageFlags::KERNEL_ONLY) {
            pte |= PteFlags::USER_ALLOWED;
        }
        pte
    }
}

/// Backing store for the directory and all 1024 tables.
///
/// In the kernel this is a single static claimed once by
/// [`kernel_storage`]; hosted tests build their own on the heap.
#[repr(C, align(4096))]
pub struct PageTableStorage {
    directory: [u32; ENTRIES],
    tables: [[u32; ENTRIES]; ENTRIES],
}

impl PageTableStorage {
    pub const fn new() -> Self {
        PageTableStorage {
            directory: [0; ENTRIES],
            tables: [[0; ENTRIES]; ENTRIES],
        }
    }

    /// Allocates a zeroed storage on the heap.
    ///
    /// The tables alone are 4 MiB, far past any sane stack frame, so this
    /// never goes through a by-value constructor.
    pub fn new_boxed() -> alloc::boxed::Box<Self> {
        let layout = core::alloc::Layout::new::<Self>();
        // SAFETY: all-zero bytes are a valid PageTableStorage (every entry
        // non-present), and the layout is the type's own.
        unsafe {
            let ptr = alloc::alloc::alloc_zeroed(layout).cast::<Self>();
            assert!(!ptr.is_null(), "page table storage allocation failed");
            alloc::boxed::Box::from_raw(ptr)
        }
    }
}

/// Hands out the kernel's fixed page-table storage, exactly once.
pub fn kernel_storage() -> &'static mut PageTableStorage {
    static CLAIMED: AtomicBool = AtomicBool::new(false);
    static mut STORAGE: PageTableStorage = PageTableStorage::new();

    assert!(
        !CLAIMED.swap(true, Ordering::SeqCst),
        "kernel page table storage already claimed"
    );
    // SAFETY: the claim flag guarantees a single mutable borrow for the
    // lifetime of the kernel.
    unsafe { &mut *core::ptr::addr_of_mut!(STORAGE) }
}

/// Architecture-specific engine turning abstract map/unmap/translate
/// requests into two-level page-table updates.
pub struct PageTableDriver {
    storage: &'static mut PageTableStorage,
}

impl PageTableDriver {
    pub fn new(storage: &'static mut PageTableStorage) -> Self {
        PageTableDriver { storage }
    }

    /// Physical address of the fixed table backing directory slot `dir`.
    fn table_frame_addr(dir: usize) -> u32 {
        PAGE_TABLE_AREA_START + PAGE_SIZE as u32 + (dir as u32) * PAGE_SIZE as u32
    }

    /// Maps `vaddr` to `paddr` and invalidates the stale translation.
    ///
    /// The directory entry for the covering table is made
    /// present+writeable+user-allowed; per-page protection lives entirely
    /// in the PTE.
    pub fn map(&mut self, paddr: PhysAddr, vaddr: VirtAddr, flags: PageFlags) {
        let dir = vaddr.directory_index();
        let table = vaddr.table_index();

        self.storage.tables[dir][table] = (paddr.as_u32() & FRAME_MASK) | flags.encode().bits();
        self.storage.directory[dir] = Self::table_frame_addr(dir)
            | (PteFlags::PRESENT | PteFlags::WRITEABLE | PteFlags::USER_ALLOWED).bits();

        tlb::invalidate(vaddr.as_u32());
    }

    /// Clears the mapping for `vaddr`, returning the physical address it
    /// pointed at so the caller can release the right frame bit.
    pub fn unmap(&mut self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let dir = vaddr.directory_index();
        let table = vaddr.table_index();

        let pte = self.storage.tables[dir][table];
        self.storage.tables[dir][table] = 0;
        tlb::invalidate(vaddr.as_u32());

        if pte & PteFlags::PRESENT.bits() != 0 {
            Some(PhysAddr::new(pte & FRAME_MASK))
        } else {
            None
        }
    }

    /// Translates `vaddr` through the live tables.
    ///
    /// Undefined for unmapped pages; callers pre-check with
    /// [`Self::is_virtual_mapped`].
    pub fn translate(&self, vaddr: VirtAddr) -> PhysAddr {
        debug_assert!(self.is_virtual_mapped(vaddr), "translate of unmapped {vaddr:?}");

        let pte = self.storage.tables[vaddr.directory_index()][vaddr.table_index()];
        PhysAddr::new((pte & FRAME_MASK) + vaddr.page_offset())
    }

    pub fn is_virtual_mapped(&self, vaddr: VirtAddr) -> bool {
        let pte = self.storage.tables[vaddr.directory_index()][vaddr.table_index()];
        pte & PteFlags::PRESENT.bits() != 0
    }

    /// True when the live PTE for `vaddr` is exactly `paddr` + `flags`.
    pub fn mapping_matches(&self, paddr: PhysAddr, vaddr: VirtAddr, flags: PageFlags) -> bool {
        let pte = self.storage.tables[vaddr.directory_index()][vaddr.table_index()];
        pte == (paddr.as_u32() & FRAME_MASK) | flags.encode().bits()
    }

    /// True when any live mapping points into `[start, end)` physical.
    pub fn are_any_physical_mapped(&self, start: PhysAddr, end: PhysAddr) -> bool {
        for dir in 0..ENTRIES {
            if self.storage.directory[dir] & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            for pte in &self.storage.tables[dir] {
                if pte & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let frame = pte & FRAME_MASK;
                if frame < end.as_u32() && frame + PAGE_SIZE as u32 > start.as_u32() {
                    return true;
                }
            }
        }
        false
    }

    pub fn is_within_kernel_fixed_memory(&self, vaddr: VirtAddr) -> bool {
        vaddr.as_u32() >= KERNEL_FIXED_MEMORY_START && vaddr.as_u32() < KERNEL_FIXED_MEMORY_END
    }

    /// Pages of the built-in static-data region, minus the architecturally
    /// isolated sub-regions. Seeds every new process's kernel-page set.
    pub fn builtin_process_vaddrs(&self) -> ArrayVec<VirtAddr, BUILTIN_DATA_MAX_PAGES> {
        let mut vaddrs = ArrayVec::new();
        let mut addr = BUILTIN_DATA_START;
        while addr < BUILTIN_DATA_END {
            if !(EBDA_START..EBDA_END).contains(&addr) {
                vaddrs.push(VirtAddr::new(addr));
            }
            addr += PAGE_SIZE as u32;
        }
        vaddrs
    }

    /// One-time bootstrap of the kernel's own mappings.
    ///
    /// Identity- and high-half-maps the first MiB, drops virtual page 0 as
    /// a null guard, then maps the kernel's fixed memory (image plus the
    /// page-table area) for the kernel alone.
    pub fn map_kernel(&mut self) {
        let low = PageFlags::PRESENT | PageFlags::WRITEABLE | PageFlags::KERNEL_ONLY;

        let mut addr = 0u32;
        while addr < LOW_MEMORY_END {
            self.map(PhysAddr::new(addr), VirtAddr::new(addr), low);
            self.map(PhysAddr::new(addr), VirtAddr::new(HIGH_HALF_BASE + addr), low);
            addr += PAGE_SIZE as u32;
        }

        // Dereferencing null must fault.
        let _ = self.unmap(VirtAddr::new(0));

        let mut addr = KERNEL_FIXED_MEMORY_START;
        while addr < KERNEL_FIXED_MEMORY_END {
            self.map(PhysAddr::new(addr), VirtAddr::new(addr), low);
            addr += PAGE_SIZE as u32;
        }
    }
}
