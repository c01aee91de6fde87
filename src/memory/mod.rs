pub mod addr;
pub mod bitmap;
pub mod layout;
pub mod page_table;
pub mod tlb;
pub mod vmm;

pub use addr::{PhysAddr, VirtAddr};
pub use layout::{MemoryLayout, PageEntry, PageKind};
pub use page_table::{PageFlags, PageTableStorage};
pub use vmm::{MemError, UpdateUsedPages, VirtualMemoryManager};

/// Brings up the virtual-memory subsystem on the kernel's fixed
/// page-table storage. Call once at boot.
pub fn init() -> VirtualMemoryManager {
    VirtualMemoryManager::init(page_table::kernel_storage())
}
