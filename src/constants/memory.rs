pub const PAGE_SIZE: usize = 4096;
pub const FRAME_SIZE: usize = 4096;

/// Total 4 KiB pages in the 4 GiB address space.
pub const PAGE_COUNT: usize = 1 << 20;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// End of low memory. The first MiB is identity- and high-half-mapped at boot.
pub const LOW_MEMORY_END: u32 = 0x0010_0000;

/// High-half alias of low memory.
pub const HIGH_HALF_BASE: u32 = 0xC000_0000;

/// The contiguous kernel image, page aligned.
pub const KERNEL_IMAGE_START: u32 = 0x0010_0000;
pub const KERNEL_IMAGE_END: u32 = 0x0040_0000;

// The page directory lives in the first page of the area, the 1024 page
// tables right behind it. This region is fixed at link time, never
// heap-backed: the heap itself needs working mappings.
pub const PAGE_TABLE_AREA_START: u32 = 0x0040_0000;
pub const PAGE_TABLE_AREA_END: u32 = 0x0080_1000;

/// Kernel image plus the page-table area: memory no process may ever own.
pub const KERNEL_FIXED_MEMORY_START: u32 = KERNEL_IMAGE_START;
pub const KERNEL_FIXED_MEMORY_END: u32 = PAGE_TABLE_AREA_END;

/// Static data shared with every process. Page 0 stays unmapped (null guard).
pub const BUILTIN_DATA_START: u32 = 0x0000_1000;
pub const BUILTIN_DATA_END: u32 = 0x000A_0000;

// Firmware scratch inside the built-in region; never handed to processes.
pub const EBDA_START: u32 = 0x0008_0000;
pub const EBDA_END: u32 = 0x000A_0000;

/// Upper bound on pages enumerated out of the built-in data region.
pub const BUILTIN_DATA_MAX_PAGES: usize = 160;

/// Poison value for unset address fields; must never reach map/unmap.
pub const INVALID_ADDRESS_SENTINEL: u32 = 0xDEAD_BEEF;
