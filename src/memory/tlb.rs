//! Translation-cache invalidation.
//!
//! Single core, single active address space: invalidation never has to
//! reach another CPU, so this is the local `invlpg`/directory-reload pair.

/// Drops any cached translation for `vaddr`.
#[inline]
pub fn invalidate(vaddr: u32) {
    #[cfg(all(target_arch = "x86", not(test)))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86", not(test))))]
    let _ = vaddr;
}

/// Drops every non-global cached translation by reloading the directory base.
#[inline]
pub fn flush_all() {
    #[cfg(all(target_arch = "x86", not(test)))]
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}
