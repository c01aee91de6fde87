//! mica — an educational kernel built around its virtual-memory core.
//!
//! The implemented subsystem is virtual address-space management: the
//! physical/virtual page bitmaps, the two-level page-table driver, the
//! process-wide [`memory::VirtualMemoryManager`] and the per-process
//! [`memory::MemoryLayout`] with its switch/merge/unmerge protocol.
//! The rest of the kernel (scheduler, IPC, drivers, loaders) reaches this
//! subsystem only through the seams in [`sched`] and [`processes`].

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod constants;
pub mod logging;
pub mod memory;
pub mod processes;
pub mod sched;
