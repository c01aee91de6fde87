pub mod access;
pub mod process;

pub use access::ForeignMemoryAccess;
pub use process::{Process, ProcessState};
