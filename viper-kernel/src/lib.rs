//! A host-side, thread-based simulation of the ViperOS microkernel's
//! user-visible surface: capability table, channel IPC, shared memory,
//! poll-set multiplexing, name registry, and the syscall dispatcher that
//! ties them together.

pub mod assign;
pub mod bootstrap;
pub mod captable;
pub mod channel;
pub mod object;
pub mod pollset;
pub mod process;
pub mod shm;
pub mod trap;

pub use captable::CapTable;
pub use process::Process;
