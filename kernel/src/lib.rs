//! KPIO Process Core
//!
//! Process table, per-CPU scheduler, sleep/wakeup, fork and
//! copy-on-write fork, exit/wait/kill, synchronous signal delivery and
//! user threads (clone/join/texit) for a small multiprocessor kernel.
//!
//! The crate owns no hardware. Context switching, address spaces,
//! physical pages and the file layer are supplied by the platform through
//! the [`machine`] traits, and all state lives in one [`Kernel`] value.
//!
//! # Example
//!
//! ```ignore
//! let kernel = Kernel::new(platform);
//! kernel.userinit(INITCODE)?;
//! kernel.scheduler(); // on every CPU
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod cpu;
pub mod error;
pub mod kernel;
pub mod machine;
pub mod process;
pub mod scheduler;
pub mod sync;

#[cfg(test)]
mod tests;

pub use error::{ProcError, Result, VmError};
pub use kernel::Kernel;
pub use machine::{AddressSpaces, Arch, FaultKind, FileSystem, Machine, Page, Prot};
pub use process::{Joined, Pid, ProcInfo, ProcState, SigAction, TrapFrame};
pub use sync::Channel;
