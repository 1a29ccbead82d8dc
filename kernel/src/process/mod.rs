//! Process Management
//!
//! The process table and everything that creates, ends or reaps its
//! entries: fork, copy-on-write fork, exit, wait, kill, signals and
//! user threads.

pub mod context;
pub mod cow;
pub mod dump;
pub mod lifecycle;
pub mod signal;
pub mod table;
pub mod thread;
pub mod vm;

pub use context::{KernelStack, TrapFrame};
pub use dump::ProcInfo;
pub use signal::{SigAction, SigInfo, SignalFrame, SignalTable, SIGNAL_FRAME_SIZE};
pub use table::{EntityKind, Pid, ProcName, ProcState, TableGuard};
pub use thread::Joined;
pub use vm::VmRef;
