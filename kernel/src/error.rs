//! Process subsystem error types

use core::fmt;

/// Process subsystem error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// No `Unused` slot left in the process table
    TableFull,
    /// Kernel stack or page allocation failed
    OutOfMemory,
    /// Address-space collaborator refused the operation
    Vm(VmError),
    /// Operation needs a current process and there is none
    NoCurrentProcess,
    /// No live entry carries the requested pid
    NoSuchProcess,
    /// `wait` found no children at all
    NoChildren,
    /// `join` found no child thread with the requested pid
    NoSuchThread,
    /// Caller was killed while blocked
    Killed,
    /// Signal number out of range or not catchable
    InvalidSignal,
    /// Address not page aligned
    Misaligned,
    /// Open-file table is full
    NoFileSlot,
    /// Write fault inside the kernel's reserved region
    AccessViolation,
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcError::TableFull => write!(f, "process table full"),
            ProcError::OutOfMemory => write!(f, "out of memory"),
            ProcError::Vm(e) => write!(f, "address space error: {}", e),
            ProcError::NoCurrentProcess => write!(f, "no current process"),
            ProcError::NoSuchProcess => write!(f, "no such process"),
            ProcError::NoChildren => write!(f, "no children"),
            ProcError::NoSuchThread => write!(f, "no such thread"),
            ProcError::Killed => write!(f, "killed"),
            ProcError::InvalidSignal => write!(f, "invalid signal"),
            ProcError::Misaligned => write!(f, "address not page aligned"),
            ProcError::NoFileSlot => write!(f, "open-file table full"),
            ProcError::AccessViolation => write!(f, "access violation"),
        }
    }
}

/// Address-space error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    BadAddress,
    NotCopyOnWrite,
    Other,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::BadAddress => write!(f, "bad address"),
            VmError::NotCopyOnWrite => write!(f, "page is not copy-on-write"),
            VmError::Other => write!(f, "unspecified"),
        }
    }
}

impl From<VmError> for ProcError {
    fn from(e: VmError) -> Self {
        ProcError::Vm(e)
    }
}

/// Result alias for process operations
pub type Result<T> = core::result::Result<T, ProcError>;
