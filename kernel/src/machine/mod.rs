//! Platform collaborators.
//!
//! The process core drives the CPU, the address-space manager and the
//! file layer only through these traits. A platform implements all three
//! on one value and hands it to [`crate::Kernel::new`].

pub mod arch;
pub mod fs;
pub mod memory;

pub use arch::Arch;
pub use fs::FileSystem;
pub use memory::{AddressSpaces, FaultKind, Page, Prot};

/// Everything the process core needs from the platform.
pub trait Machine: Arch + AddressSpaces + FileSystem + Sync {}

impl<T: Arch + AddressSpaces + FileSystem + Sync> Machine for T {}
