//! Synchronization primitives: the table lock and sleep/wakeup channels.

pub mod sleep;
pub mod spinlock;

pub use sleep::Channel;
pub use spinlock::SpinLock;
