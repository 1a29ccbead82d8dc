//! Raw spin lock guarding the process table.
//!
//! The lock records its holder so re-entrant acquisition panics instead
//! of deadlocking. It does no interrupt bookkeeping itself; the table
//! guard pairs every acquire with `push_off` and every release with
//! `pop_off`.

use core::cell::UnsafeCell;
use core::hint;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const NO_CPU: usize = usize::MAX;

pub struct SpinLock<T> {
    name: &'static str,
    locked: AtomicBool,
    cpu: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reached through `data_ptr`, whose users hold
// the lock or accept racy reads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        SpinLock {
            name,
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            data: UnsafeCell::new(data),
        }
    }

    pub fn acquire(&self, cpu: usize) {
        if self.holding(cpu) {
            panic!("acquire: {} already held", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn release(&self, cpu: usize) {
        if !self.holding(cpu) {
            panic!("release: {} not held", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }

    /// Is the lock held by `cpu`?
    pub fn holding(&self, cpu: usize) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpu
    }

    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}
