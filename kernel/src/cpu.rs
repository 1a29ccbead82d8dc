//! Per-CPU state and interrupt-disable nesting.

use core::cell::UnsafeCell;

use crate::config::NCPU;
use crate::kernel::Kernel;
use crate::machine::{Arch, Machine};

/// State owned by one CPU.
pub struct Cpu<C> {
    /// Table slot of the entity running here, if any.
    pub(crate) proc: Option<usize>,
    /// Saved context of this CPU's scheduler loop.
    pub(crate) scheduler: C,
    /// Depth of `push_off` nesting.
    pub(crate) ncli: u32,
    /// Were interrupts enabled before the outermost `push_off`?
    pub(crate) intena: bool,
}

impl<C> Cpu<C> {
    fn new(scheduler: C) -> Self {
        Cpu {
            proc: None,
            scheduler,
            ncli: 0,
            intena: false,
        }
    }
}

pub(crate) struct CpuTable<C> {
    cpus: [UnsafeCell<Cpu<C>>; NCPU],
}

// SAFETY: each `Cpu` is only touched by code running on that CPU with
// interrupts disabled.
unsafe impl<C: Send> Sync for CpuTable<C> {}

impl<C> CpuTable<C> {
    pub(crate) fn new(mut scheduler_context: impl FnMut() -> C) -> Self {
        CpuTable {
            cpus: core::array::from_fn(|_| UnsafeCell::new(Cpu::new(scheduler_context()))),
        }
    }

    fn get(&self, id: usize) -> *mut Cpu<C> {
        match self.cpus.get(id) {
            Some(cpu) => cpu.get(),
            None => panic!("cpu id {} out of range", id),
        }
    }
}

impl<M: Machine> Kernel<M> {
    /// The executing CPU's state. Interrupts must be disabled so the
    /// caller cannot migrate; keep the borrow short.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn mycpu(&self) -> &mut Cpu<M::Context> {
        // SAFETY: only this CPU touches its own entry and it cannot be
        // rescheduled while interrupts are off.
        unsafe { &mut *self.cpus.get(self.machine.cpu_id()) }
    }

    /// Disable interrupts, remembering the outermost prior state.
    /// Matched by `pop_off`; it takes two `pop_off`s to undo two
    /// `push_off`s.
    pub(crate) fn push_off(&self) {
        let old = self.machine.intr_enabled();
        self.machine.intr_disable();
        let cpu = self.mycpu();
        if cpu.ncli == 0 {
            cpu.intena = old;
        }
        cpu.ncli += 1;
    }

    pub(crate) fn pop_off(&self) {
        if self.machine.intr_enabled() {
            panic!("pop_off - interruptible");
        }
        let cpu = self.mycpu();
        if cpu.ncli == 0 {
            panic!("pop_off");
        }
        cpu.ncli -= 1;
        if cpu.ncli == 0 && cpu.intena {
            self.machine.intr_enable();
        }
    }

    /// Table slot of the entity running on this CPU.
    pub(crate) fn current_slot(&self) -> Option<usize> {
        self.push_off();
        let slot = self.mycpu().proc;
        self.pop_off();
        slot
    }
}
