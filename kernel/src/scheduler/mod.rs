//! Per-CPU scheduler and the context-switch protocol.
//!
//! Each CPU runs [`Kernel::scheduler`] on its own scheduler context. An
//! entity gives the CPU back only through `sched`, holding the table lock
//! and having already moved itself out of `Running`. The lock travels
//! with the switch: whoever resumes releases it.

use core::mem::ManuallyDrop;
use core::sync::atomic::Ordering;

use crate::config::NPROC;
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, Arch, FileSystem, Machine};
use crate::process::{ProcState, TableGuard};

impl<M: Machine> Kernel<M> {
    /// Scheduler loop for the executing CPU. Never returns.
    pub fn scheduler(&self) -> ! {
        loop {
            self.schedule_pass();
        }
    }

    /// One scan of the table, running every entity found `Runnable` in
    /// table order. Returns how many were run.
    pub fn schedule_pass(&self) -> usize {
        // let devices interrupt an otherwise idle CPU
        self.machine.intr_enable();

        let mut table = self.lock_table();
        let mut ran = 0;
        for slot in 0..NPROC {
            if table.slots[slot].state != ProcState::Runnable {
                continue;
            }
            // SAFETY: a runnable entity is suspended and only the
            // scheduler holding the lock may resume it.
            let data = unsafe { self.table.data(slot) };
            let Some(context) = data.context.as_ref() else {
                panic!("scheduler: slot {} runnable without context", slot);
            };
            let load: *const M::Context = context;
            if let Some(vm) = data.vm {
                self.machine.activate(vm.space());
            }
            table.slots[slot].state = ProcState::Running;

            let cpu = self.mycpu();
            cpu.proc = Some(slot);
            let save: *mut M::Context = &mut cpu.scheduler;
            log::trace!("[SCHED] cpu{} -> slot {}", self.machine.cpu_id(), slot);
            self.switches.fetch_add(1, Ordering::Relaxed);
            // SAFETY: both contexts outlive the switch; the entity hands
            // the lock back through `sched`.
            unsafe { self.machine.switch(save, load) };

            self.machine.activate_kernel();
            self.mycpu().proc = None;
            ran += 1;
        }
        drop(table);
        ran
    }

    /// Switch from the caller back to this CPU's scheduler.
    ///
    /// The caller must hold the table lock exactly once, with interrupts
    /// off, and must already have left `Running`. The interrupt-enable
    /// state saved by the outermost `push_off` belongs to this kernel
    /// thread and is carried across the switch.
    pub(crate) fn sched<'a>(&'a self, table: TableGuard<'a, M>) -> TableGuard<'a, M> {
        // a failed check halts with the lock still held
        let table = ManuallyDrop::new(table);
        let cpu_id = self.machine.cpu_id();
        if !self.table.lock.holding(cpu_id) {
            panic!("sched ptable.lock");
        }
        let cpu = self.mycpu();
        if cpu.ncli != 1 {
            panic!("sched locks");
        }
        let Some(slot) = cpu.proc else {
            panic!("sched: no process");
        };
        if table.slots[slot].state == ProcState::Running {
            panic!("sched running");
        }
        if self.machine.intr_enabled() {
            panic!("sched interruptible");
        }

        let intena = cpu.intena;
        let load: *const M::Context = &cpu.scheduler;
        // SAFETY: the running entity owns its private data.
        let data = unsafe { self.table.data(slot) };
        let Some(context) = data.context.as_mut() else {
            panic!("sched: slot {} has no context", slot);
        };
        let save: *mut M::Context = context;
        // SAFETY: see `schedule_pass`.
        unsafe { self.machine.switch(save, load) };
        self.mycpu().intena = intena;
        ManuallyDrop::into_inner(table)
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        let Some(me) = self.current_slot() else {
            return;
        };
        let mut table = self.lock_table();
        table.slots[me].state = ProcState::Runnable;
        let table = self.sched(table);
        drop(table);
    }

    /// First code a new entity runs after its first switch. Releases the
    /// table lock taken by the scheduler that picked it, and runs the
    /// file system's process-context initialization once.
    pub fn forkret(&self) {
        // SAFETY: `schedule_pass` switched here holding the lock on this
        // CPU with one `push_off`.
        drop(unsafe { TableGuard::adopt(self) });
        self.fs_ready.call_once(|| {
            log::debug!("[SCHED] first process: file system init");
            self.machine.init();
        });
    }

    /// Total context switches into entities since boot.
    pub fn context_switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }
}
