//! The process core as one owned value.

use core::sync::atomic::AtomicU64;

use spin::Once;

use crate::cpu::CpuTable;
use crate::error::{ProcError, Result};
use crate::machine::{Arch, Machine};
use crate::process::table::ProcTable;
use crate::process::{Pid, TrapFrame};

/// Process table, per-CPU state and platform collaborators.
///
/// Every operation of the process subsystem is a method on this type.
/// Methods documented as acting on "the caller" use the entity running
/// on the executing CPU.
pub struct Kernel<M: Machine> {
    pub(crate) machine: M,
    pub(crate) table: ProcTable<M>,
    pub(crate) cpus: CpuTable<M::Context>,
    pub(crate) fs_ready: Once<()>,
    pub(crate) switches: AtomicU64,
}

impl<M: Machine> Kernel<M> {
    pub fn new(machine: M) -> Self {
        let cpus = CpuTable::new(|| machine.scheduler_context());
        Kernel {
            machine,
            table: ProcTable::new(),
            cpus,
            fs_ready: Once::new(),
            switches: AtomicU64::new(0),
        }
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    /// Pid of the caller.
    pub fn current_pid(&self) -> Option<Pid> {
        let slot = self.current_slot()?;
        self.lock_table().slots[slot].pid
    }

    /// Address space the caller runs in.
    pub fn current_address_space(&self) -> Option<M::Space> {
        let (_, data) = self.myproc().ok()?;
        data.vm.map(|vm| vm.space())
    }

    /// Run `f` on the caller's saved user registers.
    pub fn current_trap_frame<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> Result<R> {
        let (_, data) = self.myproc()?;
        let stack = data.kstack.as_mut().ok_or(ProcError::NoCurrentProcess)?;
        Ok(f(stack.trap_frame_mut()))
    }
}
