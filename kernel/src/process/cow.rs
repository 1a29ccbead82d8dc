//! Copy-on-write fork and write-fault handling.
//!
//! The sharing itself (read-only mappings, frame reference counts) lives
//! in the address-space manager. This module only decides when to ask
//! for it and tracks which processes take part.

use crate::config::KERNBASE;
use crate::error::{ProcError, Result};
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, Arch, Machine};
use crate::process::table::EntityKind;
use crate::process::vm::VmRef;
use crate::process::Pid;

impl<M: Machine> Kernel<M> {
    /// Like [`Kernel::fork`], but the child shares the parent's frames
    /// read-only until either side writes. Both parent and child are
    /// marked as COW participants.
    pub fn cow_fork(&self) -> Result<Pid> {
        let (me, parent) = self.myproc()?;
        let space = parent.space()?;
        let (child, pid) = self.allocate_child(me, EntityKind::Process)?;
        // SAFETY: `allocate_child` handed us the embryo.
        let data = unsafe { self.table.data(child) };

        let Some(shared) = self.machine.duplicate_cow(space, parent.size) else {
            self.abandon(child);
            return Err(ProcError::OutOfMemory);
        };
        data.vm = Some(VmRef::Owned(shared));
        data.size = parent.size;
        self.inherit(parent, data);
        data.kstack_mut().trap_frame_mut().rax = 0;
        data.is_cow = true;
        parent.is_cow = true;

        // the parent may still hold stale writable TLB entries
        self.machine.activate(space);
        self.publish(child);
        log::debug!("[PROC] cow_fork: child pid {} in slot {}", pid, child);
        Ok(pid)
    }

    /// Resolve a write fault on a copy-on-write page of the caller at the
    /// faulting address reported by the CPU.
    pub fn cow_fault(&self) -> Result<()> {
        let addr = self.machine.fault_address();
        if addr >= KERNBASE {
            log::warn!("[COW] write to kernel region at {:#x}", addr);
            return Err(ProcError::AccessViolation);
        }
        let (_, data) = self.myproc()?;
        let space = data.space()?;
        self.machine.handle_write_fault(space, addr)?;
        self.machine.activate(space);
        log::trace!("[COW] private copy of {:#x}", addr);
        Ok(())
    }
}
