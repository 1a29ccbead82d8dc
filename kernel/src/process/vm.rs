//! User memory of the calling process: size changes, protection and
//! page-fault dispatch.

use crate::config::PAGE_SIZE;
use crate::error::{ProcError, Result, VmError};
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, Machine, Prot};
use crate::process::signal::SIGSEGV;

/// How a process-table entry refers to its address space.
///
/// Only the `Owned` side ever tears the space down. Threads created by
/// `clone` hold a `Shared` alias of their creator's space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmRef<S> {
    Owned(S),
    Shared(S),
}

impl<S: Copy> VmRef<S> {
    pub fn space(&self) -> S {
        match *self {
            VmRef::Owned(space) | VmRef::Shared(space) => space,
        }
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, VmRef::Owned(_))
    }
}

impl<M: Machine> Kernel<M> {
    /// Grow (or, for negative `n`, shrink) the caller's memory by `n`
    /// bytes. Returns the previous size.
    pub fn grow(&self, n: isize) -> Result<usize> {
        let (_, data) = self.myproc()?;
        let space = data.space()?;
        let old = data.size;
        let new = if n >= 0 {
            let target = old
                .checked_add(n.unsigned_abs())
                .ok_or(ProcError::Vm(VmError::BadAddress))?;
            self.machine
                .grow(space, old, target)
                .ok_or(ProcError::OutOfMemory)?
        } else {
            let target = old
                .checked_sub(n.unsigned_abs())
                .ok_or(ProcError::Vm(VmError::BadAddress))?;
            self.machine
                .shrink(space, old, target)
                .ok_or(ProcError::Vm(VmError::BadAddress))?
        };
        data.size = new;
        self.machine.activate(space);
        Ok(old)
    }

    /// Change the protection of `[addr, addr + len)` in the caller's
    /// address space, one page at a time. `addr` must be page aligned;
    /// the first page the address-space manager refuses aborts the call.
    pub fn protect(&self, addr: usize, len: usize, prot: Prot) -> Result<()> {
        if addr % PAGE_SIZE != 0 {
            return Err(ProcError::Misaligned);
        }
        let (_, data) = self.myproc()?;
        let space = data.space()?;
        let end = addr
            .checked_add(len)
            .ok_or(ProcError::Vm(VmError::BadAddress))?;
        let mut page = addr;
        while page < end {
            self.machine.set_protection(space, page, PAGE_SIZE, prot)?;
            // the last page of the address space has no successor
            let Some(next) = page.checked_add(PAGE_SIZE) else {
                break;
            };
            page = next;
        }
        // reload the page table to drop stale TLB entries
        self.machine.activate(space);
        Ok(())
    }

    /// Page-fault entry from the trap layer. Write faults go to the COW
    /// handler first; anything it cannot resolve becomes a `SIGSEGV`.
    ///
    /// Sharing is a property of the address space, not of the entry that
    /// faulted: a thread created before a `cow_fork` of its space shares
    /// the same read-only frames. Only the address-space manager can tell
    /// a shared page from a protected one.
    pub fn page_fault(&self, write: bool) -> Result<()> {
        let sharing = self.myproc()?.1.is_cow;
        if write {
            match self.cow_fault() {
                Ok(()) => return Ok(()),
                Err(e) if sharing => log::debug!("[COW] unresolved write fault: {}", e),
                Err(_) => {}
            }
        }
        self.deliver(SIGSEGV)
    }
}
