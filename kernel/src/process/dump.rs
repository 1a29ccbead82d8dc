//! Console listing of live processes for debugging.

use alloc::vec::Vec;
use core::fmt;
use core::ptr;

use crate::config::NPROC;
use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::table::{EntityKind, ProcName, ProcState, Slot};
use crate::process::Pid;

/// One line of the process dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    pub slot: usize,
    pub pid: Option<Pid>,
    pub parent: Option<Pid>,
    pub state: ProcState,
    pub kind: EntityKind,
    pub name: ProcName,
}

impl fmt::Display for ProcInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} {} {}", pid, self.state.label(), self.name),
            None => write!(f, "- {} {}", self.state.label(), self.name),
        }
    }
}

impl<M: Machine> Kernel<M> {
    /// List every non-`Unused` entry and log it.
    ///
    /// Runs without the table lock so it works on a wedged system; the
    /// entries may be mutually stale.
    pub fn procdump(&self) -> Vec<ProcInfo> {
        let state = self.table.lock.data_ptr();
        let read = |slot: usize| -> Slot {
            // SAFETY: plain-old-data read of a live array element; a racing
            // writer can only make the copy stale.
            unsafe { ptr::read_volatile(ptr::addr_of!((*state).slots[slot])) }
        };

        let mut out = Vec::new();
        for slot in 0..NPROC {
            let entry = read(slot);
            if entry.state == ProcState::Unused {
                continue;
            }
            let info = ProcInfo {
                slot,
                pid: entry.pid,
                parent: entry.parent.filter(|&p| p < NPROC).and_then(|p| read(p).pid),
                state: entry.state,
                kind: entry.kind,
                name: entry.name,
            };
            log::info!("{}", info);
            out.push(info);
        }
        out
    }
}
