//! User-level threads: process-table entries sharing their creator's
//! address space.

use core::mem::size_of;

use crate::config::THREAD_STACK_SIZE;
use crate::error::{ProcError, Result, VmError};
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, Machine};
use crate::process::table::{EntityKind, ProcState, ThreadFrame};
use crate::process::vm::VmRef;
use crate::process::Pid;
use crate::sync::Channel;

/// What `join` collects from a finished thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joined {
    pub pid: Pid,
    /// Stack originally passed to `clone`, for the caller to free.
    pub stack: usize,
    pub retval: usize,
}

const WORD: usize = size_of::<u64>();

impl<M: Machine> Kernel<M> {
    /// Start a thread running `entry(arg)` on the one-page user stack at
    /// `stack`, in the caller's address space.
    ///
    /// The top of `stack` receives a start frame: a zero return address
    /// followed by `arg`. `arg` is also passed in `rdi`.
    pub fn clone_thread(&self, entry: usize, arg: usize, stack: usize) -> Result<Pid> {
        let (me, parent) = self.myproc()?;
        let space = parent.space()?;
        let sp = stack
            .checked_add(THREAD_STACK_SIZE - 2 * WORD)
            .ok_or(ProcError::Vm(VmError::BadAddress))?;
        let mut start = [0u8; 2 * WORD];
        start[WORD..].copy_from_slice(&(arg as u64).to_ne_bytes());
        self.machine.copy_out(space, sp, &start)?;

        let (child, pid) = self.allocate_child(me, EntityKind::Thread)?;
        // SAFETY: `allocate_child` handed us the embryo.
        let data = unsafe { self.table.data(child) };
        data.vm = Some(VmRef::Shared(space));
        data.size = parent.size;
        data.thread = Some(ThreadFrame { stack, retval: 0 });
        self.inherit(parent, data);
        data.is_cow = parent.is_cow;
        let tf = data.kstack_mut().trap_frame_mut();
        tf.rsp = sp as u64;
        tf.rip = entry as u64;
        tf.rdi = arg as u64;

        self.publish(child);
        log::debug!("[PROC] clone: thread pid {} entry {:#x}", pid, entry);
        Ok(pid)
    }

    /// Wait for the child thread `pid` to finish and reclaim its slot.
    /// The shared address space is left alone.
    pub fn join(&self, pid: Pid) -> Result<Joined> {
        let me = self.current_slot().ok_or(ProcError::NoCurrentProcess)?;
        let mut table = self.lock_table();
        loop {
            let child = table
                .slots
                .iter()
                .position(|s| {
                    s.state != ProcState::Unused
                        && s.pid == Some(pid)
                        && s.parent == Some(me)
                        && s.kind == EntityKind::Thread
                })
                .ok_or(ProcError::NoSuchThread)?;
            if table.slots[child].state == ProcState::Zombie {
                // SAFETY: zombie reaped under the lock.
                let data = unsafe { self.table.data(child) };
                let frame = data.thread.ok_or(ProcError::NoSuchThread)?;
                self.free_slot(&mut table, child);
                log::debug!("[PROC] join: reaped thread pid {}", pid);
                return Ok(Joined {
                    pid,
                    stack: frame.stack,
                    retval: frame.retval,
                });
            }
            if table.slots[me].killed {
                return Err(ProcError::Killed);
            }
            table = self.sleep_locked(Channel::Pid(pid), table);
        }
    }

    /// Finish the calling thread with `retval`. Returns immediately,
    /// doing nothing, when the caller is not a thread.
    pub fn texit(&self, retval: usize) {
        let Ok((me, data)) = self.myproc() else {
            return;
        };
        let Some(frame) = data.thread.as_mut() else {
            log::warn!("[PROC] texit from non-thread slot {}", me);
            return;
        };
        frame.retval = retval;
        self.release_files(data);

        let mut table = self.lock_table();
        if let Some(pid) = table.slots[me].pid {
            Self::wakeup_locked(&mut table, Channel::Pid(pid));
        }
        // the creator may be collecting it with `wait` instead of `join`
        if let Some(parent) = table.slots[me].parent {
            Self::wakeup_locked(&mut table, Channel::Proc(parent));
        }
        Self::reparent(&mut table, me);
        table.slots[me].state = ProcState::Zombie;
        log::debug!("[PROC] texit: slot {} value {}", me, retval);
        let _table = self.sched(table);
        panic!("zombie texit");
    }
}
