//! Sleep/wakeup on channels.
//!
//! A sleeper records its channel and leaves `Running` while holding the
//! table lock, and `wakeup` scans under that same lock. Any lock the
//! sleeper held to guard its condition is released only after the table
//! lock is taken, so a waker that takes the condition lock and then
//! calls `wakeup` either runs before the sleeper checked its condition
//! or finds it already `Sleeping`.

use spin::{Mutex, MutexGuard};

use crate::kernel::Kernel;
use crate::machine::Machine;
use crate::process::table::TableState;
use crate::process::{Pid, ProcState, TableGuard};

/// What a sleeping entity waits for. Compared by identity only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// A process-table slot: a parent waiting for its children.
    Proc(usize),
    /// A thread pid: `join` waiting for `texit`.
    Pid(Pid),
    /// Any other condition, keyed by address.
    Addr(usize),
}

impl<M: Machine> Kernel<M> {
    /// Atomically release `guard` and sleep on `chan`; re-acquire `lock`
    /// after waking.
    pub fn sleep<'a, T>(
        &self,
        chan: Channel,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        let table = self.lock_table();
        drop(guard);
        let table = self.sleep_locked(chan, table);
        drop(table);
        lock.lock()
    }

    /// Sleep on `chan` when the condition is guarded by the table lock
    /// itself. Returns with the lock held again.
    pub(crate) fn sleep_locked<'a>(
        &'a self,
        chan: Channel,
        mut table: TableGuard<'a, M>,
    ) -> TableGuard<'a, M> {
        let Some(me) = self.current_slot() else {
            panic!("sleep");
        };
        table.slots[me].channel = Some(chan);
        table.slots[me].state = ProcState::Sleeping;
        log::trace!("[SCHED] slot {} sleeps on {:?}", me, chan);

        let mut table = self.sched(table);
        table.slots[me].channel = None;
        table
    }

    /// Make every entity sleeping on `chan` runnable.
    pub fn wakeup(&self, chan: Channel) {
        let mut table = self.lock_table();
        Self::wakeup_locked(&mut table, chan);
    }

    pub(crate) fn wakeup_locked(table: &mut TableState, chan: Channel) {
        for entry in table.slots.iter_mut() {
            if entry.state == ProcState::Sleeping && entry.channel == Some(chan) {
                entry.state = ProcState::Runnable;
                entry.channel = None;
            }
        }
    }
}
