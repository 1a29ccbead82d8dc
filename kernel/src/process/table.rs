//! Process Table
//!
//! Fixed array of process control blocks behind one lock.
//!
//! Each slot is split in two. The [`Slot`] half (state, pid, parent,
//! channel, killed flag, kind, name) is only read or written with the
//! table lock held, through a [`TableGuard`]. The [`ProcData`] half is
//! private to whoever owns the entity at that moment:
//!
//! - the creator, while the slot is `Embryo`;
//! - the entity itself, while it is `Running`;
//! - the scheduler holding the lock, to resume a `Runnable` entity;
//! - the reaper holding the lock, once the slot is `Zombie`.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::config::{NOFILE, NPROC, PROC_NAME_LEN};
use crate::error::{ProcError, Result, VmError};
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, Arch, FileSystem, Machine};
use crate::process::context::KernelStack;
use crate::process::signal::SignalTable;
use crate::process::vm::VmRef;
use crate::sync::{Channel, SpinLock};

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// Init process ID (always 1)
    pub const INIT: Pid = Pid(1);

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    /// Allocated, still being set up; never scheduled
    Embryo,
    Sleeping,
    Runnable,
    Running,
    /// Terminated, waiting to be reaped
    Zombie,
}

impl ProcState {
    /// Fixed-width label used by the process dump.
    pub fn label(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Full process or a thread created by `clone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Process,
    Thread,
}

/// Short diagnostic name, NUL padded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProcName([u8; PROC_NAME_LEN]);

impl ProcName {
    pub const EMPTY: ProcName = ProcName([0; PROC_NAME_LEN]);

    /// Truncates to `PROC_NAME_LEN - 1` bytes, on a char boundary.
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(PROC_NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0; PROC_NAME_LEN];
        buf[..end].copy_from_slice(&name.as_bytes()[..end]);
        ProcName(buf)
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_LEN);
        core::str::from_utf8(&self.0[..len]).unwrap_or("?")
    }
}

impl fmt::Debug for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-protected half of a process control block.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub state: ProcState,
    /// `None` once the slot is reclaimed.
    pub pid: Option<Pid>,
    /// Table index of the creator; re-pointed to init on orphaning.
    pub parent: Option<usize>,
    /// Meaningful only while `Sleeping`.
    pub channel: Option<Channel>,
    pub killed: bool,
    pub kind: EntityKind,
    pub name: ProcName,
}

impl Slot {
    pub const UNUSED: Slot = Slot {
        state: ProcState::Unused,
        pid: None,
        parent: None,
        channel: None,
        killed: false,
        kind: EntityKind::Process,
        name: ProcName::EMPTY,
    };
}

/// Everything the table lock protects.
pub struct TableState {
    pub slots: [Slot; NPROC],
    next_pid: u32,
    /// Slot of the init process, once created.
    pub init: Option<usize>,
}

impl TableState {
    const fn new() -> Self {
        TableState {
            slots: [Slot::UNUSED; NPROC],
            next_pid: Pid::INIT.0,
            init: None,
        }
    }

    /// Index of the live entry carrying `pid`.
    pub fn find(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state != ProcState::Unused && s.pid == Some(pid))
    }
}

/// Thread bookkeeping collected by `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFrame {
    /// User stack handed to `clone`; not owned.
    pub stack: usize,
    /// Value passed to `texit`.
    pub retval: usize,
}

/// Private half of a process control block.
pub struct ProcData<M: Machine> {
    pub(crate) kstack: Option<KernelStack>,
    pub(crate) context: Option<M::Context>,
    pub(crate) vm: Option<VmRef<M::Space>>,
    /// Size of user memory in bytes.
    pub(crate) size: usize,
    pub(crate) files: [Option<M::File>; NOFILE],
    pub(crate) cwd: Option<M::Inode>,
    pub(crate) signals: SignalTable,
    pub(crate) is_cow: bool,
    pub(crate) thread: Option<ThreadFrame>,
}

impl<M: Machine> ProcData<M> {
    fn new() -> Self {
        ProcData {
            kstack: None,
            context: None,
            vm: None,
            size: 0,
            files: core::array::from_fn(|_| None),
            cwd: None,
            signals: SignalTable::new(),
            is_cow: false,
            thread: None,
        }
    }

    pub(crate) fn space(&self) -> Result<M::Space> {
        self.vm
            .map(|vm| vm.space())
            .ok_or(ProcError::Vm(VmError::BadAddress))
    }

    pub(crate) fn kstack_mut(&mut self) -> &mut KernelStack {
        match self.kstack.as_mut() {
            Some(stack) => stack,
            None => panic!("live process without kernel stack"),
        }
    }
}

pub(crate) struct ProcTable<M: Machine> {
    pub(crate) lock: SpinLock<TableState>,
    data: [UnsafeCell<ProcData<M>>; NPROC],
}

// SAFETY: `Slot`s are reached only under the lock; `ProcData` follows
// the ownership rules in the module docs.
unsafe impl<M: Machine> Sync for ProcTable<M> {}

impl<M: Machine> ProcTable<M> {
    pub(crate) fn new() -> Self {
        ProcTable {
            lock: SpinLock::new("table lock", TableState::new()),
            data: core::array::from_fn(|_| UnsafeCell::new(ProcData::new())),
        }
    }

    /// # Safety
    ///
    /// The caller must currently own `slot`'s private data as described
    /// in the module docs, and must not let two borrows of the same slot
    /// overlap.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data(&self, slot: usize) -> &mut ProcData<M> {
        // SAFETY: exclusivity is the caller's obligation.
        unsafe { &mut *self.data[slot].get() }
    }
}

/// Proof that the table lock is held on this CPU with interrupts off.
///
/// Dropping it releases the lock and undoes one `push_off`. A guard can
/// be handed through `sched` to another context, which then releases it.
pub struct TableGuard<'a, M: Machine> {
    kernel: &'a Kernel<M>,
}

impl<'a, M: Machine> TableGuard<'a, M> {
    /// Wrap a lock acquired by a context that switched to us.
    ///
    /// # Safety
    ///
    /// The table lock must be held on this CPU with one matching
    /// `push_off`, and nobody else may release it.
    pub(crate) unsafe fn adopt(kernel: &'a Kernel<M>) -> Self {
        TableGuard { kernel }
    }
}

impl<M: Machine> Deref for TableGuard<'_, M> {
    type Target = TableState;

    fn deref(&self) -> &TableState {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.kernel.table.lock.data_ptr() }
    }
}

impl<M: Machine> DerefMut for TableGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut TableState {
        // SAFETY: as above.
        unsafe { &mut *self.kernel.table.lock.data_ptr() }
    }
}

impl<M: Machine> Drop for TableGuard<'_, M> {
    fn drop(&mut self) {
        let kernel = self.kernel;
        kernel.table.lock.release(kernel.machine.cpu_id());
        kernel.pop_off();
    }
}

impl<M: Machine> Kernel<M> {
    pub(crate) fn lock_table(&self) -> TableGuard<'_, M> {
        self.push_off();
        self.table.lock.acquire(self.machine.cpu_id());
        TableGuard { kernel: self }
    }

    /// Caller's slot and private data.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn myproc(&self) -> Result<(usize, &mut ProcData<M>)> {
        let slot = self.current_slot().ok_or(ProcError::NoCurrentProcess)?;
        // SAFETY: a running entity owns its private data.
        Ok((slot, unsafe { self.table.data(slot) }))
    }

    /// Claim an `Unused` slot: assign the next pid, give it a kernel stack
    /// with a zeroed trap frame and a first-run context, and reset its
    /// signal, thread and COW state. The slot is left `Embryo`, owned by
    /// the caller.
    pub(crate) fn allocate(&self, table: &mut TableState) -> Result<(usize, Pid)> {
        let slot = table
            .slots
            .iter()
            .position(|s| s.state == ProcState::Unused)
            .ok_or(ProcError::TableFull)?;
        let pid = Pid(table.next_pid);
        table.next_pid += 1;
        table.slots[slot] = Slot {
            state: ProcState::Embryo,
            pid: Some(pid),
            ..Slot::UNUSED
        };

        let Some(page) = self.machine.alloc_page() else {
            table.slots[slot] = Slot::UNUSED;
            return Err(ProcError::OutOfMemory);
        };
        // SAFETY: the slot was `Unused` a moment ago and we hold the lock.
        let data = unsafe { self.table.data(slot) };
        let stack = KernelStack::new(page);
        data.context = Some(self.machine.first_run_context(stack.context_top()));
        data.kstack = Some(stack);
        data.vm = None;
        data.size = 0;
        data.signals = SignalTable::new();
        data.is_cow = false;
        data.thread = None;
        Ok((slot, pid))
    }

    /// Allocate a child of `parent`, inheriting its name.
    pub(crate) fn allocate_child(&self, parent: usize, kind: EntityKind) -> Result<(usize, Pid)> {
        let mut table = self.lock_table();
        let (child, pid) = self.allocate(&mut table)?;
        let name = table.slots[parent].name;
        let slot = &mut table.slots[child];
        slot.parent = Some(parent);
        slot.kind = kind;
        slot.name = name;
        Ok((child, pid))
    }

    /// Make a fully built `Embryo` schedulable.
    pub(crate) fn publish(&self, slot: usize) {
        let mut table = self.lock_table();
        table.slots[slot].state = ProcState::Runnable;
    }

    /// Roll back an `Embryo` whose construction failed.
    pub(crate) fn abandon(&self, slot: usize) {
        let mut table = self.lock_table();
        self.free_slot(&mut table, slot);
    }

    /// Release a slot's kernel stack and owned address space and return
    /// it to `Unused`. File handles must already be gone.
    pub(crate) fn free_slot(&self, table: &mut TableState, slot: usize) {
        // SAFETY: the slot is an `Embryo` owned by the caller or a
        // `Zombie` being reaped under the lock.
        let data = unsafe { self.table.data(slot) };
        if let Some(stack) = data.kstack.take() {
            self.machine.free_page(stack.into_page());
        }
        data.context = None;
        if let Some(VmRef::Owned(space)) = data.vm.take() {
            self.machine.destroy(space);
        }
        data.size = 0;
        data.is_cow = false;
        data.thread = None;
        table.slots[slot] = Slot::UNUSED;
    }

    /// Copy the parent's user registers, open files, working directory
    /// and signal dispositions into a child under construction.
    pub(crate) fn inherit(&self, parent: &mut ProcData<M>, child: &mut ProcData<M>) {
        *child.kstack_mut().trap_frame_mut() = *parent.kstack_mut().trap_frame();
        for (dst, src) in child.files.iter_mut().zip(parent.files.iter()) {
            *dst = src.as_ref().map(|f| self.machine.file_dup(f));
        }
        child.cwd = parent.cwd.as_ref().map(|ip| self.machine.inode_dup(ip));
        child.signals = parent.signals.clone();
    }
}
