//! Process lifecycle: creation, termination, reaping and kill requests.

use crate::config::{NPROC, PAGE_SIZE};
use crate::error::{ProcError, Result};
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, FileSystem, Machine};
use crate::process::context::TrapFrame;
use crate::process::table::{EntityKind, ProcData, ProcName, ProcState, TableState};
use crate::process::vm::VmRef;
use crate::process::Pid;
use crate::sync::Channel;

impl<M: Machine> Kernel<M> {
    /// Create the init process from `image`, mapped at address 0.
    pub fn userinit(&self, image: &[u8]) -> Result<Pid> {
        let space = self.machine.create_empty().ok_or(ProcError::OutOfMemory)?;
        self.machine.load_initial_image(space, image);
        let cwd = self.machine.namei("/");

        let mut table = self.lock_table();
        let (slot, pid) = match self.allocate(&mut table) {
            Ok(entry) => entry,
            Err(e) => {
                drop(table);
                self.machine.destroy(space);
                if let Some(ip) = cwd {
                    self.machine.begin_op();
                    self.machine.inode_put(ip);
                    self.machine.end_op();
                }
                return Err(e);
            }
        };
        // SAFETY: fresh embryo, lock held.
        let data = unsafe { self.table.data(slot) };
        data.vm = Some(VmRef::Owned(space));
        data.size = PAGE_SIZE;
        *data.kstack_mut().trap_frame_mut() = TrapFrame::initial_user();
        data.cwd = cwd;
        table.slots[slot].name = ProcName::new("initcode");
        table.init = Some(slot);
        table.slots[slot].state = ProcState::Runnable;
        log::debug!("[PROC] userinit: pid {} in slot {}", pid, slot);
        Ok(pid)
    }

    /// Create a child process with a private copy of the caller's memory.
    /// The child resumes from the same trap frame with a zero return value.
    pub fn fork(&self) -> Result<Pid> {
        let (me, parent) = self.myproc()?;
        let space = parent.space()?;
        let (child, pid) = self.allocate_child(me, EntityKind::Process)?;
        // SAFETY: `allocate_child` handed us the embryo.
        let data = unsafe { self.table.data(child) };

        let Some(copy) = self.machine.duplicate(space, parent.size) else {
            self.abandon(child);
            return Err(ProcError::OutOfMemory);
        };
        data.vm = Some(VmRef::Owned(copy));
        data.size = parent.size;
        self.inherit(parent, data);
        data.kstack_mut().trap_frame_mut().rax = 0;

        self.publish(child);
        log::debug!("[PROC] fork: child pid {} in slot {}", pid, child);
        Ok(pid)
    }

    /// Terminate the caller. It stays a zombie until its parent reaps it.
    pub fn exit(&self) -> ! {
        let Some(me) = self.current_slot() else {
            panic!("exit: no process");
        };
        if self.lock_table().init == Some(me) {
            panic!("init exiting");
        }
        // SAFETY: a running entity owns its private data.
        self.release_files(unsafe { self.table.data(me) });

        let mut table = self.lock_table();
        if let Some(parent) = table.slots[me].parent {
            Self::wakeup_locked(&mut table, Channel::Proc(parent));
        }
        if table.slots[me].kind == EntityKind::Thread {
            if let Some(pid) = table.slots[me].pid {
                Self::wakeup_locked(&mut table, Channel::Pid(pid));
            }
        }
        Self::reparent(&mut table, me);
        table.slots[me].state = ProcState::Zombie;
        log::debug!("[PROC] exit: slot {}", me);
        let _table = self.sched(table);
        panic!("zombie exit");
    }

    /// Wait for a child to exit and return its pid.
    pub fn wait(&self) -> Result<Pid> {
        let me = self.current_slot().ok_or(ProcError::NoCurrentProcess)?;
        let mut table = self.lock_table();
        loop {
            let mut have_kids = false;
            for child in 0..NPROC {
                if table.slots[child].parent != Some(me) {
                    continue;
                }
                have_kids = true;
                if table.slots[child].state == ProcState::Zombie {
                    let pid = table.slots[child].pid.ok_or(ProcError::NoSuchProcess)?;
                    self.free_slot(&mut table, child);
                    log::debug!("[PROC] wait: reaped pid {}", pid);
                    return Ok(pid);
                }
            }
            if !have_kids {
                return Err(ProcError::NoChildren);
            }
            if table.slots[me].killed {
                return Err(ProcError::Killed);
            }
            table = self.sleep_locked(Channel::Proc(me), table);
        }
    }

    /// Ask `pid` to terminate. A sleeping target is made runnable so it
    /// reaches its next kill check.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        let mut table = self.lock_table();
        let slot = table.find(pid).ok_or(ProcError::NoSuchProcess)?;
        let entry = &mut table.slots[slot];
        entry.killed = true;
        if entry.state == ProcState::Sleeping {
            entry.state = ProcState::Runnable;
            entry.channel = None;
        }
        log::debug!("[PROC] kill: pid {}", pid);
        Ok(())
    }

    /// Safe-point check on the way back to user mode.
    pub fn exit_if_killed(&self) {
        let Some(me) = self.current_slot() else {
            return;
        };
        let killed = self.lock_table().slots[me].killed;
        if killed {
            self.exit();
        }
    }

    /// Put `file` in the caller's lowest free descriptor slot.
    pub fn fd_install(&self, file: M::File) -> Result<usize> {
        let (_, data) = self.myproc()?;
        match data.files.iter().position(Option::is_none) {
            Some(fd) => {
                data.files[fd] = Some(file);
                Ok(fd)
            }
            None => {
                self.machine.file_close(file);
                Err(ProcError::NoFileSlot)
            }
        }
    }

    /// Close every open file and drop the working directory.
    pub(crate) fn release_files(&self, data: &mut ProcData<M>) {
        for file in data.files.iter_mut() {
            if let Some(file) = file.take() {
                self.machine.file_close(file);
            }
        }
        if let Some(cwd) = data.cwd.take() {
            self.machine.begin_op();
            self.machine.inode_put(cwd);
            self.machine.end_op();
        }
    }

    /// Hand `slot`'s children to init, waking init if one of them is
    /// already a zombie.
    pub(crate) fn reparent(table: &mut TableState, slot: usize) {
        let Some(init) = table.init else {
            return;
        };
        let mut zombie = false;
        for entry in table.slots.iter_mut() {
            if entry.parent == Some(slot) {
                entry.parent = Some(init);
                zombie |= entry.state == ProcState::Zombie;
            }
        }
        if zombie {
            Self::wakeup_locked(table, Channel::Proc(init));
        }
    }
}
