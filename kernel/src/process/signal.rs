//! Signal Handling
//!
//! Synchronous delivery only: no pending set, no masks. A signal raised
//! against the calling process is acted on immediately, either by
//! marking it killed or by redirecting its user resume address to a
//! registered handler with a resume record pushed on the user stack.

use core::mem::size_of;

use crate::config::NSIG;
use crate::error::{ProcError, Result};
use crate::kernel::Kernel;
use crate::machine::{AddressSpaces, Arch, FaultKind, Machine};

// ─── Signal numbers (Linux x86_64) ──────────────────────────────────

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQUIT: u8 = 3;
pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGABRT: u8 = 6;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGKILL: u8 = 9;
pub const SIGUSR1: u8 = 10;
pub const SIGSEGV: u8 = 11;
pub const SIGUSR2: u8 = 12;
pub const SIGPIPE: u8 = 13;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGSTOP: u8 = 19;
pub const SIGTSTP: u8 = 20;

/// Restorer address pushed when the process never registered one.
/// Returning to it faults.
pub const NO_RESTORER: usize = usize::MAX;

// ─── Signal action disposition ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigAction {
    /// Terminate or ignore, per [`default_action_is_terminate`].
    Default,
    Ignore,
    /// User handler entry point.
    Handler(usize),
}

/// Per-process disposition table.
#[derive(Debug, Clone)]
pub struct SignalTable {
    handlers: [SigAction; NSIG],
    restorer: Option<usize>,
}

impl SignalTable {
    pub fn new() -> Self {
        SignalTable {
            handlers: [SigAction::Default; NSIG],
            restorer: None,
        }
    }

    pub fn action(&self, signum: u8) -> Result<SigAction> {
        self.handlers
            .get(signum as usize)
            .copied()
            .filter(|_| signum != 0)
            .ok_or(ProcError::InvalidSignal)
    }

    /// Install `action`, returning the old one. `SIGKILL` and `SIGSTOP`
    /// only accept `Default`.
    pub fn set_action(&mut self, signum: u8, action: SigAction) -> Result<SigAction> {
        if signum == 0 || signum as usize >= NSIG {
            return Err(ProcError::InvalidSignal);
        }
        if !is_catchable(signum) && action != SigAction::Default {
            return Err(ProcError::InvalidSignal);
        }
        let old = self.handlers[signum as usize];
        self.handlers[signum as usize] = action;
        Ok(old)
    }

    pub fn restorer(&self) -> Option<usize> {
        self.restorer
    }

    pub fn set_restorer(&mut self, addr: usize) {
        self.restorer = Some(addr);
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Determine the default action for a signal.
///
/// Returns `true` if the default action is to terminate the process.
pub fn default_action_is_terminate(signum: u8) -> bool {
    matches!(
        signum,
        SIGHUP | SIGINT | SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGKILL
            | SIGUSR1
            | SIGSEGV
            | SIGUSR2
            | SIGPIPE
            | SIGALRM
            | SIGTERM
    )
}

/// Check if a signal can be caught or ignored.
pub fn is_catchable(signum: u8) -> bool {
    signum != SIGKILL && signum != SIGSTOP
}

/// Fault details reported with `SIGSEGV`; zero for other signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigInfo {
    pub addr: usize,
    pub kind: usize,
}

/// Resume record pushed on the user stack before entering a handler,
/// lowest address first. The handler returns into `restorer`, which
/// pops the record and resumes at `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SignalFrame {
    pub restorer: u64,
    pub signum: u64,
    pub fault_addr: u64,
    pub fault_kind: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub resume: u64,
}

pub const SIGNAL_FRAME_SIZE: usize = size_of::<SignalFrame>();

impl SignalFrame {
    const WORDS: usize = SIGNAL_FRAME_SIZE / 8;

    fn words(&self) -> [u64; Self::WORDS] {
        [
            self.restorer,
            self.signum,
            self.fault_addr,
            self.fault_kind,
            self.rdx,
            self.rcx,
            self.rax,
            self.resume,
        ]
    }

    pub fn to_bytes(&self) -> [u8; SIGNAL_FRAME_SIZE] {
        let mut out = [0u8; SIGNAL_FRAME_SIZE];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.words()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; SIGNAL_FRAME_SIZE]) -> Self {
        let mut words = [0u64; Self::WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        let [restorer, signum, fault_addr, fault_kind, rdx, rcx, rax, resume] = words;
        SignalFrame {
            restorer,
            signum,
            fault_addr,
            fault_kind,
            rdx,
            rcx,
            rax,
            resume,
        }
    }
}

impl<M: Machine> Kernel<M> {
    /// Set the caller's disposition for `signum`, returning the old one.
    pub fn register_handler(&self, signum: u8, action: SigAction) -> Result<SigAction> {
        let (_, data) = self.myproc()?;
        data.signals.set_action(signum, action)
    }

    /// Record the user trampoline that unwinds a [`SignalFrame`].
    pub fn set_restorer(&self, addr: usize) -> Result<()> {
        let (_, data) = self.myproc()?;
        data.signals.set_restorer(addr);
        Ok(())
    }

    /// Act on `signum` for the caller right now.
    ///
    /// With a handler installed, pushes a [`SignalFrame`] on the user
    /// stack and points the user resume address at the handler. If the
    /// frame cannot be written the process is marked killed.
    pub fn deliver(&self, signum: u8) -> Result<()> {
        let (slot, data) = self.myproc()?;
        let space = data.space()?;
        let info = if signum == SIGSEGV {
            let addr = self.machine.fault_address();
            SigInfo {
                addr,
                kind: self.machine.get_fault_kind(space, addr).code(),
            }
        } else {
            SigInfo::default()
        };

        match data.signals.action(signum)? {
            SigAction::Ignore => {
                log::trace!("[SIG] signal {} ignored", signum);
                Ok(())
            }
            SigAction::Default => {
                if default_action_is_terminate(signum) {
                    log::debug!("[SIG] signal {} terminates slot {}", signum, slot);
                    self.lock_table().slots[slot].killed = true;
                }
                Ok(())
            }
            SigAction::Handler(handler) => {
                let restorer = data.signals.restorer().unwrap_or(NO_RESTORER);
                let tf = data.kstack_mut().trap_frame_mut();
                let frame = SignalFrame {
                    restorer: restorer as u64,
                    signum: signum as u64,
                    fault_addr: info.addr as u64,
                    fault_kind: info.kind as u64,
                    rdx: tf.rdx,
                    rcx: tf.rcx,
                    rax: tf.rax,
                    resume: tf.rip,
                };
                let pushed = (tf.rsp as usize)
                    .checked_sub(SIGNAL_FRAME_SIZE)
                    .ok_or(ProcError::Vm(crate::error::VmError::BadAddress))
                    .and_then(|sp| {
                        self.machine.copy_out(space, sp, &frame.to_bytes())?;
                        Ok(sp)
                    });
                match pushed {
                    Ok(sp) => {
                        tf.rsp = sp as u64;
                        tf.rip = handler as u64;
                        log::debug!("[SIG] signal {} -> handler {:#x}", signum, handler);
                        Ok(())
                    }
                    Err(e) => {
                        log::warn!("[SIG] cannot push frame for signal {}: {}", signum, e);
                        self.lock_table().slots[slot].killed = true;
                        Err(e)
                    }
                }
            }
        }
    }
}
