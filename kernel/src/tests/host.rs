//! Host Machine
//!
//! Runs the process core on `std`. Every kernel context is a host thread
//! parked on a baton; `switch` hands the baton, and with it the logical
//! CPU id, to the context being resumed, so exactly one thread runs per
//! logical CPU. User programs are closures looked up by the resume
//! address in the trap frame.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::string::ToString;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;
use std::vec;
use std::vec::Vec;

use crate::config::{page_round_down, page_round_up, KERNBASE, NCPU, PAGE_SIZE};
use crate::error::VmError;
use crate::machine::{AddressSpaces, Arch, FaultKind, FileSystem, Page, Prot};
use crate::{Channel, Kernel, Pid, ProcInfo, ProcState};

std::thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

pub type HostKernel = Kernel<HostMachine>;
pub type Program = Arc<dyn Fn(&HostKernel) + Send + Sync>;
type Entry = Arc<dyn Fn() + Send + Sync>;

/// Image handed to `userinit`.
pub const INIT_IMAGE: &[u8] = b"\x90\x90initcode";

/// Scheduler passes before a scenario is declared stuck.
pub const MAX_PASSES: usize = 50_000;

// ========================================
// Contexts
// ========================================

struct Baton {
    next: Mutex<Option<usize>>,
    ready: Condvar,
    /// Set for scheduler contexts so a crashed entity fails the test
    /// instead of hanging it.
    poison: Option<Arc<AtomicBool>>,
}

impl Baton {
    fn new(poison: Option<Arc<AtomicBool>>) -> Arc<Self> {
        Arc::new(Baton {
            next: Mutex::new(None),
            ready: Condvar::new(),
            poison,
        })
    }

    fn pass(&self, cpu: usize) {
        *self.next.lock().unwrap() = Some(cpu);
        self.ready.notify_one();
    }

    fn wait(&self) -> usize {
        let mut next = self.next.lock().unwrap();
        loop {
            if let Some(cpu) = next.take() {
                return cpu;
            }
            match &self.poison {
                Some(poison) => {
                    if poison.load(Ordering::SeqCst) {
                        panic!("a kernel context panicked");
                    }
                    next = self
                        .ready
                        .wait_timeout(next, Duration::from_millis(10))
                        .unwrap()
                        .0;
                }
                None => next = self.ready.wait(next).unwrap(),
            }
        }
    }
}

pub struct HostContext {
    baton: Arc<Baton>,
}

// ========================================
// Address spaces
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpaceId(pub u32);

type Frame = Arc<Mutex<Vec<u8>>>;

struct Mapping {
    frame: Frame,
    prot: Prot,
    cow: bool,
}

impl Mapping {
    fn zeroed() -> Self {
        Mapping {
            frame: Arc::new(Mutex::new(vec![0; PAGE_SIZE])),
            prot: Prot::READ | Prot::WRITE,
            cow: false,
        }
    }

    fn privatize(&mut self) {
        let copy = self.frame.lock().unwrap().clone();
        self.frame = Arc::new(Mutex::new(copy));
        self.cow = false;
    }
}

type PageMap = BTreeMap<usize, Mapping>;

/// Page tables as maps from page address to shared frames.
#[derive(Default)]
pub struct FakeVm {
    spaces: Mutex<BTreeMap<SpaceId, PageMap>>,
    next: AtomicU32,
    pub destroyed: Mutex<Vec<SpaceId>>,
    /// Fail the next `duplicate` or `duplicate_cow`.
    pub fail_duplicate: AtomicBool,
}

impl FakeVm {
    fn create(&self) -> SpaceId {
        let id = SpaceId(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.spaces.lock().unwrap().insert(id, PageMap::new());
        id
    }

    fn with_space<R>(&self, space: SpaceId, f: impl FnOnce(&mut PageMap) -> R) -> Option<R> {
        self.spaces.lock().unwrap().get_mut(&space).map(f)
    }

    fn map_range(pages: &mut PageMap, from: usize, to: usize) {
        let mut va = page_round_up(from);
        while va < to {
            pages.insert(va, Mapping::zeroed());
            va += PAGE_SIZE;
        }
    }

    /// Map one zeroed page at `va`, outside any size bookkeeping.
    pub fn map_page(&self, space: SpaceId, va: usize) {
        self.with_space(space, |pages| {
            pages.insert(page_round_down(va), Mapping::zeroed());
        });
    }

    pub fn is_live(&self, space: SpaceId) -> bool {
        self.spaces.lock().unwrap().contains_key(&space)
    }

    pub fn was_destroyed(&self, space: SpaceId) -> bool {
        self.destroyed.lock().unwrap().contains(&space)
    }

    /// Kernel-side read, ignoring protection.
    pub fn read(&self, space: SpaceId, addr: usize, len: usize) -> Option<Vec<u8>> {
        self.with_space(space, |pages| {
            (addr..addr + len)
                .map(|va| {
                    let mapping = pages.get(&page_round_down(va))?;
                    let byte = mapping.frame.lock().unwrap()[va - page_round_down(va)];
                    Some(byte)
                })
                .collect::<Option<Vec<u8>>>()
        })?
    }

    /// A user-mode store: faults, returning the faulting address, on a
    /// missing, read-only or copy-on-write page.
    pub fn user_store(&self, space: SpaceId, addr: usize, bytes: &[u8]) -> Result<(), usize> {
        self.with_space(space, |pages| {
            for (i, byte) in bytes.iter().enumerate() {
                let va = addr + i;
                match pages.get(&page_round_down(va)) {
                    Some(m) if m.prot.contains(Prot::WRITE) && !m.cow => {
                        m.frame.lock().unwrap()[va - page_round_down(va)] = *byte;
                    }
                    _ => return Err(va),
                }
            }
            Ok(())
        })
        .unwrap_or(Err(addr))
    }
}

// ========================================
// File layer
// ========================================

pub const ROOT_INODE: u32 = 1;

#[derive(Debug, PartialEq, Eq)]
pub struct FileHandle(pub u32);

#[derive(Debug, PartialEq, Eq)]
pub struct InodeHandle(pub u32);

/// Reference counts only; no storage.
#[derive(Default)]
pub struct FakeFs {
    files: Mutex<BTreeMap<u32, usize>>,
    inodes: Mutex<BTreeMap<u32, usize>>,
    next_file: AtomicU32,
    pub init_calls: AtomicUsize,
    pub transactions: AtomicUsize,
}

impl FakeFs {
    pub fn open(&self) -> FileHandle {
        let id = self.next_file.fetch_add(1, Ordering::SeqCst) + 1;
        self.files.lock().unwrap().insert(id, 1);
        FileHandle(id)
    }

    pub fn file_refs(&self, id: u32) -> usize {
        self.files.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn inode_refs(&self, id: u32) -> usize {
        self.inodes.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    fn bump(map: &Mutex<BTreeMap<u32, usize>>, id: u32) {
        *map.lock().unwrap().entry(id).or_insert(0) += 1;
    }

    fn drop_ref(map: &Mutex<BTreeMap<u32, usize>>, id: u32) {
        let mut map = map.lock().unwrap();
        let refs = map.get_mut(&id).expect("release of unknown handle");
        assert!(*refs > 0, "handle {} released twice", id);
        *refs -= 1;
    }
}

// ========================================
// Machine
// ========================================

pub struct HostMachine {
    entry: OnceLock<Entry>,
    poison: Arc<AtomicBool>,
    intr: [AtomicBool; NCPU],
    fault: [AtomicUsize; NCPU],
    programs: Mutex<BTreeMap<u64, Program>>,
    pub vm: FakeVm,
    pub fs: FakeFs,
    pub pages_live: AtomicUsize,
    /// Fail the next `alloc_page`.
    pub fail_alloc: AtomicBool,
}

impl HostMachine {
    pub fn new() -> Self {
        HostMachine {
            entry: OnceLock::new(),
            poison: Arc::new(AtomicBool::new(false)),
            intr: core::array::from_fn(|_| AtomicBool::new(false)),
            fault: core::array::from_fn(|_| AtomicUsize::new(0)),
            programs: Mutex::new(BTreeMap::new()),
            vm: FakeVm::default(),
            fs: FakeFs::default(),
            pages_live: AtomicUsize::new(0),
            fail_alloc: AtomicBool::new(false),
        }
    }

    /// Run `program` in any entity whose trap frame resumes at `rip`.
    pub fn register(&self, rip: u64, program: impl Fn(&HostKernel) + Send + Sync + 'static) {
        self.programs.lock().unwrap().insert(rip, Arc::new(program));
    }

    fn program(&self, rip: u64) -> Option<Program> {
        self.programs.lock().unwrap().get(&rip).cloned()
    }

    pub fn set_fault_address(&self, addr: usize) {
        self.fault[self.cpu_id()].store(addr, Ordering::SeqCst);
    }
}

impl Arch for HostMachine {
    type Context = HostContext;

    fn cpu_id(&self) -> usize {
        CPU.with(Cell::get)
    }

    fn intr_enable(&self) {
        self.intr[self.cpu_id()].store(true, Ordering::SeqCst);
    }

    fn intr_disable(&self) {
        self.intr[self.cpu_id()].store(false, Ordering::SeqCst);
    }

    fn intr_enabled(&self) -> bool {
        self.intr[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn fault_address(&self) -> usize {
        self.fault[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn scheduler_context(&self) -> HostContext {
        HostContext {
            baton: Baton::new(Some(self.poison.clone())),
        }
    }

    fn first_run_context(&self, _stack_top: usize) -> HostContext {
        let baton = Baton::new(None);
        let resume = baton.clone();
        let entry = self.entry.get().cloned();
        let poison = self.poison.clone();
        std::thread::Builder::new()
            .name("kernel-context".to_string())
            .spawn(move || {
                let cpu = resume.wait();
                CPU.with(|c| c.set(cpu));
                if let Some(entry) = entry {
                    if catch_unwind(AssertUnwindSafe(|| (*entry)())).is_err() {
                        poison.store(true, Ordering::SeqCst);
                    }
                }
            })
            .expect("spawn kernel context");
        HostContext { baton }
    }

    unsafe fn switch(&self, save: *mut HostContext, load: *const HostContext) {
        let cpu = self.cpu_id();
        // SAFETY: the caller keeps both contexts alive across the switch.
        let (me, next) = unsafe { ((*save).baton.clone(), (*load).baton.clone()) };
        next.pass(cpu);
        let cpu = me.wait();
        CPU.with(|c| c.set(cpu));
    }
}

impl AddressSpaces for HostMachine {
    type Space = SpaceId;

    fn create_empty(&self) -> Option<SpaceId> {
        Some(self.vm.create())
    }

    fn load_initial_image(&self, space: SpaceId, image: &[u8]) {
        self.vm.with_space(space, |pages| {
            FakeVm::map_range(pages, 0, PAGE_SIZE);
            if let Some(page) = pages.get(&0) {
                page.frame.lock().unwrap()[..image.len()].copy_from_slice(image);
            }
        });
    }

    fn grow(&self, space: SpaceId, old: usize, new: usize) -> Option<usize> {
        if new > KERNBASE {
            return None;
        }
        self.vm
            .with_space(space, |pages| FakeVm::map_range(pages, old, new))?;
        Some(new)
    }

    fn shrink(&self, space: SpaceId, old: usize, new: usize) -> Option<usize> {
        self.vm.with_space(space, |pages| {
            pages.retain(|&va, _| va < page_round_up(new) || va >= page_round_up(old));
        })?;
        Some(new)
    }

    fn duplicate(&self, space: SpaceId, size: usize) -> Option<SpaceId> {
        if self.vm.fail_duplicate.swap(false, Ordering::SeqCst) {
            return None;
        }
        let copy = self.vm.with_space(space, |pages| {
            pages
                .range(..size)
                .map(|(&va, m)| {
                    let data = m.frame.lock().unwrap().clone();
                    let mapping = Mapping {
                        frame: Arc::new(Mutex::new(data)),
                        prot: m.prot,
                        cow: false,
                    };
                    (va, mapping)
                })
                .collect::<PageMap>()
        })?;
        let child = self.vm.create();
        self.vm.with_space(child, |pages| *pages = copy);
        Some(child)
    }

    fn duplicate_cow(&self, space: SpaceId, size: usize) -> Option<SpaceId> {
        if self.vm.fail_duplicate.swap(false, Ordering::SeqCst) {
            return None;
        }
        let shared = self.vm.with_space(space, |pages| {
            pages
                .range_mut(..size)
                .map(|(&va, m)| {
                    m.cow = true;
                    let mapping = Mapping {
                        frame: m.frame.clone(),
                        prot: m.prot,
                        cow: true,
                    };
                    (va, mapping)
                })
                .collect::<PageMap>()
        })?;
        let child = self.vm.create();
        self.vm.with_space(child, |pages| *pages = shared);
        Some(child)
    }

    fn destroy(&self, space: SpaceId) {
        let removed = self.vm.spaces.lock().unwrap().remove(&space);
        assert!(removed.is_some(), "space {:?} destroyed twice", space);
        self.vm.destroyed.lock().unwrap().push(space);
    }

    fn activate(&self, _space: SpaceId) {}

    fn activate_kernel(&self) {}

    fn handle_write_fault(&self, space: SpaceId, addr: usize) -> Result<(), VmError> {
        self.vm
            .with_space(space, |pages| match pages.get_mut(&page_round_down(addr)) {
                None => Err(VmError::BadAddress),
                Some(m) if !m.cow => Err(VmError::NotCopyOnWrite),
                Some(m) => {
                    m.privatize();
                    Ok(())
                }
            })
            .unwrap_or(Err(VmError::BadAddress))
    }

    fn set_protection(
        &self,
        space: SpaceId,
        addr: usize,
        len: usize,
        prot: Prot,
    ) -> Result<(), VmError> {
        self.vm
            .with_space(space, |pages| {
                for va in (page_round_down(addr)..addr.saturating_add(len)).step_by(PAGE_SIZE) {
                    pages.get_mut(&va).ok_or(VmError::BadAddress)?.prot = prot;
                }
                Ok(())
            })
            .unwrap_or(Err(VmError::BadAddress))
    }

    fn get_fault_kind(&self, space: SpaceId, addr: usize) -> FaultKind {
        self.vm
            .with_space(space, |pages| {
                pages
                    .get(&page_round_down(addr))
                    .map(|m| FaultKind::Protection(m.prot))
            })
            .flatten()
            .unwrap_or(FaultKind::NotMapped)
    }

    fn copy_out(&self, space: SpaceId, addr: usize, bytes: &[u8]) -> Result<(), VmError> {
        self.vm
            .with_space(space, |pages| {
                for (i, byte) in bytes.iter().enumerate() {
                    let va = addr + i;
                    let m = pages
                        .get_mut(&page_round_down(va))
                        .ok_or(VmError::BadAddress)?;
                    if m.cow {
                        m.privatize();
                    }
                    m.frame.lock().unwrap()[va - page_round_down(va)] = *byte;
                }
                Ok(())
            })
            .unwrap_or(Err(VmError::BadAddress))
    }

    fn alloc_page(&self) -> Option<Page> {
        if self.fail_alloc.swap(false, Ordering::SeqCst) {
            return None;
        }
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).ok()?;
        // SAFETY: non-zero size layout.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        self.pages_live.fetch_add(1, Ordering::SeqCst);
        // SAFETY: fresh, exclusively owned, page-aligned allocation.
        Some(unsafe { Page::from_raw(ptr) })
    }

    fn free_page(&self, page: Page) {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("page layout");
        self.pages_live.fetch_sub(1, Ordering::SeqCst);
        // SAFETY: allocated by `alloc_page` with the same layout.
        unsafe { dealloc(page.into_raw().as_ptr(), layout) };
    }
}

impl FileSystem for HostMachine {
    type File = FileHandle;
    type Inode = InodeHandle;

    fn init(&self) {
        self.fs.init_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn file_dup(&self, file: &FileHandle) -> FileHandle {
        FakeFs::bump(&self.fs.files, file.0);
        FileHandle(file.0)
    }

    fn file_close(&self, file: FileHandle) {
        FakeFs::drop_ref(&self.fs.files, file.0);
    }

    fn namei(&self, path: &str) -> Option<InodeHandle> {
        if path != "/" {
            return None;
        }
        FakeFs::bump(&self.fs.inodes, ROOT_INODE);
        Some(InodeHandle(ROOT_INODE))
    }

    fn inode_dup(&self, inode: &InodeHandle) -> InodeHandle {
        FakeFs::bump(&self.fs.inodes, inode.0);
        InodeHandle(inode.0)
    }

    fn inode_put(&self, inode: InodeHandle) {
        FakeFs::drop_ref(&self.fs.inodes, inode.0);
    }

    fn begin_op(&self) {
        self.fs.transactions.fetch_add(1, Ordering::SeqCst);
    }

    fn end_op(&self) {}
}

// ========================================
// Scenario helpers
// ========================================

/// Kernel whose new entities run registered programs.
pub fn new_kernel() -> Arc<HostKernel> {
    let kernel = Arc::new(Kernel::new(HostMachine::new()));
    let weak = Arc::downgrade(&kernel);
    let entry: Entry = Arc::new(move || {
        if let Some(kernel) = weak.upgrade() {
            run_entity(&kernel);
        }
    });
    let _ = kernel.machine().entry.set(entry);
    kernel
}

fn run_entity(k: &HostKernel) -> ! {
    k.forkret();
    let rip = k
        .current_trap_frame(|tf| tf.rip)
        .expect("entity without trap frame");
    match k.machine().program(rip) {
        Some(program) => (*program)(k),
        None => panic!("no program registered at {:#x}", rip),
    }
    k.texit(0);
    k.exit()
}

/// Kernel with an init process running `init`, then reaping forever.
pub fn boot(init: impl Fn(&HostKernel) + Send + Sync + 'static) -> Arc<HostKernel> {
    let kernel = new_kernel();
    kernel.machine().register(0, move |k: &HostKernel| {
        init(k);
        reap_forever(k);
    });
    kernel.userinit(INIT_IMAGE).expect("userinit");
    kernel
}

pub fn reap_forever(k: &HostKernel) -> ! {
    loop {
        if k.wait().is_err() {
            k.yield_now();
        }
    }
}

/// Act as `cpu`'s scheduler until `done` holds.
pub fn run_until(k: &HostKernel, cpu: usize, done: impl Fn() -> bool) {
    CPU.with(|c| c.set(cpu));
    for _ in 0..MAX_PASSES {
        if done() {
            return;
        }
        k.schedule_pass();
    }
    panic!("cpu{} never reached the expected state", cpu);
}

/// Set the caller's resume address, as a user program would by jumping.
pub fn set_rip(k: &HostKernel, rip: u64) {
    k.current_trap_frame(|tf| tf.rip = rip)
        .expect("no current process");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Done,
    /// A signal handler was entered instead.
    Signaled,
    Failed,
}

/// Store from user mode, taking page faults the way the trap layer does.
/// Does not return if the fault kills the caller.
pub fn user_store(k: &HostKernel, addr: usize, bytes: &[u8]) -> Store {
    for _ in 0..4 {
        let Some(space) = k.current_address_space() else {
            return Store::Failed;
        };
        let fault = match k.machine().vm.user_store(space, addr, bytes) {
            Ok(()) => return Store::Done,
            Err(fault) => fault,
        };
        k.machine().set_fault_address(fault);
        let rip = k.current_trap_frame(|tf| tf.rip).ok();
        let _ = k.page_fault(true);
        k.exit_if_killed();
        if k.current_trap_frame(|tf| tf.rip).ok() != rip {
            return Store::Signaled;
        }
    }
    Store::Failed
}

pub fn user_load(k: &HostKernel, addr: usize, len: usize) -> Option<Vec<u8>> {
    let space = k.current_address_space()?;
    k.machine().vm.read(space, addr, len)
}

pub fn info_of(k: &HostKernel, pid: Pid) -> Option<ProcInfo> {
    k.procdump().into_iter().find(|info| info.pid == Some(pid))
}

pub fn state_of(k: &HostKernel, pid: Pid) -> Option<ProcState> {
    info_of(k, pid).map(|info| info.state)
}

/// Sleep on `chan` until woken, under a private condition lock.
pub fn sleep_on(k: &HostKernel, chan: Channel) {
    let lock = spin::Mutex::new(());
    let guard = lock.lock();
    let _guard = k.sleep(chan, &lock, guard);
}
