//! Address-space and physical-page collaborators.

use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::error::VmError;

bitflags! {
    /// Page protection bits accepted by `set_protection` (mprotect).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

/// What the address-space manager knows about a faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No mapping covers the address.
    NotMapped,
    /// Mapped with the given protection, which the access violated.
    Protection(Prot),
}

impl FaultKind {
    /// Numeric code placed in the signal frame.
    pub fn code(self) -> usize {
        match self {
            FaultKind::NotMapped => 0,
            FaultKind::Protection(prot) => 0x100 | prot.bits() as usize,
        }
    }
}

/// One physical page owned by the holder. Returned to the allocator
/// through [`AddressSpaces::free_page`].
pub struct Page(NonNull<u8>);

// SAFETY: a `Page` is a unique owner of its frame.
unsafe impl Send for Page {}

impl Page {
    /// # Safety
    ///
    /// `ptr` must point to a writable, page-aligned frame of `PAGE_SIZE`
    /// bytes that nothing else references.
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Page(ptr)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    pub fn into_raw(self) -> NonNull<u8> {
        self.0
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page({:#x})", self.addr())
    }
}

/// Page-table construction, copy-on-write mechanics and the physical
/// page allocator.
///
/// `Space` is an identifier. Ownership is tracked by the process core:
/// only the owning process ever passes a space to `destroy`.
pub trait AddressSpaces {
    type Space: Copy + Eq + Send + fmt::Debug;

    fn create_empty(&self) -> Option<Self::Space>;
    /// Map `image` at user address 0 in a fresh space.
    fn load_initial_image(&self, space: Self::Space, image: &[u8]);
    /// Grow from `old` to `new` bytes, returning the new size.
    fn grow(&self, space: Self::Space, old: usize, new: usize) -> Option<usize>;
    /// Shrink from `old` to `new` bytes, returning the new size.
    fn shrink(&self, space: Self::Space, old: usize, new: usize) -> Option<usize>;
    /// Private copy of the first `size` bytes.
    fn duplicate(&self, space: Self::Space, size: usize) -> Option<Self::Space>;
    /// Sharing copy: both spaces map the same frames read-only and
    /// reference-counted.
    fn duplicate_cow(&self, space: Self::Space, size: usize) -> Option<Self::Space>;
    fn destroy(&self, space: Self::Space);

    /// Install `space` as the current user address space.
    fn activate(&self, space: Self::Space);
    /// Switch back to the kernel-only page table.
    fn activate_kernel(&self);

    /// Give the faulting page a private writable copy.
    fn handle_write_fault(&self, space: Self::Space, addr: usize) -> Result<(), VmError>;
    fn set_protection(
        &self,
        space: Self::Space,
        addr: usize,
        len: usize,
        prot: Prot,
    ) -> Result<(), VmError>;
    fn get_fault_kind(&self, space: Self::Space, addr: usize) -> FaultKind;
    /// Copy kernel bytes into user memory at `addr`.
    fn copy_out(&self, space: Self::Space, addr: usize, bytes: &[u8]) -> Result<(), VmError>;

    fn alloc_page(&self) -> Option<Page>;
    fn free_page(&self, page: Page);
}
