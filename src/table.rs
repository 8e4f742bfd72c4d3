//! Handle over the host's dispatch table.
//!
//! The table itself belongs to the host kernel. This module only borrows its
//! base address and exposes word-sized atomic slot access. Reads are public;
//! writes are reserved to the interceptor, which performs them inside a guard
//! bracket.

use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Size of one slot in bytes.
pub const SLOT_SIZE: usize = size_of::<usize>();

/// Argument block passed to every table handler.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub regs: [usize; 6],
}

impl SyscallArgs {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }
}

/// ABI of a dispatch table entry.
pub type SyscallHandler = unsafe extern "C" fn(args: *const SyscallArgs) -> isize;

/// A dispatch table located at a borrowed base address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DispatchTable {
    base: usize,
    nr_slots: usize,
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("base", &format_args!("{:#x}", self.base))
            .field("nr_slots", &self.nr_slots)
            .finish()
    }
}

impl DispatchTable {
    /// Wrap a table base address.
    ///
    /// # Safety
    /// `base` must be word-aligned and point to at least `nr_slots` readable
    /// words that stay mapped for as long as the handle is used.
    pub unsafe fn from_raw(base: usize, nr_slots: usize) -> Self {
        debug_assert!(base % SLOT_SIZE == 0);
        Self { base, nr_slots }
    }

    /// Base address of the table.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Number of slots covered by this handle.
    pub fn nr_slots(&self) -> usize {
        self.nr_slots
    }

    /// Address of slot `code`, if it lies within the table.
    pub fn slot_addr(&self, code: usize) -> Option<usize> {
        (code < self.nr_slots).then(|| self.base + code * SLOT_SIZE)
    }

    fn slot(&self, code: usize) -> Option<&AtomicUsize> {
        let addr = self.slot_addr(code)?;
        // SAFETY: `from_raw` guarantees the range is mapped and aligned.
        Some(unsafe { &*(addr as *const AtomicUsize) })
    }

    /// Current handler reference in slot `code`.
    pub fn read(&self, code: usize) -> Option<usize> {
        self.slot(code).map(|slot| slot.load(Ordering::SeqCst))
    }

    /// Store `value` into slot `code`. The caller must hold a guard bracket.
    pub(crate) fn write(&self, code: usize, value: usize) -> Option<()> {
        self.slot(code).map(|slot| slot.store(value, Ordering::SeqCst))
    }

    /// Invoke the handler currently installed in slot `code`, the way the
    /// host's dispatcher would.
    ///
    /// Returns `None` for an out-of-range code or an empty slot.
    ///
    /// # Safety
    /// The slot must hold a valid [`SyscallHandler`].
    pub unsafe fn dispatch(&self, code: usize, args: &SyscallArgs) -> Option<isize> {
        let handler = self.read(code).filter(|addr| *addr != 0)?;
        // SAFETY: the caller guarantees the slot holds a handler.
        let handler: SyscallHandler = unsafe { core::mem::transmute(handler) };
        Some(unsafe { handler(args) })
    }
}

/// Read one word at `addr` without creating a table handle.
///
/// # Safety
/// `addr` must be word-aligned and readable.
pub(crate) unsafe fn read_word(addr: usize) -> usize {
    unsafe { core::ptr::read_volatile(addr as *const usize) }
}
