//! Slot patching: install and remove a replacement handler in one dispatch
//! table slot.
//!
//! Both mutations run inside exactly one guard bracket. The original handler
//! is recorded before the replacement is written, and uninstall always writes
//! that recorded original back, even when the slot no longer holds our
//! replacement.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axerrno::AxError;
use spin::RwLock;

use crate::filter::{CallObserver, CallerContext};
use crate::guard::{GuardController, ProtectionControl};
use crate::table::{DispatchTable, SyscallArgs, SyscallHandler};

/// Returned by the trampoline when it runs without an active target.
pub const ENOSYS: isize = 38;

/// Error types for slot patching.
#[derive(Debug)]
pub enum Error {
    /// No table has been resolved and bound yet.
    NotResolved,
    /// Operation code lies outside the table.
    SlotOutOfRange { code: usize, nr_slots: usize },
    /// The operation is already patched.
    AlreadyInstalled(usize),
    /// The operation is not patched.
    NotInstalled(usize),
    /// The slot holds no handler to forward to.
    EmptySlot(usize),
    /// Write protection could not be lifted or restored.
    Guard(AxError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotResolved => write!(f, "Dispatch table not resolved"),
            Self::SlotOutOfRange { code, nr_slots } => {
                write!(f, "Slot {} out of range (table has {} slots)", code, nr_slots)
            }
            Self::AlreadyInstalled(code) => write!(f, "Slot {} already intercepted", code),
            Self::NotInstalled(code) => write!(f, "Slot {} is not intercepted", code),
            Self::EmptySlot(code) => write!(f, "Slot {} holds no handler", code),
            Self::Guard(e) => write!(f, "Write protection control failed: {:?}", e),
        }
    }
}

impl core::error::Error for Error {}

/// Result of a successful uninstall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    /// The slot still held our replacement and now holds the original again.
    Restored,
    /// Someone else had re-patched the slot; the original was written back
    /// over their handler anyway.
    Interference {
        /// The foreign value found in the slot.
        found: usize,
    },
}

impl UninstallOutcome {
    pub fn is_interference(&self) -> bool {
        matches!(self, UninstallOutcome::Interference { .. })
    }
}

/// One intercepted operation.
pub struct TargetOperation {
    code: usize,
    replacement: usize,
    observer: Arc<CallObserver>,
    /// Recorded original handler, 0 while unset.
    original: AtomicUsize,
    installed: AtomicBool,
}

impl fmt::Debug for TargetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetOperation")
            .field("code", &self.code)
            .field("replacement", &format_args!("{:#x}", self.replacement))
            .field("original", &self.original())
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl TargetOperation {
    /// Target slot `code`, to be patched with `replacement`.
    pub fn new(code: usize, replacement: usize, observer: Arc<CallObserver>) -> Self {
        Self {
            code,
            replacement,
            observer,
            original: AtomicUsize::new(0),
            installed: AtomicBool::new(false),
        }
    }

    /// Target slot `code`, patched with this crate's [`replacement_handler`].
    pub fn with_trampoline(code: usize, observer: Arc<CallObserver>) -> Self {
        Self::new(code, replacement_handler as usize, observer)
    }

    pub fn code(&self) -> usize {
        self.code
    }

    pub fn replacement(&self) -> usize {
        self.replacement
    }

    pub fn observer(&self) -> &Arc<CallObserver> {
        &self.observer
    }

    /// The handler found in the slot at install time.
    pub fn original(&self) -> Option<usize> {
        match self.original.load(Ordering::SeqCst) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }
}

/// Patches slots of one resolved table.
pub struct Interceptor<P: ProtectionControl> {
    guard: GuardController<P>,
    table: Option<DispatchTable>,
}

impl<P: ProtectionControl> Interceptor<P> {
    pub fn new(protection: P) -> Self {
        Self {
            guard: GuardController::new(protection),
            table: None,
        }
    }

    /// Attach the table found by the resolver.
    pub fn bind(&mut self, table: DispatchTable) {
        self.table = Some(table);
    }

    /// Forget the table.
    pub fn unbind(&mut self) -> Option<DispatchTable> {
        self.table.take()
    }

    pub fn table(&self) -> Option<DispatchTable> {
        self.table
    }

    pub fn guard(&self) -> &GuardController<P> {
        &self.guard
    }

    /// Write `op`'s replacement into its slot and return the original handler.
    pub fn install(&self, op: &TargetOperation) -> Result<usize, Error> {
        let table = self.table.ok_or(Error::NotResolved)?;
        if op.is_installed() {
            return Err(Error::AlreadyInstalled(op.code));
        }
        let slot = table.slot_addr(op.code).ok_or(Error::SlotOutOfRange {
            code: op.code,
            nr_slots: table.nr_slots(),
        })?;

        let saved = self.guard.enter_writable(slot).map_err(Error::Guard)?;

        let original = table.read(op.code).unwrap_or(0);
        if original == 0 {
            let _ = self.guard.exit_writable(saved);
            return Err(Error::EmptySlot(op.code));
        }
        op.original.store(original, Ordering::SeqCst);
        table.write(op.code, op.replacement);
        op.installed.store(true, Ordering::SeqCst);

        if let Err(e) = self.guard.exit_writable(saved) {
            // Protection is still lifted; put the table back as we found it.
            table.write(op.code, original);
            op.installed.store(false, Ordering::SeqCst);
            op.original.store(0, Ordering::SeqCst);
            return Err(Error::Guard(e));
        }

        log::info!(
            "interceptor: slot {} of {:#x} patched ({:#x} -> {:#x})",
            op.code,
            table.base(),
            original,
            op.replacement
        );
        Ok(original)
    }

    /// Write the recorded original back into `op`'s slot.
    pub fn uninstall(&self, op: &TargetOperation) -> Result<UninstallOutcome, Error> {
        let table = self.table.ok_or(Error::NotResolved)?;
        if !op.is_installed() {
            return Err(Error::NotInstalled(op.code));
        }
        let slot = table.slot_addr(op.code).ok_or(Error::SlotOutOfRange {
            code: op.code,
            nr_slots: table.nr_slots(),
        })?;
        let original = op.original.load(Ordering::SeqCst);

        let saved = self.guard.enter_writable(slot).map_err(Error::Guard)?;
        let found = table.read(op.code).unwrap_or(0);
        table.write(op.code, original);
        op.installed.store(false, Ordering::SeqCst);
        // The slot already holds the original again; only protection is off.
        if let Err(e) = self.guard.exit_writable(saved) {
            log::warn!(
                "interceptor: slot {} restored but write protection is still lifted: {:?}",
                op.code,
                e
            );
        }

        if found != op.replacement {
            log::warn!(
                "interceptor: somebody else also played with slot {} ({:#x} found, {:#x} expected)",
                op.code,
                found,
                op.replacement
            );
            log::warn!("interceptor: the system may be left in an unstable state");
            return Ok(UninstallOutcome::Interference { found });
        }

        log::info!(
            "interceptor: slot {} of {:#x} restored to {:#x}",
            op.code,
            table.base(),
            original
        );
        Ok(UninstallOutcome::Restored)
    }
}

// =============================================================================
// Trampoline
// =============================================================================

/// Target served by [`replacement_handler`].
static ACTIVE_TARGET: RwLock<Option<Arc<TargetOperation>>> = RwLock::new(None);

/// Make `op` the target of [`replacement_handler`].
///
/// Must happen before the replacement becomes reachable from the table.
/// Fails if another target is already published.
pub fn publish(op: Arc<TargetOperation>) -> Result<(), Arc<TargetOperation>> {
    let mut active = ACTIVE_TARGET.write();
    if active.is_some() {
        return Err(op);
    }
    *active = Some(op);
    Ok(())
}

/// Withdraw the published target, if any.
pub fn retire() -> Option<Arc<TargetOperation>> {
    ACTIVE_TARGET.write().take()
}

/// Whether a target is currently published.
pub fn is_published() -> bool {
    ACTIVE_TARGET.read().is_some()
}

/// Handler written into the intercepted slot.
///
/// Observes the caller through the published target's observer, then
/// forwards the unchanged arguments to the recorded original and returns its
/// result.
///
/// # Safety
/// `args` must be valid for the original handler.
pub unsafe extern "C" fn replacement_handler(args: *const SyscallArgs) -> isize {
    let Some(op) = ACTIVE_TARGET.read().clone() else {
        return -ENOSYS;
    };
    let Some(original) = op.original() else {
        return -ENOSYS;
    };

    if !args.is_null() {
        let ctx = CallerContext::current(unsafe { *args });
        op.observer.observe(&ctx);
    }

    // SAFETY: `original` was read from a dispatch table slot.
    let original: SyscallHandler = unsafe { core::mem::transmute(original) };
    unsafe { original(args) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::IdentityFilter;
    use crate::guard::MockProtection;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    fn leak_table(n: usize) -> (&'static [AtomicUsize], DispatchTable) {
        let slots: Vec<AtomicUsize> = (0..n).map(|i| AtomicUsize::new(0x1000 + i)).collect();
        let slots: &'static [AtomicUsize] = Box::leak(slots.into_boxed_slice());
        let table = unsafe { DispatchTable::from_raw(slots.as_ptr() as usize, n) };
        (slots, table)
    }

    fn target(code: usize) -> TargetOperation {
        let observer = Arc::new(CallObserver::new("unit", IdentityFilter(None)));
        TargetOperation::new(code, 0xfeed, observer)
    }

    #[test]
    fn test_install_requires_resolution() {
        let interceptor = Interceptor::new(MockProtection::new());
        assert!(matches!(
            interceptor.install(&target(1)),
            Err(Error::NotResolved)
        ));
    }

    #[test]
    fn test_install_records_original_then_patches() {
        let (slots, table) = leak_table(8);
        let mock = MockProtection::new();
        let mut interceptor = Interceptor::new(mock.clone());
        interceptor.bind(table);
        let op = target(5);

        assert_eq!(interceptor.install(&op).unwrap(), 0x1005);
        assert_eq!(op.original(), Some(0x1005));
        assert_eq!(slots[5].load(Ordering::SeqCst), 0xfeed);
        assert!(op.is_installed());
        assert!(mock.is_protected());
        assert_eq!(mock.brackets(), 1);

        assert!(matches!(
            interceptor.install(&op),
            Err(Error::AlreadyInstalled(5))
        ));
    }

    #[test]
    fn test_out_of_range_code_touches_nothing() {
        let (_slots, table) = leak_table(4);
        let mock = MockProtection::new();
        let mut interceptor = Interceptor::new(mock.clone());
        interceptor.bind(table);

        assert!(matches!(
            interceptor.install(&target(4)),
            Err(Error::SlotOutOfRange { code: 4, nr_slots: 4 })
        ));
        assert_eq!(mock.brackets(), 0);
    }

    #[test]
    fn test_guard_failure_leaves_slot_untouched() {
        let (slots, table) = leak_table(4);
        let mock = MockProtection::new();
        mock.set_fail_reads(true);
        let mut interceptor = Interceptor::new(mock);
        interceptor.bind(table);
        let op = target(2);

        assert!(matches!(interceptor.install(&op), Err(Error::Guard(_))));
        assert_eq!(slots[2].load(Ordering::SeqCst), 0x1002);
        assert!(!op.is_installed());
        assert_eq!(op.original(), None);
    }

    #[test]
    fn test_empty_slot_is_refused() {
        let (slots, table) = leak_table(4);
        slots[1].store(0, Ordering::SeqCst);
        let mock = MockProtection::new();
        let mut interceptor = Interceptor::new(mock.clone());
        interceptor.bind(table);
        let op = target(1);

        assert!(matches!(interceptor.install(&op), Err(Error::EmptySlot(1))));
        assert_eq!(slots[1].load(Ordering::SeqCst), 0);
        assert!(!op.is_installed());
        assert!(mock.is_protected());
        assert!(!interceptor.guard().is_open());
    }

    #[test]
    fn test_failed_restore_after_patch_reverts_slot() {
        let (slots, table) = leak_table(4);
        let mock = MockProtection::new();
        mock.set_fail_restores(true);
        let mut interceptor = Interceptor::new(mock);
        interceptor.bind(table);
        let op = target(3);

        assert!(matches!(interceptor.install(&op), Err(Error::Guard(_))));
        assert_eq!(slots[3].load(Ordering::SeqCst), 0x1003);
        assert!(!op.is_installed());
        assert_eq!(op.original(), None);
    }

    #[test]
    fn test_uninstall_without_install_fails() {
        let (_slots, table) = leak_table(4);
        let mut interceptor = Interceptor::new(MockProtection::new());
        interceptor.bind(table);

        assert!(matches!(
            interceptor.uninstall(&target(1)),
            Err(Error::NotInstalled(1))
        ));
    }
}
