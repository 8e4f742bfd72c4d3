//! Write-protection guard around dispatch table mutations.
//!
//! The table lives in memory the CPU refuses to write while protection is on.
//! [`GuardController`] brackets exactly one mutation: it saves the current
//! protection state, clears the write-protect bit, and afterwards restores the
//! saved state verbatim.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::AxResult;

/// Access to the protection state that guards a table address.
///
/// Implemented by the architecture backends and by [`MockProtection`].
pub trait ProtectionControl {
    /// Read the raw protection state covering `addr`.
    fn read(&self, addr: usize) -> AxResult<usize>;

    /// Write a raw protection state covering `addr`.
    fn write(&self, addr: usize, state: usize) -> AxResult<()>;

    /// `state` with write protection lifted.
    fn writable(&self, state: usize) -> usize;

    /// Keep the current task on this CPU until [`ProtectionControl::unpin`].
    ///
    /// Called before the protection state is read. Backends whose state is
    /// per CPU must implement it.
    fn pin(&self) {}

    /// Undo [`ProtectionControl::pin`]. Called once the saved state is back.
    fn unpin(&self) {}
}

impl<T: ProtectionControl + ?Sized> ProtectionControl for Arc<T> {
    fn read(&self, addr: usize) -> AxResult<usize> {
        (**self).read(addr)
    }

    fn write(&self, addr: usize, state: usize) -> AxResult<()> {
        (**self).write(addr, state)
    }

    fn writable(&self, state: usize) -> usize {
        (**self).writable(state)
    }

    fn pin(&self) {
        (**self).pin()
    }

    fn unpin(&self) {
        (**self).unpin()
    }
}

/// Protection state captured by [`GuardController::enter_writable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the saved state must be handed back to exit_writable"]
pub struct SavedState {
    addr: usize,
    state: usize,
}

impl SavedState {
    /// Raw state as it was before the bracket opened.
    pub fn raw(&self) -> usize {
        self.state
    }
}

/// Brackets single table mutations with save/clear/restore of the protection
/// state. Brackets do not nest.
pub struct GuardController<P: ProtectionControl> {
    protection: P,
    open: AtomicBool,
}

impl<P: ProtectionControl> GuardController<P> {
    pub fn new(protection: P) -> Self {
        Self {
            protection,
            open: AtomicBool::new(false),
        }
    }

    /// Backend in use.
    pub fn protection(&self) -> &P {
        &self.protection
    }

    /// Whether a bracket is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Save the protection state covering `addr` and clear write protection.
    pub fn enter_writable(&self, addr: usize) -> AxResult<SavedState> {
        if self.open.swap(true, Ordering::SeqCst) {
            return axerrno::ax_err!(BadState, "guard bracket already open");
        }

        self.protection.pin();
        let state = match self.protection.read(addr) {
            Ok(state) => state,
            Err(e) => {
                self.protection.unpin();
                self.open.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        if let Err(e) = self.protection.write(addr, self.protection.writable(state)) {
            self.protection.unpin();
            self.open.store(false, Ordering::SeqCst);
            return Err(e);
        }

        log::trace!("guard: writable at {:#x} (saved {:#x})", addr, state);
        Ok(SavedState { addr, state })
    }

    /// Restore exactly the state captured by the matching `enter_writable`.
    pub fn exit_writable(&self, saved: SavedState) -> AxResult<()> {
        let ret = self.protection.write(saved.addr, saved.state);
        self.protection.unpin();
        self.open.store(false, Ordering::SeqCst);
        if ret.is_err() {
            log::error!("guard: failed to restore protection at {:#x}", saved.addr);
        } else {
            log::trace!("guard: restored {:#x} at {:#x}", saved.state, saved.addr);
        }
        ret
    }

    /// Run `action` inside one bracket.
    pub fn with_writable<R>(&self, addr: usize, action: impl FnOnce() -> R) -> AxResult<R> {
        let saved = self.enter_writable(addr)?;
        let result = action();
        self.exit_writable(saved)?;
        Ok(result)
    }
}

// =============================================================================
// x86_64: CR0.WP
// =============================================================================

/// CR0 write-protect bit.
#[cfg(target_arch = "x86_64")]
pub const CR0_WP: usize = 1 << 16;

/// RFLAGS interrupt-enable bit.
#[cfg(target_arch = "x86_64")]
const RFLAGS_IF: usize = 1 << 9;

/// Write protection through CR0.WP.
///
/// CR0 is per CPU, so a bracket runs with interrupts disabled: the task
/// cannot be preempted or migrated between lifting and restoring the bit.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default)]
pub struct Cr0Protection {
    irqs_were_enabled: AtomicBool,
}

#[cfg(target_arch = "x86_64")]
impl ProtectionControl for Cr0Protection {
    fn read(&self, _addr: usize) -> AxResult<usize> {
        let cr0: usize;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Ok(cr0)
    }

    fn write(&self, _addr: usize, state: usize) -> AxResult<()> {
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) state, options(nostack, preserves_flags));
        }
        Ok(())
    }

    fn writable(&self, state: usize) -> usize {
        state & !CR0_WP
    }

    fn pin(&self) {
        let rflags: usize;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(preserves_flags));
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
        self.irqs_were_enabled
            .store(rflags & RFLAGS_IF != 0, Ordering::SeqCst);
    }

    fn unpin(&self) {
        if self.irqs_were_enabled.swap(false, Ordering::SeqCst) {
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
            }
        }
    }
}

// =============================================================================
// Other architectures
// =============================================================================

/// Backend for architectures without table patching support.
#[cfg(not(any(target_arch = "x86_64", all(target_arch = "aarch64", feature = "axhal"))))]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProtection;

#[cfg(not(any(target_arch = "x86_64", all(target_arch = "aarch64", feature = "axhal"))))]
impl ProtectionControl for UnsupportedProtection {
    fn read(&self, _addr: usize) -> AxResult<usize> {
        log::warn!("guard: write protection control not implemented for this architecture");
        axerrno::ax_err!(Unsupported, "write protection control not implemented")
    }

    fn write(&self, _addr: usize, _state: usize) -> AxResult<()> {
        axerrno::ax_err!(Unsupported, "write protection control not implemented")
    }

    fn writable(&self, state: usize) -> usize {
        state
    }
}

/// The architecture's protection backend.
#[cfg(target_arch = "x86_64")]
pub type DefaultProtection = Cr0Protection;

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
pub type DefaultProtection = crate::page_table::PteProtection;

#[cfg(not(any(target_arch = "x86_64", all(target_arch = "aarch64", feature = "axhal"))))]
pub type DefaultProtection = UnsupportedProtection;

// =============================================================================
// Mock
// =============================================================================

#[cfg(any(test, feature = "test-utils", not(feature = "axhal")))]
pub use mock::MockProtection;

#[cfg(any(test, feature = "test-utils", not(feature = "axhal")))]
mod mock {
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use axerrno::AxResult;

    use super::ProtectionControl;

    /// Write-protect bit of the mock register (same position as CR0.WP).
    const WP: usize = 1 << 16;

    #[derive(Debug)]
    struct Inner {
        register: AtomicUsize,
        brackets: AtomicUsize,
        fail_reads: AtomicBool,
        fail_restores: AtomicBool,
        pinned: AtomicBool,
    }

    /// Software protection register for tests. Clones share state.
    #[derive(Debug, Clone)]
    pub struct MockProtection {
        inner: Arc<Inner>,
    }

    impl Default for MockProtection {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockProtection {
        /// A register with write protection enabled and a few unrelated bits set.
        pub fn new() -> Self {
            Self::with_register(WP | 0x8000_0011)
        }

        pub fn with_register(value: usize) -> Self {
            Self {
                inner: Arc::new(Inner {
                    register: AtomicUsize::new(value),
                    brackets: AtomicUsize::new(0),
                    fail_reads: AtomicBool::new(false),
                    fail_restores: AtomicBool::new(false),
                    pinned: AtomicBool::new(false),
                }),
            }
        }

        /// Raw register value.
        pub fn register(&self) -> usize {
            self.inner.register.load(Ordering::SeqCst)
        }

        /// Whether writes are currently blocked.
        pub fn is_protected(&self) -> bool {
            self.register() & WP != 0
        }

        /// Number of times protection was lifted.
        pub fn brackets(&self) -> usize {
            self.inner.brackets.load(Ordering::SeqCst)
        }

        /// Make subsequent reads fail, as if the backend were unavailable.
        pub fn set_fail_reads(&self, fail: bool) {
            self.inner.fail_reads.store(fail, Ordering::SeqCst);
        }

        /// Make writes that turn protection back on fail. The register keeps
        /// protection lifted, as a real failed restore would.
        pub fn set_fail_restores(&self, fail: bool) {
            self.inner.fail_restores.store(fail, Ordering::SeqCst);
        }

        /// Whether a bracket currently holds the CPU.
        pub fn is_pinned(&self) -> bool {
            self.inner.pinned.load(Ordering::SeqCst)
        }
    }

    impl ProtectionControl for MockProtection {
        fn read(&self, _addr: usize) -> AxResult<usize> {
            if self.inner.fail_reads.load(Ordering::SeqCst) {
                return axerrno::ax_err!(Unsupported, "mock protection read failure");
            }
            Ok(self.register())
        }

        fn write(&self, _addr: usize, state: usize) -> AxResult<()> {
            if state & WP != 0 && self.inner.fail_restores.load(Ordering::SeqCst) {
                return axerrno::ax_err!(BadState, "mock protection restore failure");
            }
            let old = self.inner.register.swap(state, Ordering::SeqCst);
            if old & WP != 0 && state & WP == 0 {
                self.inner.brackets.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn writable(&self, state: usize) -> usize {
            state & !WP
        }

        fn pin(&self) {
            self.inner.pinned.store(true, Ordering::SeqCst);
        }

        fn unpin(&self) {
            self.inner.pinned.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_clears_and_exit_restores_exact_state() {
        let mock = MockProtection::new();
        let before = mock.register();
        let guard = GuardController::new(mock.clone());

        let saved = guard.enter_writable(0x1000).unwrap();
        assert_eq!(saved.raw(), before);
        assert!(!mock.is_protected());
        assert!(guard.is_open());

        guard.exit_writable(saved).unwrap();
        assert_eq!(mock.register(), before);
        assert!(!guard.is_open());
        assert_eq!(mock.brackets(), 1);
    }

    #[test]
    fn test_exit_restores_unprotected_state_verbatim() {
        let mock = MockProtection::with_register(0x11);
        let guard = GuardController::new(mock.clone());

        let saved = guard.enter_writable(0).unwrap();
        guard.exit_writable(saved).unwrap();

        assert_eq!(mock.register(), 0x11);
        assert!(!mock.is_protected());
    }

    #[test]
    fn test_nested_enter_is_rejected() {
        let mock = MockProtection::new();
        let guard = GuardController::new(mock.clone());

        let saved = guard.enter_writable(0).unwrap();
        assert!(guard.enter_writable(0).is_err());
        guard.exit_writable(saved).unwrap();

        assert!(mock.is_protected());
        assert_eq!(mock.brackets(), 1);
    }

    #[test]
    fn test_failed_read_leaves_guard_closed() {
        let mock = MockProtection::new();
        mock.set_fail_reads(true);
        let guard = GuardController::new(mock.clone());

        assert!(guard.enter_writable(0).is_err());
        assert!(!guard.is_open());
        assert!(mock.is_protected());
    }

    #[test]
    fn test_bracket_holds_the_cpu() {
        let mock = MockProtection::new();
        let guard = GuardController::new(mock.clone());

        let pinned_inside = guard.with_writable(0, || mock.is_pinned()).unwrap();
        assert!(pinned_inside);
        assert!(!mock.is_pinned());

        mock.set_fail_reads(true);
        assert!(guard.enter_writable(0).is_err());
        assert!(!mock.is_pinned());
    }

    #[test]
    fn test_failed_restore_closes_bracket() {
        let mock = MockProtection::new();
        let guard = GuardController::new(mock.clone());

        let saved = guard.enter_writable(0).unwrap();
        mock.set_fail_restores(true);
        assert!(guard.exit_writable(saved).is_err());

        assert!(!guard.is_open());
        assert!(!mock.is_pinned());
        assert!(!mock.is_protected());
    }

    #[test]
    fn test_with_writable_runs_action_unprotected() {
        let mock = MockProtection::new();
        let guard = GuardController::new(mock.clone());

        let was_protected = guard.with_writable(0, || mock.is_protected()).unwrap();

        assert!(!was_protected);
        assert!(mock.is_protected());
    }
}
