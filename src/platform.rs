//! Platform abstraction layer for kernel operations.
//!
//! This module provides an abstraction over the host facilities the
//! interception subsystem consumes (time, bounded sleep, caller identity)
//! to allow testing in user space.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

/// Platform operations trait.
///
/// Abstracts over kernel-specific operations to enable mock testing.
pub trait PlatformOps {
    /// Get current monotonic time in nanoseconds.
    fn time_ns() -> u64;

    /// Block the current CPU for roughly `ms` milliseconds.
    fn sleep_ms(ms: u64);
}

// =============================================================================
// Real Implementation (kernel environment with axhal)
// =============================================================================

/// Real platform operations using axhal.
#[cfg(all(not(test), feature = "axhal"))]
pub struct RealPlatform;

#[cfg(all(not(test), feature = "axhal"))]
impl PlatformOps for RealPlatform {
    fn time_ns() -> u64 {
        axhal::time::monotonic_time().as_nanos() as u64
    }

    fn sleep_ms(ms: u64) {
        axhal::time::busy_wait(core::time::Duration::from_millis(ms));
    }
}

// =============================================================================
// Mock Implementation (test environment or no axhal)
// =============================================================================

/// Mock time value for testing.
static MOCK_TIME_NS: AtomicU64 = AtomicU64::new(1_000_000_000); // 1 second

/// Total milliseconds requested through `sleep_ms` on the mock platform.
static MOCK_SLEPT_MS: AtomicU64 = AtomicU64::new(0);

/// Mock platform operations for testing.
///
/// Sleeping advances the mock clock instead of blocking.
#[cfg(any(test, not(feature = "axhal")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "axhal")))]
impl PlatformOps for MockPlatform {
    fn time_ns() -> u64 {
        MOCK_TIME_NS.load(Ordering::Relaxed)
    }

    fn sleep_ms(ms: u64) {
        MOCK_SLEPT_MS.fetch_add(ms, Ordering::Relaxed);
        MOCK_TIME_NS.fetch_add(ms.saturating_mul(1_000_000), Ordering::Relaxed);
    }
}

/// Advance mock time by given nanoseconds.
pub fn advance_mock_time(ns: u64) {
    MOCK_TIME_NS.fetch_add(ns, Ordering::Relaxed);
}

/// Total milliseconds slept on the mock platform.
pub fn mock_slept_ms() -> u64 {
    MOCK_SLEPT_MS.load(Ordering::Relaxed)
}

// =============================================================================
// Platform Type Alias
// =============================================================================

/// The active platform implementation.
///
/// In kernel environment with axhal: RealPlatform (uses axhal)
/// In test environment or without axhal: MockPlatform (uses atomic counters)
#[cfg(all(not(test), feature = "axhal"))]
pub type Platform = RealPlatform;

#[cfg(any(test, not(feature = "axhal")))]
pub type Platform = MockPlatform;

// =============================================================================
// Convenience Functions
// =============================================================================

/// Get current time in nanoseconds.
#[inline]
pub fn time_ns() -> u64 {
    Platform::time_ns()
}

/// Sleep for `ms` milliseconds.
#[inline]
pub fn sleep_ms(ms: u64) {
    Platform::sleep_ms(ms)
}

// =============================================================================
// Caller Identity
// =============================================================================

/// Host callback returning the identity (uid) of the task currently executing
/// on this CPU, or `None` when there is no task context.
pub type IdentityFn = fn() -> Option<u32>;

static IDENTITY_HOOK: RwLock<Option<IdentityFn>> = RwLock::new(None);

/// Register the host's caller-identity query.
pub fn register_identity_hook(hook: IdentityFn) {
    *IDENTITY_HOOK.write() = Some(hook);
    log::debug!("platform: identity hook registered");
}

/// Remove a previously registered identity query.
pub fn clear_identity_hook() {
    *IDENTITY_HOOK.write() = None;
}

/// Identity of the current caller.
///
/// Returns `None` when no hook is registered; such callers never match an
/// identity filter.
#[inline]
pub fn current_identity() -> Option<u32> {
    let hook = *IDENTITY_HOOK.read();
    hook.and_then(|f| f())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_time_advances() {
        let before = time_ns();
        advance_mock_time(1000);
        assert!(time_ns() >= before + 1000);
    }

    #[test]
    fn test_mock_sleep_advances_clock() {
        let before_time = time_ns();
        let before_slept = mock_slept_ms();

        sleep_ms(3);

        assert!(time_ns() >= before_time + 3_000_000);
        assert!(mock_slept_ms() >= before_slept + 3);
    }

    #[test]
    fn test_identity_hook() {
        fn uid_1000() -> Option<u32> {
            Some(1000)
        }

        register_identity_hook(uid_1000);
        assert_eq!(current_identity(), Some(1000));

        clear_identity_hook();
        assert_eq!(current_identity(), None);
    }
}
