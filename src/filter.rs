//! Per-invocation identity filter and logging.
//!
//! Shared by the table replacement handler and the probe pre-handler. The
//! observer only ever logs; it has no say over the call's outcome.

use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::table::SyscallArgs;

/// Snapshot of one invocation, built per call and dropped when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerContext {
    /// Identity (uid) of the calling task, if the host can tell.
    pub identity: Option<u32>,
    /// Invocation arguments.
    pub args: SyscallArgs,
}

impl CallerContext {
    pub fn new(identity: Option<u32>, args: SyscallArgs) -> Self {
        Self { identity, args }
    }

    /// Context for the current caller as reported by the platform.
    pub fn current(args: SyscallArgs) -> Self {
        Self::new(crate::platform::current_identity(), args)
    }
}

/// Identity to watch; `None` watches nobody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdentityFilter(pub Option<u32>);

impl IdentityFilter {
    pub fn matches(&self, identity: Option<u32>) -> bool {
        matches!((self.0, identity), (Some(want), Some(got)) if want == got)
    }
}

/// Logs invocations of one operation made by the filtered identity.
#[derive(Debug)]
pub struct CallObserver {
    operation: String,
    filter: IdentityFilter,
    hits: AtomicU64,
}

impl CallObserver {
    pub fn new(operation: &str, filter: IdentityFilter) -> Self {
        Self {
            operation: String::from(operation),
            filter,
            hits: AtomicU64::new(0),
        }
    }

    /// Name used in log records.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn filter(&self) -> IdentityFilter {
        self.filter
    }

    /// Number of matching invocations seen so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Inspect one invocation. Emits exactly one log record when the caller
    /// matches the filter and returns whether it did.
    pub fn observe(&self, ctx: &CallerContext) -> bool {
        if !self.filter.matches(ctx.identity) {
            return false;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(id) = ctx.identity {
            log::info!("{} called by {}", self.operation, id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_exact_identity_only() {
        let filter = IdentityFilter(Some(42));
        assert!(filter.matches(Some(42)));
        assert!(!filter.matches(Some(7)));
        assert!(!filter.matches(None));
    }

    #[test]
    fn test_unset_filter_matches_nobody() {
        let filter = IdentityFilter::default();
        assert!(!filter.matches(Some(0)));
        assert!(!filter.matches(None));
    }

    #[test]
    fn test_observer_counts_matching_calls() {
        let observer = CallObserver::new("open-like", IdentityFilter(Some(42)));
        let args = SyscallArgs::default();

        assert!(observer.observe(&CallerContext::new(Some(42), args)));
        assert!(!observer.observe(&CallerContext::new(Some(7), args)));
        assert!(observer.observe(&CallerContext::new(Some(42), args)));

        assert_eq!(observer.hits(), 2);
        assert_eq!(observer.operation(), "open-like");
    }
}
