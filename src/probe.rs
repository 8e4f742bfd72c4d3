//! Probe-based interception.
//!
//! Instead of patching the dispatch table, register a pre-call probe on the
//! operation's symbol with the host's instrumentation facility. The probe
//! observes every invocation through the same [`CallObserver`] the table
//! trampoline uses, and can neither alter control flow nor the return value.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use axerrno::{AxError, AxResult};

use crate::filter::CallObserver;

/// Identifier handed out by the host for one registered probe.
pub type ProbeId = usize;

/// Host facility that delivers pre-call events for a symbol.
pub trait InstrumentationHost: Send + Sync {
    /// Arrange for `observer` to see every invocation of `symbol` before it
    /// runs.
    fn register(&self, symbol: &str, observer: Arc<CallObserver>) -> AxResult<ProbeId>;

    /// Remove a probe. Unknown ids are ignored.
    fn deregister(&self, id: ProbeId);
}

/// Error types for probe registration.
#[derive(Debug)]
pub enum Error {
    /// The host refused the probe.
    Register { symbol: String, source: AxError },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { symbol, source } => {
                write!(f, "Failed to register probe on {}: {:?}", symbol, source)
            }
        }
    }
}

impl core::error::Error for Error {}

/// A live probe registration.
#[derive(Debug)]
pub struct ProbeAttachment {
    id: ProbeId,
    symbol: String,
    observer: Arc<CallObserver>,
}

impl ProbeAttachment {
    pub fn id(&self) -> ProbeId {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn observer(&self) -> &Arc<CallObserver> {
        &self.observer
    }
}

/// Register `observer` as the pre-call handler of `symbol`.
pub fn register(
    host: &dyn InstrumentationHost,
    symbol: &str,
    observer: Arc<CallObserver>,
) -> Result<ProbeAttachment, Error> {
    match host.register(symbol, observer.clone()) {
        Ok(id) => {
            log::info!("probe: planted on {} (id {})", symbol, id);
            Ok(ProbeAttachment {
                id,
                symbol: String::from(symbol),
                observer,
            })
        }
        Err(source) => {
            log::error!("probe: registering {} failed: {:?}", symbol, source);
            log::error!("probe: check the syscall_sym parameter");
            Err(Error::Register {
                symbol: String::from(symbol),
                source,
            })
        }
    }
}

/// Remove the probe unconditionally.
pub fn deregister(host: &dyn InstrumentationHost, attachment: ProbeAttachment) {
    host.deregister(attachment.id);
    log::info!(
        "probe: removed from {} after {} matching calls",
        attachment.symbol,
        attachment.observer.hits()
    );
}

// =============================================================================
// Mock
// =============================================================================

#[cfg(any(test, feature = "test-utils", not(feature = "axhal")))]
pub use mock::MockHost;

#[cfg(any(test, feature = "test-utils", not(feature = "axhal")))]
mod mock {
    use alloc::collections::{BTreeMap, BTreeSet};
    use alloc::string::String;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use axerrno::AxResult;
    use spin::Mutex;

    use super::{InstrumentationHost, ProbeId};
    use crate::filter::{CallObserver, CallerContext};

    #[derive(Default)]
    struct Registry {
        next_id: ProbeId,
        probes: BTreeMap<ProbeId, (String, Arc<CallObserver>)>,
        known: Option<BTreeSet<String>>,
    }

    /// Instrumentation host for tests.
    ///
    /// Accepts any symbol unless restricted with [`MockHost::with_symbols`].
    /// Events are delivered by calling [`MockHost::fire`].
    #[derive(Default)]
    pub struct MockHost {
        registry: Mutex<Registry>,
    }

    impl MockHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Only accept probes on `symbols`.
        pub fn with_symbols(symbols: &[&str]) -> Self {
            let host = Self::default();
            host.registry.lock().known = Some(symbols.iter().map(|s| String::from(*s)).collect());
            host
        }

        /// Deliver one pre-call event for `symbol`. Returns how many probes saw it.
        pub fn fire(&self, symbol: &str, ctx: &CallerContext) -> usize {
            let observers: Vec<Arc<CallObserver>> = self
                .registry
                .lock()
                .probes
                .values()
                .filter(|(s, _)| s == symbol)
                .map(|(_, o)| o.clone())
                .collect();
            for observer in &observers {
                observer.observe(ctx);
            }
            observers.len()
        }

        /// Number of registered probes.
        pub fn probe_count(&self) -> usize {
            self.registry.lock().probes.len()
        }
    }

    impl InstrumentationHost for MockHost {
        fn register(&self, symbol: &str, observer: Arc<CallObserver>) -> AxResult<ProbeId> {
            let mut registry = self.registry.lock();
            if let Some(known) = &registry.known {
                if !known.contains(symbol) {
                    return axerrno::ax_err!(NotFound, "symbol not found");
                }
            }
            registry.next_id += 1;
            let id = registry.next_id;
            registry.probes.insert(id, (String::from(symbol), observer));
            Ok(id)
        }

        fn deregister(&self, id: ProbeId) {
            self.registry.lock().probes.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{CallerContext, IdentityFilter};
    use crate::table::SyscallArgs;

    #[test]
    fn test_probe_observes_matching_calls() {
        let host = MockHost::new();
        let observer = Arc::new(CallObserver::new("open-like", IdentityFilter(Some(42))));
        let attachment = register(&host, "open-like", observer.clone()).unwrap();
        let args = SyscallArgs::default();

        assert_eq!(host.fire("open-like", &CallerContext::new(Some(42), args)), 1);
        assert_eq!(host.fire("open-like", &CallerContext::new(Some(7), args)), 1);
        assert_eq!(host.fire("close-like", &CallerContext::new(Some(42), args)), 0);
        assert_eq!(observer.hits(), 1);

        deregister(&host, attachment);
        assert_eq!(host.probe_count(), 0);
        assert_eq!(host.fire("open-like", &CallerContext::new(Some(42), args)), 0);
    }

    #[test]
    fn test_unknown_symbol_is_reported() {
        let host = MockHost::with_symbols(&["open-like"]);
        let observer = Arc::new(CallObserver::new("typo", IdentityFilter(None)));

        let err = register(&host, "typo", observer).unwrap_err();
        assert!(matches!(err, Error::Register { ref symbol, .. } if symbol == "typo"));
        assert_eq!(host.probe_count(), 0);
    }
}
