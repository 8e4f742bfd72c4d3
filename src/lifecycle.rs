//! Activation and deactivation of one interception.
//!
//! ```text
//! Uninitialized -> Resolving -> Installed -> Uninstalling -> Uninitialized
//!                      |                          |
//!                      +-- failure ---------------+-- guard failure -> Installed
//! ```
//!
//! In table mode activation resolves the dispatch table, publishes the
//! trampoline's target and patches the slot. Deactivation restores the slot,
//! then waits out the settle delay before the trampoline state is retired and
//! the manager returns to `Uninitialized`.
//!
//! In probe mode activation registers a pre-call probe and deactivation
//! removes it; the settle delay applies all the same.

use alloc::sync::Arc;
use core::fmt;

use spin::{Mutex, RwLock};

use crate::config::{self, Anchor, InterceptConfig, InterceptMode};
use crate::filter::{CallObserver, IdentityFilter};
use crate::guard::{DefaultProtection, ProtectionControl};
use crate::interceptor::{self, Interceptor, TargetOperation, UninstallOutcome};
use crate::platform;
use crate::probe::{self, InstrumentationHost, ProbeAttachment};
use crate::resolver::{self, AnchorScan, Resolver, StaticAddress};
use crate::table::DispatchTable;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Resolving,
    Installed,
    Uninstalling,
}

impl LifecycleState {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Resolving => "resolving",
            LifecycleState::Installed => "installed",
            LifecycleState::Uninstalling => "uninstalling",
        }
    }
}

/// Error types for activation and deactivation.
#[derive(Debug)]
pub enum Error {
    /// Module parameters could not be parsed.
    Config(config::Error),
    /// The dispatch table could not be located.
    Resolve(resolver::Error),
    /// The slot could not be patched or restored.
    Intercept(interceptor::Error),
    /// The probe could not be registered.
    Probe(probe::Error),
    /// Probe mode requested without an instrumentation host.
    NoProbeHost,
    /// The request is not valid in the current state.
    InvalidState(LifecycleState),
    /// Another table-mode interception is already live.
    Busy,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Resolve(e) => write!(f, "{}", e),
            Self::Intercept(e) => write!(f, "{}", e),
            Self::Probe(e) => write!(f, "{}", e),
            Self::NoProbeHost => write!(f, "No instrumentation host registered"),
            Self::InvalidState(state) => write!(f, "Invalid in state {}", state.label()),
            Self::Busy => write!(f, "Another interception is already active"),
        }
    }
}

impl core::error::Error for Error {}

impl From<config::Error> for Error {
    fn from(e: config::Error) -> Self {
        Self::Config(e)
    }
}

impl From<resolver::Error> for Error {
    fn from(e: resolver::Error) -> Self {
        Self::Resolve(e)
    }
}

impl From<interceptor::Error> for Error {
    fn from(e: interceptor::Error) -> Self {
        Self::Intercept(e)
    }
}

impl From<probe::Error> for Error {
    fn from(e: probe::Error) -> Self {
        Self::Probe(e)
    }
}

/// Snapshot for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: LifecycleState,
    pub mode: InterceptMode,
    pub table_base: Option<usize>,
    pub code: usize,
    pub original: Option<usize>,
    pub hits: u64,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "state:    {}", self.state.label())?;
        writeln!(f, "mode:     {}", self.mode.label())?;
        match self.table_base {
            Some(base) => writeln!(f, "table:    {:#x}", base)?,
            None => writeln!(f, "table:    -")?,
        }
        writeln!(f, "code:     {}", self.code)?;
        match self.original {
            Some(addr) => writeln!(f, "original: {:#x}", addr)?,
            None => writeln!(f, "original: -")?,
        }
        write!(f, "hits:     {}", self.hits)
    }
}

/// Drives one interception through its lifecycle.
pub struct InterceptManager<P: ProtectionControl> {
    config: InterceptConfig,
    state: LifecycleState,
    interceptor: Interceptor<P>,
    resolver: Option<Resolver>,
    probe_host: Option<Arc<dyn InstrumentationHost>>,
    target: Option<Arc<TargetOperation>>,
    attachment: Option<ProbeAttachment>,
    observer: Option<Arc<CallObserver>>,
}

impl<P: ProtectionControl> InterceptManager<P> {
    pub fn new(config: InterceptConfig, protection: P) -> Self {
        Self {
            config,
            state: LifecycleState::Uninitialized,
            interceptor: Interceptor::new(protection),
            resolver: None,
            probe_host: None,
            target: None,
            attachment: None,
            observer: None,
        }
    }

    /// Host used in probe mode.
    pub fn with_probe_host(mut self, host: Arc<dyn InstrumentationHost>) -> Self {
        self.probe_host = Some(host);
        self
    }

    /// Use `resolver` instead of the one derived from the configuration.
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn interceptor(&self) -> &Interceptor<P> {
        &self.interceptor
    }

    /// The operation patched in table mode, while installed.
    pub fn target(&self) -> Option<&Arc<TargetOperation>> {
        self.target.as_ref()
    }

    /// Observer of the current or most recent activation.
    pub fn observer(&self) -> Option<&Arc<CallObserver>> {
        self.observer.as_ref()
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state,
            mode: self.config.mode,
            table_base: self.interceptor.table().map(|t| t.base()),
            code: self.config.syscall_nr,
            original: self.target.as_ref().and_then(|op| op.original()),
            hits: self.observer.as_ref().map_or(0, |o| o.hits()),
        }
    }

    /// Resolve and install (table mode) or register (probe mode).
    ///
    /// On failure the manager is back in `Uninitialized` and nothing has been
    /// mutated.
    ///
    /// # Safety
    /// Every address the resolver may inspect must be readable: the
    /// configured table address, the scan range and the table found by symbol
    /// lookup. The resolved table must hold `nr_slots` handlers and stay
    /// mapped until deactivation completes.
    pub unsafe fn activate(&mut self) -> Result<(), Error> {
        if self.state != LifecycleState::Uninitialized {
            return Err(Error::InvalidState(self.state));
        }
        self.state = LifecycleState::Resolving;

        match self.config.uid {
            Some(uid) => info!("Spying on UID: {}", uid),
            None => info!("Spying on UID: -1 (nobody)"),
        }

        let observer = Arc::new(CallObserver::new(
            &self.config.syscall_symbol,
            IdentityFilter(self.config.uid),
        ));

        let result = match self.config.mode {
            InterceptMode::Table => unsafe { self.activate_table(observer.clone()) },
            InterceptMode::Probe => self.activate_probe(observer.clone()),
        };

        match result {
            Ok(()) => {
                self.observer = Some(observer);
                self.state = LifecycleState::Installed;
                info!(
                    "lifecycle: {} intercepted ({} mode)",
                    self.config.syscall_symbol,
                    self.config.mode.label()
                );
                Ok(())
            }
            Err(e) => {
                error!("lifecycle: activation failed: {}", e);
                self.state = LifecycleState::Uninitialized;
                Err(e)
            }
        }
    }

    unsafe fn activate_table(&mut self, observer: Arc<CallObserver>) -> Result<(), Error> {
        if interceptor::is_published() {
            return Err(Error::Busy);
        }

        let base = match &self.resolver {
            Some(resolver) => unsafe { resolver.resolve() }?,
            None => {
                let resolver = unsafe { self.build_resolver() };
                debug!("lifecycle: strategies {:?}", resolver.strategy_names());
                unsafe { resolver.resolve() }?
            }
        };
        let table = unsafe { DispatchTable::from_raw(base, self.config.nr_slots) };

        let op = Arc::new(TargetOperation::with_trampoline(
            self.config.syscall_nr,
            observer,
        ));
        interceptor::publish(op.clone()).map_err(|_| Error::Busy)?;

        self.interceptor.bind(table);
        if let Err(e) = self.interceptor.install(&op) {
            self.interceptor.unbind();
            interceptor::retire();
            return Err(e.into());
        }
        self.target = Some(op);
        Ok(())
    }

    fn activate_probe(&mut self, observer: Arc<CallObserver>) -> Result<(), Error> {
        let host = self.probe_host.as_ref().ok_or(Error::NoProbeHost)?;
        let attachment = probe::register(host.as_ref(), &self.config.syscall_symbol, observer)?;
        self.attachment = Some(attachment);
        Ok(())
    }

    /// Anchor from the configuration, or from the anchor symbol's address.
    fn anchor(&self) -> Option<Anchor> {
        if let Some(anchor) = self.config.anchor {
            return Some(anchor);
        }
        #[cfg(feature = "symbols")]
        {
            if let Some(addr) = crate::symbols::lookup_addr(&self.config.anchor_symbol) {
                return Some(Anchor {
                    code: self.config.anchor_nr,
                    addr: addr as usize,
                });
            }
        }
        None
    }

    /// Strategies in descending reliability: operator address, symbol
    /// lookup, anchor scan.
    unsafe fn build_resolver(&self) -> Resolver {
        let config = &self.config;
        let anchor = self.anchor();
        let mut resolver = Resolver::new(&config.table_symbol);

        if let Some(anchor) = anchor {
            resolver = resolver.with_anchor(anchor);
        }
        if let Some(addr) = config.table_addr {
            resolver = resolver
                .with_strategy(StaticAddress::new(addr).expecting_symbol(&config.table_symbol));
        }
        #[cfg(feature = "symbols")]
        {
            resolver =
                resolver.with_strategy(resolver::SymbolLookup::kallsyms(&config.table_symbol));
        }
        if let (Some(anchor), Some(range)) = (anchor, config.scan_range.clone()) {
            resolver = resolver.with_strategy(unsafe { AnchorScan::new(range, anchor) });
        } else if config.scan_range.is_some() {
            warn!(
                "lifecycle: no address for {}, anchor scan disabled",
                config.anchor_symbol
            );
        }
        resolver
    }

    /// Restore (table mode) or deregister (probe mode), then wait out the
    /// settle delay.
    ///
    /// An interference warning does not block the transition. If write
    /// protection cannot be lifted the manager stays `Installed` and the call
    /// can be retried.
    pub fn deactivate(&mut self) -> Result<UninstallOutcome, Error> {
        if self.state != LifecycleState::Installed {
            return Err(Error::InvalidState(self.state));
        }
        self.state = LifecycleState::Uninstalling;

        let outcome = if let Some(op) = &self.target {
            match self.interceptor.uninstall(op) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("lifecycle: restore failed: {}", e);
                    self.state = LifecycleState::Installed;
                    return Err(e.into());
                }
            }
        } else {
            if let (Some(host), Some(attachment)) = (&self.probe_host, self.attachment.take()) {
                probe::deregister(host.as_ref(), attachment);
            }
            UninstallOutcome::Restored
        };

        debug!("lifecycle: settling for {} ms", self.config.settle_ms);
        platform::sleep_ms(self.config.settle_ms);

        if self.target.take().is_some() {
            interceptor::retire();
        }
        self.interceptor.unbind();
        self.state = LifecycleState::Uninitialized;

        if outcome.is_interference() {
            warn!("lifecycle: deactivated after interference");
        } else {
            info!("lifecycle: {} released", self.config.syscall_symbol);
        }
        Ok(outcome)
    }
}

// =============================================================================
// Module entry points
// =============================================================================

/// Protection backend shared with the module-level manager.
pub type SharedProtection = Arc<dyn ProtectionControl + Send + Sync>;

static MANAGER: Mutex<Option<InterceptManager<SharedProtection>>> = Mutex::new(None);

static PROBE_HOST: RwLock<Option<Arc<dyn InstrumentationHost>>> = RwLock::new(None);

static PROTECTION: RwLock<Option<SharedProtection>> = RwLock::new(None);

/// Register the host's instrumentation facility for probe mode.
pub fn register_probe_host(host: Arc<dyn InstrumentationHost>) {
    *PROBE_HOST.write() = Some(host);
}

/// Register the protection backend used by [`module_init`].
///
/// Without one, [`DefaultProtection`] for the target architecture is used.
pub fn register_protection(protection: SharedProtection) {
    *PROTECTION.write() = Some(protection);
}

/// Load-time entry point: parse `params` and activate.
///
/// # Safety
/// See [`InterceptManager::activate`].
pub unsafe fn module_init(params: &str) -> Result<(), Error> {
    let mut slot = MANAGER.lock();
    if let Some(manager) = slot.as_ref() {
        return Err(Error::InvalidState(manager.state()));
    }

    let config = InterceptConfig::parse(params)?;
    let protection = PROTECTION
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(DefaultProtection::default()));
    let mut manager = InterceptManager::new(config, protection);
    if let Some(host) = PROBE_HOST.read().clone() {
        manager = manager.with_probe_host(host);
    }

    unsafe { manager.activate() }?;
    *slot = Some(manager);
    Ok(())
}

/// Unload-time entry point.
pub fn module_exit() -> Result<UninstallOutcome, Error> {
    let mut slot = MANAGER.lock();
    let manager = slot
        .as_mut()
        .ok_or(Error::InvalidState(LifecycleState::Uninitialized))?;

    let outcome = manager.deactivate()?;
    *slot = None;
    Ok(outcome)
}

/// Status of the module-level interception, if one is live.
pub fn module_status() -> Option<Status> {
    MANAGER.lock().as_ref().map(|m| m.status())
}
