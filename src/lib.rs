//! System call interception for ArceOS kernels
//!
//! This crate locates the kernel's system call dispatch table, patches one of
//! its slots with a handler that logs the calls made by a chosen user, and
//! restores the slot on unload, warning when someone else re-patched it in
//! the meantime. Hosts that offer instrumentation points can use a read-only
//! probe instead of patching the table.
//!
//! # Features
//!
//! - `symbols` - Kernel symbol table lookup (default)
//! - `axhal` - Real time and sleep primitives from axhal
//! - `test-utils` - Mock protection backend and instrumentation host
//!
//! # Quick Start
//!
//! ```ignore
//! // Once during boot
//! syscall_steal::init_with_symbols(include_bytes!("../../kallsyms.bin"), stext, etext);
//! syscall_steal::platform::register_identity_hook(current_uid);
//!
//! // insmod syscall_steal uid=1000
//! unsafe { syscall_steal::module_init("uid=1000") }?;
//!
//! // rmmod syscall_steal
//! syscall_steal::module_exit()?;
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Platform Abstraction (for testing support)
// =============================================================================

pub mod platform;

// =============================================================================
// Symbols Module
// =============================================================================

#[cfg(feature = "symbols")]
pub mod symbols;

// =============================================================================
// Interception
// =============================================================================

pub mod config;
pub mod filter;
pub mod guard;
pub mod interceptor;
pub mod lifecycle;
pub mod probe;
pub mod resolver;
pub mod table;

#[cfg(all(target_arch = "aarch64", feature = "axhal"))]
pub mod page_table;

// Re-export key types for convenience
pub use config::{Anchor, InterceptConfig, InterceptMode};
pub use filter::{CallObserver, CallerContext, IdentityFilter};
pub use guard::{DefaultProtection, GuardController, ProtectionControl, SavedState};
pub use interceptor::{Interceptor, TargetOperation, UninstallOutcome};
pub use lifecycle::{
    Error as LifecycleError, InterceptManager, LifecycleState, SharedProtection, Status,
    module_exit, module_init, module_status, register_probe_host, register_protection,
};
pub use probe::{InstrumentationHost, ProbeAttachment, ProbeId};
pub use resolver::{AnchorScan, ResolutionStrategy, Resolver, StaticAddress, SymbolLookup};
pub use table::{DispatchTable, SyscallArgs, SyscallHandler};

#[cfg(any(test, feature = "test-utils", not(feature = "axhal")))]
pub use guard::MockProtection;

#[cfg(any(test, feature = "test-utils", not(feature = "axhal")))]
pub use probe::MockHost;

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the subsystem without a symbol table.
///
/// Only the operator-supplied address (`sym=`) and the anchor scan
/// (`anchor_addr=`, `scan_start=`, `scan_end=`) can locate the dispatch table
/// afterwards.
pub fn init() {
    info!("Initializing syscall-steal...");
    info!("  - protection backend: {}", core::any::type_name::<DefaultProtection>());

    #[cfg(feature = "symbols")]
    info!("  - symbols module enabled (call init_with_symbols for symbol lookup)");

    info!("syscall-steal initialization complete");
}

/// Initialize the subsystem with symbol table support.
///
/// # Arguments
/// * `kallsyms_data` - The kallsyms.bin binary blob (static lifetime required)
/// * `stext` - Start address of kernel text section (_stext)
/// * `etext` - End address of kernel text section (_etext)
#[cfg(feature = "symbols")]
pub fn init_with_symbols(kallsyms_data: &'static [u8], stext: u64, etext: u64) {
    info!("Initializing syscall-steal with symbol table...");
    info!(
        "  - kallsyms data at {:p}, len={}",
        kallsyms_data.as_ptr(),
        kallsyms_data.len()
    );

    // The ksym library expects the blob to be page-aligned in memory.
    let ptr = kallsyms_data.as_ptr() as usize;
    if ptr % 4096 != 0 {
        warn!("  - kallsyms data is not page-aligned (ptr % 4096 = {})", ptr % 4096);
    }

    match symbols::init(kallsyms_data, stext, etext) {
        Ok(()) => info!("  - text range: {:#x} - {:#x}", stext, etext),
        Err(e) => error!("  - failed to load symbol table: {}", e),
    }

    info!("syscall-steal initialization complete");
}
