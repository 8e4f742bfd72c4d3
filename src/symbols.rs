//! Kernel symbol table management.
//!
//! Backs the symbol-lookup resolution strategy, anchor discovery and the
//! validation of operator-supplied table addresses.

use alloc::string::String;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use ksym::KallsymsMapped;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

struct GlobalSymbolTable(UnsafeCell<Option<KallsymsMapped<'static>>>);
unsafe impl Sync for GlobalSymbolTable {}
static SYMBOL_TABLE: GlobalSymbolTable = GlobalSymbolTable(UnsafeCell::new(None));

const KSYM_NAME_LEN: usize = 1024;

/// Error types for symbol operations.
#[derive(Debug)]
pub enum Error {
    /// Symbol table has already been initialized.
    AlreadyInitialized,
    /// Failed to parse the symbol table blob.
    ParseError(&'static str),
    /// Symbol table has not been initialized yet.
    NotInitialized,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "Symbol table already initialized"),
            Self::ParseError(e) => write!(f, "Failed to parse symbol table: {}", e),
            Self::NotInitialized => write!(f, "Symbol table not initialized"),
        }
    }
}

impl core::error::Error for Error {}

/// Initialize the kernel symbol table from a kallsyms binary blob.
///
/// # Arguments
/// * `data` - The binary blob containing compressed symbol data
/// * `stext` - Start address of kernel text section
/// * `etext` - End address of kernel text section
///
/// Must be called before any activation that relies on symbol lookup. Not
/// safe to call concurrently with lookups.
pub fn init(data: &'static [u8], stext: u64, etext: u64) -> Result<(), Error> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyInitialized);
    }

    let table = match KallsymsMapped::from_blob(data, stext, etext) {
        Ok(table) => table,
        Err(e) => {
            INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::ParseError(e));
        }
    };

    unsafe {
        *SYMBOL_TABLE.0.get() = Some(table);
    }

    log::info!("symbols: loaded kallsyms ({} bytes)", data.len());
    Ok(())
}

/// Check if the symbol table has been initialized.
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

fn table() -> Option<&'static KallsymsMapped<'static>> {
    if !is_initialized() {
        return None;
    }
    unsafe { (*SYMBOL_TABLE.0.get()).as_ref() }
}

/// Lookup a symbol by address.
///
/// Returns (name, size, offset, type) if found.
pub fn lookup_symbol(addr: u64) -> Option<(String, u64, u64, char)> {
    let table = table()?;
    let mut name_buf = [0u8; KSYM_NAME_LEN];

    table
        .lookup_address(addr, &mut name_buf)
        .map(|(name, size, offset, ty)| (String::from(name), size, offset, ty))
}

/// Lookup an address by symbol name.
pub fn lookup_addr(name: &str) -> Option<u64> {
    table()?.lookup_name(name)
}

/// Check whether `addr` is exactly the start of symbol `name`.
///
/// Returns `None` when the symbol table is not loaded and the question cannot
/// be answered.
pub fn is_symbol_start(addr: u64, name: &str) -> Option<bool> {
    table()?;
    Some(matches!(
        lookup_symbol(addr),
        Some((sym, _, 0, _)) if sym == name
    ))
}
