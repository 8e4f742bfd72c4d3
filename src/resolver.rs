//! Dispatch table discovery.
//!
//! The table's address is not reliably known at build time. A [`Resolver`]
//! holds a ranked list of [`ResolutionStrategy`] objects and tries them in
//! order:
//!
//! 1. [`StaticAddress`] - an address registered by the operator
//! 2. [`SymbolLookup`] - symbol table lookup by name
//! 3. [`AnchorScan`] - a bounded scan for a table whose anchor slot holds a
//!    known handler address
//!
//! Every candidate is checked against the [`Anchor`] (when one is known)
//! before it is accepted. Resolution never writes anywhere.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use crate::config::Anchor;
use crate::table::{self, SLOT_SIZE};

/// Symbol name → address lookup function.
pub type LookupFn = fn(&str) -> Option<u64>;

/// Error types for table resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No strategy produced a validated table address.
    Exhausted {
        /// Symbol name of the table being resolved.
        target: String,
        /// Number of strategies tried.
        tried: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { target, tried } => write!(
                f,
                "Could not resolve {} ({} strategies exhausted)",
                target, tried
            ),
        }
    }
}

impl core::error::Error for Error {}

/// A procedure producing one candidate table base address.
pub trait ResolutionStrategy: Send + Sync {
    /// Short label for logging.
    fn name(&self) -> &'static str;

    /// Produce a candidate, or `None` if this strategy does not apply.
    fn candidate(&self) -> Option<usize>;
}

/// Check that slot `anchor.code` of a table at `base` holds `anchor.addr`.
///
/// Null and misaligned bases are rejected without touching memory.
///
/// # Safety
/// For an aligned non-null `base`, the anchor slot must be readable.
pub unsafe fn anchor_matches(base: usize, anchor: &Anchor) -> bool {
    if base == 0 || base % SLOT_SIZE != 0 {
        return false;
    }
    let Some(slot) = anchor
        .code
        .checked_mul(SLOT_SIZE)
        .and_then(|off| base.checked_add(off))
    else {
        return false;
    };
    unsafe { table::read_word(slot) == anchor.addr }
}

// =============================================================================
// Strategies
// =============================================================================

/// An operator-supplied address.
///
/// When the symbol table is loaded the address must be the start of the
/// expected table symbol.
pub struct StaticAddress {
    addr: usize,
    expected_symbol: Option<String>,
}

impl StaticAddress {
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            expected_symbol: None,
        }
    }

    /// Require the address to symbolize to `name`.
    pub fn expecting_symbol(mut self, name: &str) -> Self {
        self.expected_symbol = Some(String::from(name));
        self
    }
}

impl ResolutionStrategy for StaticAddress {
    fn name(&self) -> &'static str {
        "static-address"
    }

    fn candidate(&self) -> Option<usize> {
        #[cfg(feature = "symbols")]
        {
            if let Some(expected) = &self.expected_symbol {
                if crate::symbols::is_symbol_start(self.addr as u64, expected) == Some(false) {
                    log::warn!(
                        "resolver: {:#x} is not the start of {}, ignoring sym parameter",
                        self.addr,
                        expected
                    );
                    return None;
                }
            }
        }
        #[cfg(not(feature = "symbols"))]
        let _ = &self.expected_symbol;

        Some(self.addr)
    }
}

/// Symbol table lookup by name.
pub struct SymbolLookup {
    symbol: String,
    lookup: LookupFn,
}

impl SymbolLookup {
    pub fn new(symbol: &str, lookup: LookupFn) -> Self {
        Self {
            symbol: String::from(symbol),
            lookup,
        }
    }

    /// Lookup through the loaded kallsyms table.
    #[cfg(feature = "symbols")]
    pub fn kallsyms(symbol: &str) -> Self {
        Self::new(symbol, crate::symbols::lookup_addr)
    }
}

impl ResolutionStrategy for SymbolLookup {
    fn name(&self) -> &'static str {
        "symbol-lookup"
    }

    fn candidate(&self) -> Option<usize> {
        (self.lookup)(&self.symbol).map(|addr| addr as usize)
    }
}

/// Word-by-word scan of a bounded range for a base whose anchor slot holds
/// the anchor handler.
pub struct AnchorScan {
    range: Range<usize>,
    anchor: Anchor,
}

impl AnchorScan {
    /// Scan `range` for a table matching `anchor`.
    ///
    /// # Safety
    /// Every word in `range` must be readable.
    pub unsafe fn new(range: Range<usize>, anchor: Anchor) -> Self {
        Self { range, anchor }
    }
}

impl ResolutionStrategy for AnchorScan {
    fn name(&self) -> &'static str {
        "anchor-scan"
    }

    fn candidate(&self) -> Option<usize> {
        let anchor_off = self.anchor.code.checked_mul(SLOT_SIZE)?;
        let start = self.range.start.checked_add(SLOT_SIZE - 1)? & !(SLOT_SIZE - 1);
        // The anchor slot of the last candidate must still lie inside the range.
        let last = self
            .range
            .end
            .checked_sub(anchor_off)?
            .checked_sub(SLOT_SIZE)?;

        let mut base = start;
        while base <= last {
            // SAFETY: `base + anchor_off` lies inside the range given to `new`.
            if unsafe { anchor_matches(base, &self.anchor) } {
                log::debug!("resolver: anchor match at {:#x}", base);
                return Some(base);
            }
            base += SLOT_SIZE;
        }
        None
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Ranked strategies plus the validation anchor.
pub struct Resolver {
    target: String,
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    anchor: Option<Anchor>,
}

impl Resolver {
    /// An empty resolver for the table named `target`.
    pub fn new(target: &str) -> Self {
        Self {
            target: String::from(target),
            strategies: Vec::new(),
            anchor: None,
        }
    }

    /// Validate every candidate against `anchor`.
    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Append a strategy at the lowest priority so far.
    pub fn with_strategy(mut self, strategy: impl ResolutionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Strategy labels in the order they are tried.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn anchor(&self) -> Option<Anchor> {
        self.anchor
    }

    /// Try every strategy in order and return the first validated address.
    ///
    /// # Safety
    /// Candidates produced by the strategies must have a readable anchor slot
    /// whenever they are aligned and non-null.
    pub unsafe fn resolve(&self) -> Result<usize, Error> {
        for strategy in &self.strategies {
            let Some(addr) = strategy.candidate() else {
                log::debug!("resolver: {} produced no candidate", strategy.name());
                continue;
            };

            let valid = match &self.anchor {
                Some(anchor) => unsafe { anchor_matches(addr, anchor) },
                None => addr != 0 && addr % SLOT_SIZE == 0,
            };

            if valid {
                log::info!(
                    "resolver: {} found at {:#x} via {}",
                    self.target,
                    addr,
                    strategy.name()
                );
                return Ok(addr);
            }
            log::debug!(
                "resolver: {} candidate {:#x} failed validation",
                strategy.name(),
                addr
            );
        }

        log::warn!(
            "resolver: {} not found after {} strategies",
            self.target,
            self.strategies.len()
        );
        Err(Error::Exhausted {
            target: self.target.clone(),
            tried: self.strategies.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;

    fn leak_words(words: Vec<usize>) -> &'static [usize] {
        Box::leak(words.into_boxed_slice())
    }

    #[test]
    fn test_anchor_rejects_null_and_misaligned() {
        let anchor = Anchor { code: 0, addr: 7 };
        assert!(!unsafe { anchor_matches(0, &anchor) });
        assert!(!unsafe { anchor_matches(3, &anchor) });
    }

    #[test]
    fn test_scan_stays_inside_range() {
        // The anchor value sits at index 1, so a table with anchor code 2 would
        // have to start one word before the range.
        let words = leak_words(vec![0, 0xabc, 0, 0]);
        let start = words.as_ptr() as usize;
        let scan = unsafe {
            AnchorScan::new(
                start + SLOT_SIZE..start + 4 * SLOT_SIZE,
                Anchor { code: 2, addr: 0xabc },
            )
        };
        assert_eq!(scan.candidate(), None);
    }

    #[test]
    fn test_empty_resolver_is_exhausted() {
        let resolver = Resolver::new("sys_call_table");
        assert_eq!(
            unsafe { resolver.resolve() },
            Err(Error::Exhausted {
                target: "sys_call_table".into(),
                tried: 0
            })
        );
    }
}
