//! Integration tests for dispatch table resolution.
//!
//! Tables are heap words leaked for the lifetime of the test binary.

use core::sync::atomic::{AtomicUsize, Ordering};

use syscall_steal::resolver::{self, Error};
use syscall_steal::{Anchor, AnchorScan, ResolutionStrategy, Resolver, StaticAddress, SymbolLookup};

const CLOSE_HANDLER: usize = 0xffff_8000_0000_1230;

/// A table with slot `i` holding `0x1000 + i` and slot 3 holding the anchor,
/// preceded by `padding` unrelated words.
fn leak_table(padding: usize, n: usize) -> (&'static [AtomicUsize], usize) {
    let words: Vec<AtomicUsize> = (0..padding + n)
        .map(|i| {
            if i == padding + 3 {
                AtomicUsize::new(CLOSE_HANDLER)
            } else if i >= padding {
                AtomicUsize::new(0x1000 + i - padding)
            } else {
                AtomicUsize::new(0x5a5a)
            }
        })
        .collect();
    let words: &'static [AtomicUsize] = Box::leak(words.into_boxed_slice());
    let base = words.as_ptr() as usize + padding * size_of::<usize>();
    (words, base)
}

fn anchor() -> Anchor {
    Anchor {
        code: 3,
        addr: CLOSE_HANDLER,
    }
}

fn snapshot(words: &[AtomicUsize]) -> Vec<usize> {
    words.iter().map(|w| w.load(Ordering::SeqCst)).collect()
}

// =============================================================================
// Strategy Tests
// =============================================================================

#[test]
fn test_static_address_is_validated_by_anchor() {
    let (_words, base) = leak_table(0, 8);
    let resolver = Resolver::new("sys_call_table")
        .with_anchor(anchor())
        .with_strategy(StaticAddress::new(base));

    assert_eq!(unsafe { resolver.resolve() }, Ok(base));
}

#[test]
fn test_wrong_static_address_falls_through_to_lookup() {
    static BASE: AtomicUsize = AtomicUsize::new(0);
    fn lookup(name: &str) -> Option<u64> {
        (name == "sys_call_table").then(|| BASE.load(Ordering::SeqCst) as u64)
    }

    let (_words, base) = leak_table(2, 8);
    BASE.store(base, Ordering::SeqCst);

    // One word too low: the anchor slot of this candidate holds slot 2's value.
    let resolver = Resolver::new("sys_call_table")
        .with_anchor(anchor())
        .with_strategy(StaticAddress::new(base - size_of::<usize>()))
        .with_strategy(SymbolLookup::new("sys_call_table", lookup));

    assert_eq!(
        resolver.strategy_names(),
        vec!["static-address", "symbol-lookup"]
    );
    assert_eq!(unsafe { resolver.resolve() }, Ok(base));
}

#[test]
fn test_anchor_scan_finds_table_in_range() {
    let (words, base) = leak_table(5, 8);
    let start = words.as_ptr() as usize;
    let end = start + words.len() * size_of::<usize>();

    let scan = unsafe { AnchorScan::new(start..end, anchor()) };
    assert_eq!(scan.candidate(), Some(base));

    let resolver = Resolver::new("sys_call_table")
        .with_anchor(anchor())
        .with_strategy(scan);
    assert_eq!(unsafe { resolver.resolve() }, Ok(base));
}

#[test]
fn test_anchor_scan_without_match() {
    let (words, _base) = leak_table(0, 8);
    let start = words.as_ptr() as usize;
    let end = start + words.len() * size_of::<usize>();

    let scan = unsafe {
        AnchorScan::new(
            start..end,
            Anchor {
                code: 3,
                addr: 0xdead_beef,
            },
        )
    };
    assert_eq!(scan.candidate(), None);
}

#[test]
fn test_misaligned_candidate_is_rejected() {
    let (_words, base) = leak_table(0, 8);
    let resolver = Resolver::new("sys_call_table").with_strategy(StaticAddress::new(base + 1));

    assert!(matches!(
        unsafe { resolver.resolve() },
        Err(Error::Exhausted { tried: 1, .. })
    ));
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_exhausted_resolution_mutates_nothing() {
    fn missing(_name: &str) -> Option<u64> {
        None
    }

    let (words, base) = leak_table(0, 8);
    let before = snapshot(words);
    let resolver = Resolver::new("sys_call_table")
        .with_anchor(Anchor {
            code: 3,
            addr: 0x4242,
        })
        .with_strategy(StaticAddress::new(base))
        .with_strategy(SymbolLookup::new("sys_call_table", missing));

    let err = unsafe { resolver.resolve() }.unwrap_err();
    assert_eq!(
        err,
        resolver::Error::Exhausted {
            target: "sys_call_table".into(),
            tried: 2
        }
    );
    assert_eq!(snapshot(words), before);
}

#[test]
fn test_error_display_names_target() {
    let err = Error::Exhausted {
        target: "sys_call_table".into(),
        tried: 3,
    };
    assert_eq!(
        err.to_string(),
        "Could not resolve sys_call_table (3 strategies exhausted)"
    );
}
