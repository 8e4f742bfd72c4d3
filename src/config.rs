//! Operator configuration.
//!
//! Parameters are given the way module parameters are passed at load time:
//! a whitespace separated list of `key=value` pairs, e.g.
//!
//! ```text
//! uid=1000 sym=0xffffffff82000300 syscall_sym=__x64_sys_openat
//! ```
//!
//! Without kallsyms the table can still be found by scanning, given the
//! anchor handler's address and the range to search:
//!
//! ```text
//! uid=1000 anchor_addr=0xffffffff81234560 scan_start=0xffffffff82000000 scan_end=0xffffffff83000000
//! ```

use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;
use core::ops::Range;

/// System call numbers of the default target and anchor operations.
#[cfg(target_arch = "aarch64")]
pub mod nr {
    pub const OPENAT: usize = 56;
    pub const CLOSE: usize = 57;
    pub const OPENAT_SYM: &str = "__arm64_sys_openat";
    pub const CLOSE_SYM: &str = "__arm64_sys_close";
}

#[cfg(not(target_arch = "aarch64"))]
pub mod nr {
    pub const OPENAT: usize = 257;
    pub const CLOSE: usize = 3;
    pub const OPENAT_SYM: &str = "__x64_sys_openat";
    pub const CLOSE_SYM: &str = "__x64_sys_close";
}

/// Default symbol name of the dispatch table.
pub const DEFAULT_TABLE_SYMBOL: &str = "sys_call_table";

/// Default number of slots assumed for the dispatch table.
pub const DEFAULT_NR_SLOTS: usize = 512;

/// Default settle delay after restoring the slot.
pub const DEFAULT_SETTLE_MS: u64 = 2000;

/// How the interception is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptMode {
    /// Patch one slot of the dispatch table.
    Table,
    /// Register a read-only pre-call probe on the operation's symbol.
    Probe,
}

impl InterceptMode {
    /// Short label for display.
    pub fn label(&self) -> &'static str {
        match self {
            InterceptMode::Table => "table",
            InterceptMode::Probe => "probe",
        }
    }
}

/// Reference used to validate a table candidate: the slot `code` of the real
/// table holds `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    /// Slot index of the anchor operation.
    pub code: usize,
    /// Address of the anchor operation's handler.
    pub addr: usize,
}

/// Error types for parameter parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Parameter name not recognized.
    UnknownKey(String),
    /// Parameter given without `=value`.
    MissingValue(String),
    /// Parameter value could not be parsed.
    InvalidValue { key: String, value: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(key) => write!(f, "Unknown parameter: {}", key),
            Self::MissingValue(key) => write!(f, "Parameter has no value: {}", key),
            Self::InvalidValue { key, value } => {
                write!(f, "Invalid value for parameter {}: {}", key, value)
            }
        }
    }
}

impl core::error::Error for Error {}

/// Interception configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptConfig {
    /// Installation path.
    pub mode: InterceptMode,
    /// Identity to log; `None` matches nobody.
    pub uid: Option<u32>,
    /// Operator-supplied table base, bypassing automatic lookup.
    pub table_addr: Option<usize>,
    /// Symbol name of the table.
    pub table_symbol: String,
    /// Symbol of the intercepted operation. Also the name used in log records.
    pub syscall_symbol: String,
    /// Slot index of the intercepted operation.
    pub syscall_nr: usize,
    /// Number of slots in the table.
    pub nr_slots: usize,
    /// Symbol of the anchor operation's handler.
    pub anchor_symbol: String,
    /// Slot index of the anchor operation.
    pub anchor_nr: usize,
    /// Explicit anchor, overriding lookup of `anchor_symbol`.
    pub anchor: Option<Anchor>,
    /// Address range searched by the anchor scan.
    pub scan_range: Option<Range<usize>>,
    /// Wait after restoration before teardown completes.
    pub settle_ms: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            mode: InterceptMode::Table,
            uid: None,
            table_addr: None,
            table_symbol: DEFAULT_TABLE_SYMBOL.to_string(),
            syscall_symbol: nr::OPENAT_SYM.to_string(),
            syscall_nr: nr::OPENAT,
            nr_slots: DEFAULT_NR_SLOTS,
            anchor_symbol: nr::CLOSE_SYM.to_string(),
            anchor_nr: nr::CLOSE,
            anchor: None,
            scan_range: None,
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }
}

impl InterceptConfig {
    /// Parse a module parameter string on top of the defaults.
    pub fn parse(params: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        for param in params.split_whitespace() {
            config.apply(param)?;
        }
        if let Some(range) = &config.scan_range {
            if range.start >= range.end {
                return Err(Error::InvalidValue {
                    key: "scan_end".to_string(),
                    value: format!("{:#x}", range.end),
                });
            }
        }
        Ok(config)
    }

    /// Apply one `key=value` parameter.
    pub fn apply(&mut self, param: &str) -> Result<(), Error> {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| Error::MissingValue(param.to_string()))?;
        let invalid = || Error::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "mode" => {
                self.mode = match value {
                    "table" => InterceptMode::Table,
                    "probe" => InterceptMode::Probe,
                    _ => return Err(invalid()),
                }
            }
            "uid" => {
                let uid: i64 = value.parse().map_err(|_| invalid())?;
                self.uid = match uid {
                    -1 => None,
                    0..=0xffff_fffe => Some(uid as u32),
                    _ => return Err(invalid()),
                };
            }
            "sym" => {
                let addr = parse_usize(value).ok_or_else(invalid)?;
                self.table_addr = (addr != 0).then_some(addr);
            }
            "table_sym" => self.table_symbol = non_empty(value).ok_or_else(invalid)?,
            "syscall_sym" => self.syscall_symbol = non_empty(value).ok_or_else(invalid)?,
            "anchor_sym" => self.anchor_symbol = non_empty(value).ok_or_else(invalid)?,
            "nr" => self.syscall_nr = parse_usize(value).ok_or_else(invalid)?,
            "anchor_nr" => {
                self.anchor_nr = parse_usize(value).ok_or_else(invalid)?;
                if let Some(anchor) = &mut self.anchor {
                    anchor.code = self.anchor_nr;
                }
            }
            "anchor_addr" => {
                let addr = parse_usize(value).ok_or_else(invalid)?;
                self.anchor = (addr != 0).then_some(Anchor {
                    code: self.anchor_nr,
                    addr,
                });
            }
            "scan_start" => {
                let start = parse_usize(value).ok_or_else(invalid)?;
                let end = self.scan_range.as_ref().map_or(0, |r| r.end);
                self.scan_range = Some(start..end);
            }
            "scan_end" => {
                let end = parse_usize(value).ok_or_else(invalid)?;
                let start = self.scan_range.as_ref().map_or(0, |r| r.start);
                self.scan_range = Some(start..end);
            }
            "nr_slots" => {
                self.nr_slots = parse_usize(value)
                    .filter(|n| *n > 0)
                    .ok_or_else(invalid)?
            }
            "settle_ms" => self.settle_ms = value.parse().map_err(|_| invalid())?,
            _ => return Err(Error::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn with_mode(mut self, mode: InterceptMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_table_addr(mut self, addr: usize) -> Self {
        self.table_addr = Some(addr);
        self
    }

    pub fn with_syscall(mut self, symbol: &str, nr: usize) -> Self {
        self.syscall_symbol = symbol.to_string();
        self.syscall_nr = nr;
        self
    }

    pub fn with_nr_slots(mut self, nr_slots: usize) -> Self {
        self.nr_slots = nr_slots;
        self
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn with_scan_range(mut self, range: Range<usize>) -> Self {
        self.scan_range = Some(range);
        self
    }

    pub fn with_settle_ms(mut self, ms: u64) -> Self {
        self.settle_ms = ms;
        self
    }
}

fn parse_usize(value: &str) -> Option<usize> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_nobody() {
        let config = InterceptConfig::parse("").unwrap();
        assert_eq!(config.mode, InterceptMode::Table);
        assert_eq!(config.uid, None);
        assert_eq!(config.table_addr, None);
        assert_eq!(config.syscall_nr, nr::OPENAT);
        assert_eq!(config.settle_ms, DEFAULT_SETTLE_MS);
    }

    #[test]
    fn test_parse_module_params() {
        let config = InterceptConfig::parse(
            "uid=1000 sym=0xffffffff82000300 syscall_sym=open-like nr=2 settle_ms=10 mode=probe",
        )
        .unwrap();

        assert_eq!(config.uid, Some(1000));
        assert_eq!(config.table_addr, Some(0xffff_ffff_8200_0300));
        assert_eq!(config.syscall_symbol, "open-like");
        assert_eq!(config.syscall_nr, 2);
        assert_eq!(config.settle_ms, 10);
        assert_eq!(config.mode, InterceptMode::Probe);
    }

    #[test]
    fn test_uid_minus_one_and_zero_sym_mean_unset() {
        let config = InterceptConfig::parse("uid=-1 sym=0").unwrap();
        assert_eq!(config.uid, None);
        assert_eq!(config.table_addr, None);
    }

    #[test]
    fn test_scan_params_in_any_order() {
        let config = InterceptConfig::parse(
            "scan_end=0x3000 anchor_addr=0xffffffff81234560 scan_start=0x1000 anchor_nr=7",
        )
        .unwrap();

        assert_eq!(config.scan_range, Some(0x1000..0x3000));
        assert_eq!(
            config.anchor,
            Some(Anchor {
                code: 7,
                addr: 0xffff_ffff_8123_4560
            })
        );
        assert_eq!(config.anchor_nr, 7);
    }

    #[test]
    fn test_anchor_addr_takes_default_slot() {
        let config = InterceptConfig::parse("anchor_addr=0x4000").unwrap();
        assert_eq!(
            config.anchor,
            Some(Anchor {
                code: nr::CLOSE,
                addr: 0x4000
            })
        );
        assert_eq!(InterceptConfig::parse("anchor_addr=0").unwrap().anchor, None);
    }

    #[test]
    fn test_scan_range_must_be_ordered() {
        for params in ["scan_start=0x2000 scan_end=0x1000", "scan_start=0x2000", "scan_end=0"] {
            assert!(
                matches!(
                    InterceptConfig::parse(params),
                    Err(Error::InvalidValue { ref key, .. }) if key == "scan_end"
                ),
                "{params}"
            );
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            InterceptConfig::parse("verbose=1"),
            Err(Error::UnknownKey("verbose".to_string()))
        );
        assert_eq!(
            InterceptConfig::parse("uid"),
            Err(Error::MissingValue("uid".to_string()))
        );
        assert!(matches!(
            InterceptConfig::parse("uid=abc"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            InterceptConfig::parse("mode=inline"),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            InterceptConfig::parse("nr_slots=0"),
            Err(Error::InvalidValue { .. })
        ));
    }
}
