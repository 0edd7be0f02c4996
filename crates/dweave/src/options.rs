//! Session tunables.
//!
//! Options are set by name with an optional size suffix (`k`, `m`,
//! `g`), the way a driver passes `-x name=value` through. Unknown names
//! and malformed values are compile-class errors surfaced before
//! anything touches the kernel.

use dweave_dif::dis::Listings;
use thiserror::Error;

/// A bad option name or value.
#[derive(Debug, Error)]
pub enum OptionError {
    /// The option does not exist.
    #[error("unknown option '{0}'")]
    Unknown(String),
    /// The value does not parse for this option.
    #[error("invalid value '{value}' for option '{name}'")]
    BadValue {
        /// Option name.
        name: String,
        /// Offending value.
        value: String,
    },
}

/// The session tunables and their defaults.
#[derive(Clone, Debug)]
pub struct Options {
    /// Per-CPU ring-buffer data size in bytes; a power of two.
    pub bufsize: usize,
    /// Number of speculation slots.
    pub nspec: u32,
    /// Entry budget for the dynamic-variable maps.
    pub dynvar_entries: u32,
    /// Entry budget for aggregation storage.
    pub agg_entries: u32,
    /// Cap on the session string table, in bytes.
    pub strsize: usize,
    /// Disassembler listings to produce.
    pub listings: Listings,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            bufsize: 64 * 1024,
            nspec: 16,
            dynvar_entries: 4096,
            agg_entries: 4096,
            strsize: 64 * 1024,
            listings: Listings::empty(),
        }
    }
}

impl Options {
    /// Set one option by name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), OptionError> {
        let bad = || OptionError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "bufsize" => {
                let n = parse_size(value).ok_or_else(bad)?;
                if !n.is_power_of_two() {
                    return Err(bad());
                }
                self.bufsize = n;
            }
            "nspec" => self.nspec = value.parse().map_err(|_| bad())?,
            "dynvarsize" => {
                self.dynvar_entries = (parse_size(value).ok_or_else(bad)? / 16) as u32
            }
            "aggsize" => self.agg_entries = (parse_size(value).ok_or_else(bad)? / 16) as u32,
            "strsize" => self.strsize = parse_size(value).ok_or_else(bad)?,
            "disasm" => {
                let bits: u8 = value.parse().map_err(|_| bad())?;
                self.listings = Listings::from_bits_truncate(bits);
            }
            _ => return Err(OptionError::Unknown(name.to_string())),
        }
        Ok(())
    }
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, mult) = match text.char_indices().last()? {
        (i, 'k') | (i, 'K') => (&text[..i], 1024),
        (i, 'm') | (i, 'M') => (&text[..i], 1024 * 1024),
        (i, 'g') | (i, 'G') => (&text[..i], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("4k"), Some(4096));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("x"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn set_by_name() {
        let mut opts = Options::default();
        opts.set("bufsize", "128k").unwrap();
        assert_eq!(opts.bufsize, 128 * 1024);
        opts.set("nspec", "4").unwrap();
        assert_eq!(opts.nspec, 4);
        assert!(opts.set("bufsize", "100").is_err()); // not a power of two
        assert!(opts.set("nosuch", "1").is_err());
    }
}
