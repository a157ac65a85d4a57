//! Address rendering and parsing.
//!
//! Addresses whose high dword is zero print as eight hex digits; anything
//! else prints as two eight-digit groups joined by a backtick, the way
//! kernel debuggers show 64-bit values.

use std::fmt;

/// Display wrapper for a target address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let high = (self.0 >> 32) as u32;
        let low = self.0 as u32;
        if high == 0 {
            write!(f, "{:08x}", low)
        } else {
            write!(f, "{:08x}`{:08x}", high, low)
        }
    }
}

/// Parse a hex address: optional `0x`, optional backtick separator.
pub fn parse_address(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let digits: String = digits.chars().filter(|&c| c != '`').collect();
    if digits.is_empty() || digits.len() > 16 {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}
