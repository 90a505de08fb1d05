//! Validation errors for RPC argument parsing.
//!
//! This is distinct from the daemon's full `DaemonError` taxonomy (§7,
//! implemented in the `usbmuxd` crate): this crate only validates the shape
//! of wire arguments before they reach the core.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("vendor/product id out of range: {0:#x}")]
    IdOutOfRange(u32),

    #[error("unparseable rule command: {0}")]
    UnknownCommand(String),

    #[error("rule position out of range: {0}")]
    PositionOutOfRange(u32),

    #[error("malformed hex value: {0}")]
    BadHex(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Parses a `0x`-prefixed, 1-4 digit hex string into a `u16`, as required for
/// vendor/product ids throughout §6.1 and §6.4.
pub fn parse_hex_u16(s: &str) -> Result<u16> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| ProtocolError::BadHex(s.to_string()))?;
    if digits.is_empty() || digits.len() > 4 {
        return Err(ProtocolError::BadHex(s.to_string()));
    }
    u16::from_str_radix(digits, 16).map_err(|_| ProtocolError::BadHex(s.to_string()))
}
