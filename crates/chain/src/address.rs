//! Canonical address handling.
//!
//! The EIP-55 checksummed hex string is the one canonical form used as a key
//! anywhere in the pipeline.

use alloy::primitives::Address;

use crate::source::ChainError;

/// Parse a hex address, accepting any letter case and a 32-byte zero-padded topic form.
pub fn parse_address(input: &str) -> Result<Address, ChainError> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .ok_or_else(|| ChainError::InvalidAddress(input.to_string()))?;

    let body = match hex.len() {
        40 => hex,
        64 if hex.as_bytes()[..24].iter().all(|b| *b == b'0') => &hex[24..],
        _ => return Err(ChainError::InvalidAddress(input.to_string())),
    };

    let bytes = hex::decode(body).map_err(|_| ChainError::InvalidAddress(input.to_string()))?;
    Ok(Address::from_slice(&bytes))
}

/// Canonical string form of an address.
pub fn to_canonical(address: Address) -> String {
    address.to_checksum(None)
}

/// Canonicalize a hex address string.
pub fn canonical(input: &str) -> Result<String, ChainError> {
    parse_address(input).map(to_canonical)
}

pub fn is_valid(input: &str) -> bool {
    parse_address(input).is_ok()
}

/// Heuristic used on parameter values whose key gives no hint.
pub fn looks_like_address(value: &str) -> bool {
    value.len() >= 34 && value.starts_with("0x") && is_valid(value)
}

/// `0x1234...abcd` display form.
pub fn shorten(address: &str) -> String {
    if address.len() <= 12 || !address.is_ascii() {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}
