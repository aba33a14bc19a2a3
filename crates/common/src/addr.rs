//! IPv6 prefix math
//!
//! Pure byte-level operations on IPv6 prefixes: CIDR parsing, mask-length
//! checks, entropy/user-id injection at fixed offsets, and /64
//! re-serialization. No I/O and no hidden state.

use crate::{Error, Result};
use ipnetwork::Ipv6Network;
use std::net::Ipv6Addr;

/// Parse an IPv6 CIDR string into its masked network bytes and prefix length
pub fn parse_prefix(text: &str) -> Result<([u8; 16], u8)> {
    let net: Ipv6Network = text
        .parse()
        .map_err(|_| Error::InvalidPrefix(text.to_string()))?;
    Ok((net.network().octets(), net.prefix()))
}

/// Fail unless the declared mask length matches what the caller requires
pub fn require_mask_len(got: u8, expected: u8) -> Result<()> {
    if got != expected {
        return Err(Error::WrongMaskLength { expected, got });
    }
    Ok(())
}

/// Append a default mask when the pool is configured as a bare address
fn ensure_mask(text: &str, default_len: u8) -> String {
    if text.contains('/') {
        text.to_string()
    } else {
        format!("{}/{}", text, default_len)
    }
}

/// Remove the mask suffix from a CIDR string
pub fn strip_mask(prefix: &str) -> &str {
    prefix.split('/').next().unwrap_or(prefix)
}

/// Derive a delegated /64 from a /44 pool.
///
/// The entropy nibble lands in the low nibble of byte 5 (the high nibble is
/// pool address space and preserved); the 16-bit user id fills bytes 6-7.
pub fn delegated_from_pool(base: &str, entropy_nibble: u8, user_id: u16) -> Result<String> {
    let base = ensure_mask(base, 44);
    let (mut octets, len) = parse_prefix(&base)?;
    require_mask_len(len, 44)?;

    octets[5] = (octets[5] & 0xf0) | (entropy_nibble & 0x0f);
    octets[6] = (user_id >> 8) as u8;
    octets[7] = (user_id & 0xff) as u8;
    for b in &mut octets[8..] {
        *b = 0;
    }

    Ok(format!("{}/64", Ipv6Addr::from(octets)))
}

/// Derive the deterministic "third" /64 from a /48 pool.
///
/// The user id is the whole fourth group, so each (pool, user) pair maps to
/// exactly one address.
pub fn third_from_pool(base: &str, user_id: u16) -> Result<String> {
    let base = ensure_mask(base, 48);
    let (mut octets, len) = parse_prefix(&base)?;
    require_mask_len(len, 48)?;

    octets[6] = (user_id >> 8) as u8;
    octets[7] = (user_id & 0xff) as u8;
    for b in &mut octets[8..] {
        *b = 0;
    }

    Ok(format!("{}/64", Ipv6Addr::from(octets)))
}

/// Derive the point-to-point endpoint pair from the ULA base.
///
/// The 16-bit sequence fills bytes 6-7; local and remote are the `::1` and
/// `::2` hosts of the resulting /64.
pub fn endpoint_pair(ula_base: &str, seq: u16) -> Result<(String, String)> {
    let base = ensure_mask(ula_base, 64);
    let (mut octets, _) = parse_prefix(&base)?;

    octets[6] = (seq >> 8) as u8;
    octets[7] = (seq & 0xff) as u8;
    for b in &mut octets[8..] {
        *b = 0;
    }

    let mut local = octets;
    local[15] = 1;
    let mut remote = octets;
    remote[15] = 2;

    Ok((
        format!("{}/64", Ipv6Addr::from(local)),
        format!("{}/64", Ipv6Addr::from(remote)),
    ))
}

/// Final sanity check on a derived address: well-formed IPv6, not
/// IPv4-mapped. Failure here means a bug upstream, not bad input.
pub fn validate_ipv6(address: &str) -> Result<()> {
    let bare = strip_mask(address);
    let ip: Ipv6Addr = bare
        .parse()
        .map_err(|_| Error::AddressValidationFailed(address.to_string()))?;
    if ip.to_ipv4_mapped().is_some() {
        return Err(Error::AddressValidationFailed(address.to_string()));
    }
    Ok(())
}
