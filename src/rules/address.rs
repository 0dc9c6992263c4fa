//! IPv4 address and CIDR arithmetic
//!
//! Pure functions used by rule validation and CIDR matching. IPv4 is the
//! only family matched numerically; IPv6 is validated syntactically.
//!
//! # Example
//!
//! ```
//! use iface_router::rules::address::{self, Cidr};
//!
//! let cidr: Cidr = address::parse_cidr("10.1.2.3/8").unwrap();
//! assert_eq!(address::u32_to_ipv4(cidr.network), "10.0.0.0");
//! assert!(cidr.contains(address::ipv4_to_u32("10.200.0.1").unwrap()));
//! assert_eq!(address::host_count(24), 256);
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::Ipv4Net;

use crate::error::AddressError;

/// Maximum hostname length, excluding an optional trailing dot
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum DNS label length
pub const MAX_LABEL_LEN: usize = 63;

/// A parsed IPv4 network block.
///
/// Numeric view over an [`Ipv4Net`] with its host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Network address (host bits cleared)
    pub network: u32,
    /// Subnet mask with the top `prefix_len` bits set
    pub mask: u32,
    /// Prefix length in [0, 32]
    pub prefix_len: u8,
    net: Ipv4Net,
}

impl Cidr {
    #[must_use]
    pub const fn contains(&self, ip: u32) -> bool {
        matches(ip, self.network, self.mask)
    }

    #[must_use]
    pub fn broadcast(&self) -> u32 {
        self.net.broadcast().into()
    }

    #[must_use]
    pub const fn host_count(&self) -> u64 {
        host_count(self.prefix_len)
    }

    #[must_use]
    pub const fn net(&self) -> Ipv4Net {
        self.net
    }
}

impl From<Ipv4Net> for Cidr {
    fn from(net: Ipv4Net) -> Self {
        let net = net.trunc();
        Self {
            network: net.network().into(),
            mask: net.netmask().into(),
            prefix_len: net.prefix_len(),
            net,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.net, f)
    }
}

/// Mask with the top `prefix_len` bits set. Values above 32 saturate.
#[must_use]
pub fn prefix_to_mask(prefix_len: u8) -> u32 {
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, prefix_len.min(32))
        .map_or(u32::MAX, |net| net.netmask().into())
}

/// Strict dotted-quad validation.
///
/// Exactly four decimal octets, no signs, no whitespace, and no leading
/// zeros other than a lone `0`.
#[must_use]
pub fn is_valid_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

#[must_use]
pub fn is_valid_ipv6(s: &str) -> bool {
    s.parse::<Ipv6Addr>().is_ok()
}

#[must_use]
pub fn is_valid_ip_address(s: &str) -> bool {
    is_valid_ipv4(s) || is_valid_ipv6(s)
}

/// # Errors
///
/// `AddressError::InvalidAddress` when `s` is not a canonical dotted quad.
pub fn ipv4_to_u32(s: &str) -> Result<u32, AddressError> {
    s.parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| AddressError::InvalidAddress(s.to_string()))
}

#[must_use]
pub fn u32_to_ipv4(value: u32) -> String {
    Ipv4Addr::from(value).to_string()
}

/// `(ip & mask) == network`
#[must_use]
pub const fn matches(ip: u32, network: u32, mask: u32) -> bool {
    (ip & mask) == network
}

/// Parse `address/prefix` into a normalized network block.
///
/// A host address inside the block is accepted and normalized to the
/// block's network address.
///
/// # Errors
///
/// - `InvalidFormat` if there is not exactly one `/`
/// - `InvalidAddress` if the address part is not a valid IPv4 address
/// - `InvalidPrefix` if the prefix is not an integer in [0, 32]
pub fn parse_cidr(s: &str) -> Result<Cidr, AddressError> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| AddressError::InvalidFormat(s.to_string()))?;
    if prefix.contains('/') {
        return Err(AddressError::InvalidFormat(s.to_string()));
    }

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| AddressError::InvalidAddress(addr.to_string()))?;
    let invalid_prefix = || AddressError::InvalidPrefix(prefix.to_string());
    let prefix_len = parse_prefix(prefix).ok_or_else(invalid_prefix)?;
    let net = Ipv4Net::new(addr, prefix_len).map_err(|_| invalid_prefix())?;
    Ok(Cidr::from(net))
}

#[must_use]
pub fn is_valid_cidr(s: &str) -> bool {
    parse_cidr(s).is_ok()
}

/// String convenience: is `ip` inside `cidr`? False on any parse failure.
#[must_use]
pub fn ip_matches_cidr(ip: &str, cidr: &str) -> bool {
    match (ip.parse::<Ipv4Addr>(), parse_cidr(cidr)) {
        (Ok(ip), Ok(cidr)) => cidr.net().contains(&ip),
        _ => false,
    }
}

/// # Errors
///
/// Propagates `parse_cidr` errors.
pub fn network_address(cidr: &str) -> Result<String, AddressError> {
    parse_cidr(cidr).map(|c| c.net().network().to_string())
}

/// # Errors
///
/// Propagates `parse_cidr` errors.
pub fn broadcast_address(cidr: &str) -> Result<String, AddressError> {
    parse_cidr(cidr).map(|c| c.net().broadcast().to_string())
}

/// Number of addresses covered by a prefix: `2^(32 - prefix_len)`.
///
/// Returns 0 for prefixes above 32.
#[must_use]
pub const fn host_count(prefix_len: u8) -> u64 {
    if prefix_len > 32 {
        0
    } else {
        1u64 << (32 - prefix_len as u32)
    }
}

/// Hostname syntax check.
///
/// Labels are 1-63 ASCII letters, digits or hyphens and never start or
/// end with a hyphen. Total length is at most 253, ignoring a single
/// trailing dot.
#[must_use]
pub fn is_valid_hostname(s: &str) -> bool {
    let name = s.strip_suffix('.').unwrap_or(s);
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    name.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Decimal digits only, no sign and no leading zero.
fn parse_prefix(part: &str) -> Option<u8> {
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse::<u8>().ok().filter(|p| *p <= 32)
}
