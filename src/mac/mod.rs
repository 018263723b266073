//! Hardware address helpers.

use anyhow::{bail, Result};
use itertools::Itertools;
use ring::digest::{digest, SHA256};
use std::net::IpAddr;

/// Locally administered prefix used for derived container MACs.
pub const MAC_PREFIX: [u8; 2] = [0x0a, 0x58];

/// Derive a MAC from an assigned address.
///
/// IPv4 addresses (including IPv4-mapped IPv6) fill the last four octets
/// directly; other IPv6 addresses contribute the first four bytes of the
/// SHA-256 of their textual form.
pub fn ip_to_hw_addr(ip: IpAddr) -> [u8; 6] {
    let v4 = match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    };
    let suffix = match v4 {
        Some(v4) => v4.octets(),
        None => {
            let hash = digest(&SHA256, ip.to_string().as_bytes());
            let bytes = hash.as_ref();
            [bytes[0], bytes[1], bytes[2], bytes[3]]
        }
    };
    [
        MAC_PREFIX[0],
        MAC_PREFIX[1],
        suffix[0],
        suffix[1],
        suffix[2],
        suffix[3],
    ]
}

/// Lower-case colon separated form, e.g. `0a:58:0a:00:00:05`.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{:02x}", b)).join(":")
}

pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        bail!("invalid MAC address {:?}", s);
    }
    let mut mac = [0u8; 6];
    for (byte, part) in mac.iter_mut().zip(parts) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| anyhow::anyhow!("invalid MAC address {:?}", s))?;
    }
    Ok(mac)
}

/// Compare two MAC strings ignoring case and separator style.
pub fn same_mac(a: &str, b: &str) -> bool {
    match (parse_mac(a), parse_mac(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}
