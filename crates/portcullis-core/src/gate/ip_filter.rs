//! Client IP filtering.
//!
//! Filter entries accept exact addresses, `a.b.c.*` wildcards and CIDR
//! blocks. The client IP comes from the leftmost `X-Forwarded-For` entry
//! when the deployment trusts its fronting proxy, else from the socket peer.

use portcullis_types::error::{GatewayError, GatewayResult};
use portcullis_types::models::IpFiltering;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Resolve the client IP for one request.
pub fn client_ip(
    headers: &HashMap<String, String>,
    peer: &str,
    trust_x_forwarded_for: bool,
) -> String {
    if trust_x_forwarded_for {
        if let Some(xff) = headers.get("x-forwarded-for") {
            if let Some(first) = xff.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    peer.to_string()
}

/// Apply the service's filter. Whitelist wins membership, blacklist wins
/// rejection, both with the listed entry syntaxes.
pub fn check(filtering: &IpFiltering, ip: &str) -> GatewayResult<()> {
    if !filtering.whitelist.is_empty()
        && !filtering.whitelist.iter().any(|entry| entry_matches(entry, ip))
    {
        return Err(GatewayError::IpBlocked { ip: ip.to_string() });
    }
    if filtering.blacklist.iter().any(|entry| entry_matches(entry, ip)) {
        return Err(GatewayError::IpBlocked { ip: ip.to_string() });
    }
    Ok(())
}

fn entry_matches(entry: &str, ip: &str) -> bool {
    if entry == ip {
        return true;
    }
    if entry.contains('/') {
        return cidr_matches(entry, ip);
    }
    if entry.contains('*') {
        return wildcard_matches(entry, ip);
    }
    false
}

/// `a.b.c.*` style: segment-wise comparison with `*` as a free segment.
fn wildcard_matches(pattern: &str, ip: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let ip_segments: Vec<&str> = ip.split('.').collect();
    pattern_segments.len() == ip_segments.len()
        && pattern_segments
            .iter()
            .zip(&ip_segments)
            .all(|(p, s)| *p == "*" || p == s)
}

fn cidr_matches(block: &str, ip: &str) -> bool {
    let Some((base, bits)) = block.split_once('/') else {
        return false;
    };
    let Ok(bits) = bits.parse::<u32>() else {
        return false;
    };
    match (base.parse::<IpAddr>(), ip.parse::<IpAddr>()) {
        (Ok(IpAddr::V4(base)), Ok(IpAddr::V4(ip))) => v4_prefix_matches(base, ip, bits),
        (Ok(IpAddr::V6(base)), Ok(IpAddr::V6(ip))) => v6_prefix_matches(base, ip, bits),
        _ => false,
    }
}

fn v4_prefix_matches(base: Ipv4Addr, ip: Ipv4Addr, bits: u32) -> bool {
    if bits > 32 {
        return false;
    }
    if bits == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - bits);
    (u32::from(base) & mask) == (u32::from(ip) & mask)
}

fn v6_prefix_matches(base: Ipv6Addr, ip: Ipv6Addr, bits: u32) -> bool {
    if bits > 128 {
        return false;
    }
    if bits == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - bits);
    (u128::from(base) & mask) == (u128::from(ip) & mask)
}
