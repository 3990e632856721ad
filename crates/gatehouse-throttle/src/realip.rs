//! Client address resolution behind trusted proxies.
//!
//! By default only the transport peer address is believed. When the peer is
//! one of the configured trusted proxies, `X-Real-IP` and then the leftmost
//! `X-Forwarded-For` entry are consulted; forwarded candidates in private or
//! loopback ranges are rejected to block spoofed injections.

use gatehouse_core::ConfigError;
use http::Request;
use std::net::IpAddr;

pub use gatehouse_events::{ClientIp, PeerAddr};

/// A single address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parses `"203.0.113.7"`, `"203.0.113.0/24"`, or the IPv6 equivalents.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            field: "cidr",
            reason: format!("{s:?}: {reason}"),
        };

        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|_| invalid("not an IP address"))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_part {
            Some(p) => p.trim().parse::<u8>().map_err(|_| invalid("bad prefix"))?,
            None => max,
        };
        if prefix > max {
            return Err(invalid("prefix out of range"));
        }
        Ok(Self { addr, prefix })
    }

    /// Whether `ip` falls inside this block. Families must match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                mask_v4(u32::from_be_bytes(net.octets()), self.prefix)
                    == mask_v4(u32::from_be_bytes(ip.octets()), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                mask_v6(u128::from_be_bytes(net.octets()), self.prefix)
                    == mask_v6(u128::from_be_bytes(ip.octets()), self.prefix)
            }
            _ => false,
        }
    }
}

fn mask_v4(bits: u32, prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        bits & (u32::MAX << (32 - prefix as u32))
    }
}

fn mask_v6(bits: u128, prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - prefix as u32))
    }
}

/// Derives the subnet key an address is throttled under.
pub(crate) fn subnet_key(ip: IpAddr, v4_prefix: u8, v6_prefix: u8) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let masked = mask_v4(u32::from_be_bytes(v4.octets()), v4_prefix);
            format!("{}/{v4_prefix}", std::net::Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let masked = mask_v6(u128::from_be_bytes(v6.octets()), v6_prefix);
            format!("{}/{v6_prefix}", std::net::Ipv6Addr::from(masked))
        }
    }
}

/// Addresses that must never be accepted from forwarding headers.
fn is_private_or_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Resolves the real client address for a request.
#[derive(Debug, Clone, Default)]
pub struct RealIpResolver {
    trusted_proxies: Vec<Cidr>,
}

impl RealIpResolver {
    /// Creates a resolver. Entries may be single IPs or CIDR blocks; with no
    /// entries, forwarding headers are never trusted.
    pub fn new<I, S>(trusted_proxies: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let trusted_proxies = trusted_proxies
            .into_iter()
            .map(|s| Cidr::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { trusted_proxies })
    }

    fn is_trusted(&self, peer: &IpAddr) -> bool {
        self.trusted_proxies.iter().any(|cidr| cidr.contains(peer))
    }

    /// Resolves the client address given the transport peer and the request
    /// headers.
    pub fn resolve<B>(&self, req: &Request<B>, peer: IpAddr) -> IpAddr {
        if !self.is_trusted(&peer) {
            return peer;
        }

        if let Some(candidate) = header_ip(req, "x-real-ip") {
            if !is_private_or_loopback(&candidate) {
                return candidate;
            }
        }

        // Leftmost X-Forwarded-For entry is the origin client.
        if let Some(value) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = value.split(',').next() {
                if let Ok(candidate) = first.trim().parse::<IpAddr>() {
                    if !is_private_or_loopback(&candidate) {
                        return candidate;
                    }
                }
            }
        }

        peer
    }
}

fn header_ip<B>(req: &Request<B>, name: &str) -> Option<IpAddr> {
    req.headers()
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
