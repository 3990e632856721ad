//! Client attribution types shared across the protection components.
//!
//! These are request-extension markers: the server glue records the
//! transport peer as [`PeerAddr`]; the throttle layer resolves and inserts
//! [`ClientIp`]; every component attributing security events reads it.

use std::net::{IpAddr, SocketAddr};

/// Transport peer address, recorded before the protection stack runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// The resolved client address a request is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl std::fmt::Display for ClientIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_displays_as_the_bare_address() {
        let ip = ClientIp("203.0.113.9".parse().unwrap());
        assert_eq!(ip.to_string(), "203.0.113.9");
    }
}
