//! Remote endpoint addressing.
//!
//! A host can be reached either through a real IP endpoint or through the
//! local loopback sentinel; the sentinel carries no port and compares equal
//! to any other loopback entry.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Port assumed when an address string carries none.
pub const DEFAULT_PORT: u16 = 27015;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// Local host, any port.
    Loopback,
    Ip(SocketAddr),
}

impl Address {
    /// Resolves a user-supplied address string. Numeric forms are parsed
    /// directly, `localhost` maps to the loopback sentinel, everything else
    /// goes through a name lookup. Returns `None` when resolution fails.
    pub fn resolve(raw: &str) -> Option<Address> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "localhost" || raw.starts_with("localhost:") {
            return Some(Address::Loopback);
        }
        if let Ok(sa) = raw.parse::<SocketAddr>() {
            return Some(Address::Ip(with_default_port(sa)));
        }
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Some(Address::Ip(SocketAddr::new(ip, DEFAULT_PORT)));
        }
        let lookup = if raw.rfind(':').map_or(false, |i| raw[i + 1..].parse::<u16>().is_ok()) {
            raw.to_socket_addrs()
        } else {
            (raw, DEFAULT_PORT).to_socket_addrs()
        };
        lookup.ok()?.next().map(|sa| Address::Ip(with_default_port(sa)))
    }

    /// Folds a loopback origin back into the sentinel so inbound packets
    /// match candidates that were added as `localhost`.
    pub fn canonical(sa: SocketAddr) -> Address {
        if sa.ip().is_loopback() {
            Address::Loopback
        } else {
            Address::Ip(sa)
        }
    }

    /// Concrete endpoint to hand to the transport.
    pub fn socket_addr(&self) -> SocketAddr {
        match *self {
            Address::Loopback => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            Address::Ip(sa) => sa,
        }
    }

    pub fn is_loopback(&self) -> bool {
        match *self {
            Address::Loopback => true,
            Address::Ip(sa) => sa.ip().is_loopback(),
        }
    }

    /// Loose comparison for routing inbound packets: any two loopback
    /// addresses match regardless of port, everything else is exact.
    pub fn matches(&self, other: &Address) -> bool {
        if self.is_loopback() && other.is_loopback() {
            true
        } else {
            self == other
        }
    }
}

fn with_default_port(mut sa: SocketAddr) -> SocketAddr {
    if sa.port() == 0 {
        sa.set_port(DEFAULT_PORT);
    }
    sa
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Address::Loopback => write!(f, "loopback"),
            Address::Ip(sa) => write!(f, "{}", sa),
        }
    }
}

#[test]
fn resolve_numeric() {
    assert_eq!(
        Address::resolve("192.0.2.7:4242"),
        Some(Address::Ip("192.0.2.7:4242".parse().unwrap())),
    );
    assert_eq!(
        Address::resolve("192.0.2.7"),
        Some(Address::Ip("192.0.2.7:27015".parse().unwrap())),
    );
    // port 0 means "default", same as the legacy resolver
    assert_eq!(
        Address::resolve("192.0.2.7:0"),
        Some(Address::Ip("192.0.2.7:27015".parse().unwrap())),
    );
}

#[test]
fn resolve_localhost() {
    assert_eq!(Address::resolve("localhost"), Some(Address::Loopback));
    assert_eq!(Address::resolve("localhost:27016"), Some(Address::Loopback));
    assert!(Address::resolve("").is_none());
}

#[test]
fn loopback_equality() {
    let lo = Address::Loopback;
    assert_eq!(lo, Address::canonical("127.0.0.1:999".parse().unwrap()));
    assert_ne!(lo, Address::Ip("192.0.2.1:27015".parse().unwrap()));
    // ports are irrelevant between loopback forms
    assert!(lo.matches(&Address::Ip("127.0.0.1:1234".parse().unwrap())));
    assert!(!lo.matches(&Address::Ip("192.0.2.1:27015".parse().unwrap())));
}
