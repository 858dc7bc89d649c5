//! Deterministic in-process datagram network for tests.
//!
//! Sockets register with a global switchboard; delivery is synchronous, so
//! a test can send, then immediately poll the peer. Per-route packet loss
//! can be configured to exercise retry paths.
//!
//! # Example
//!
//! ```
//! use signon::simulator::Socket;
//! use std::io::ErrorKind;
//!
//! let a = Socket::bind_any();
//! let b = Socket::bind_any();
//!
//! a.send_to(&[1, 2, 3], b.local_addr()).unwrap();
//!
//! let mut buf = [0u8; 4];
//! let (len, from) = b.recv_from(&mut buf).unwrap();
//! assert_eq!(&buf[..len], &[1, 2, 3]);
//! assert_eq!(from, a.local_addr());
//!
//! let err = b.recv_from(&mut buf).unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::WouldBlock);
//! ```

use crossbeam_channel::{unbounded, Receiver, Sender};
use lazy_static::lazy_static;
use rand::{thread_rng, Rng};
use std::{
    collections::HashMap,
    io::{Error, ErrorKind, Result},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Mutex,
};

struct Datagram {
    from: SocketAddr,
    data: Vec<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Config {
    /// Probability in `[0, 1]` that a datagram on this route is dropped.
    pub loss: f64,
}

#[derive(Default)]
struct Network {
    bindings: HashMap<SocketAddr, Sender<Datagram>>,
    configs: HashMap<(SocketAddr, SocketAddr), Config>,
    next_port: u16,
}

lazy_static! {
    static ref NETWORK: Mutex<Network> = Mutex::new(Network::default());
}

/// Configures loss for datagrams flowing `from → to`. `None` clears.
pub fn config_route(from: SocketAddr, to: SocketAddr, config: Option<Config>) {
    let mut net = NETWORK.lock().unwrap();
    match config {
        Some(c) => { net.configs.insert((from, to), c); }
        None => { net.configs.remove(&(from, to)); }
    }
}

pub struct Socket {
    local_addr: SocketAddr,
    queue: Receiver<Datagram>,
}

impl Drop for Socket {
    fn drop(&mut self) {
        NETWORK.lock().unwrap().bindings.remove(&self.local_addr);
    }
}

impl Socket {
    /// Binds to a fresh unique address on the simulated network.
    pub fn bind_any() -> Self {
        Self::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 0))
    }

    /// Binds the given address; port 0 picks an unused one.
    pub fn bind(mut addr: SocketAddr) -> Self {
        let mut net = NETWORK.lock().unwrap();
        if addr.port() == 0 {
            loop {
                net.next_port = net.next_port.wrapping_add(1).max(1);
                addr.set_port(net.next_port);
                if !net.bindings.contains_key(&addr) {
                    break;
                }
            }
        }
        assert!(
            !net.bindings.contains_key(&addr),
            "simulated address already used: {}",
            addr
        );
        let (sender, queue) = unbounded();
        net.bindings.insert(addr, sender);
        Self { local_addr: addr, queue }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        let net = NETWORK.lock().unwrap();
        if let Some(config) = net.configs.get(&(self.local_addr, addr)) {
            if config.loss > 0.0 && thread_rng().gen_bool(config.loss.min(1.0)) {
                return Ok(buf.len());
            }
        }
        if let Some(to) = net.bindings.get(&addr) {
            let _ = to.send(Datagram { from: self.local_addr, data: buf.to_vec() });
        }
        Ok(buf.len())
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let datagram = self
            .queue
            .try_recv()
            .map_err(|_| Error::new(ErrorKind::WouldBlock, "simulator recv empty"))?;
        let len = datagram.data.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram.data[..len]);
        Ok((len, datagram.from))
    }
}

#[test]
fn lossy_route_drops_everything() {
    let a = Socket::bind_any();
    let b = Socket::bind_any();
    config_route(a.local_addr(), b.local_addr(), Some(Config { loss: 1.0 }));

    a.send_to(&[9], b.local_addr()).unwrap();
    let mut buf = [0u8; 4];
    assert!(b.recv_from(&mut buf).is_err());

    // reverse direction unaffected
    b.send_to(&[7], a.local_addr()).unwrap();
    let (len, _) = a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], &[7]);

    config_route(a.local_addr(), b.local_addr(), None);
}
