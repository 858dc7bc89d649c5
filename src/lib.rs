//! Client-side connection/reservation engine for game-server transports.
//!
//! ```txt
//! Client  →  getchallenge   →  Host     (resent every resend interval)
//! Client  ←  challenge      ←  Host     (challenge nr, auth protocol, key exchange)
//! Client  →  connect        →  Host     (password, players, cookie, key section, ticket)
//! Client  ←  connection     ←  Host     (accepted; hand off to the reliable stream)
//! ```
//!
//! Everything is connectionless and single-threaded: the host application
//! calls [`ClientState::run_frame`] once per tick and the engine drives the
//! signon state machine, connect-packet retransmits and any outstanding
//! [`ServerRequest`]s (liveness pings, reservation-slot confirmations) over
//! one shared socket.

#![warn(
    trivial_casts,
    unused_qualifications,
    unused_import_braces,
)]

mod address_list;
mod client;
mod encryption;
mod request;

pub mod addr;
pub mod config;
pub mod protocol;
pub mod simulator;

pub use crate::{
    addr::Address,
    address_list::{AddressList, Candidate},
    client::{AuthTickets, SessionKeyExchange},
    client::{
        ClientEvent, ClientState, ConnectError, DirectConnectLobby, NoAuth, NoKeyExchange,
        SignonState, EPOCH_UNKNOWN,
    },
    config::Config,
    encryption::{CertificateRegistry, KeyCache, KEY_CACHE_HIGH_WATER, KEY_CACHE_PURGE_MAX, KEY_LEN},
    request::{RequestCallback, RequestKind, RequestState, ServerRequest},
};

use std::{io, net::{SocketAddr, UdpSocket}};

/// Datagram transport shared by the connect-packet builder and every
/// outstanding [`ServerRequest`]. Implementations must be non-blocking:
/// `recv_from` returns [`io::ErrorKind::WouldBlock`] when idle.
pub trait Socket {
    /// Returns the socket address that this socket was created from.
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Sends data on the socket to the given address.
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    /// Receives a single datagram message on the socket.
    /// On success, returns the number of bytes read and the origin.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl Socket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }
}

impl Socket for simulator::Socket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(simulator::Socket::local_addr(self))
    }
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        simulator::Socket::send_to(self, buf, addr)
    }
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        simulator::Socket::recv_from(self, buf)
    }
}
