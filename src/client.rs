//! Top-level signon state machine and connect-packet builder.
//!
//! The host application owns a [`ClientState`], feeds it ticks through
//! [`ClientState::run_frame`] and observes the outcome through
//! [`ClientState::poll_event`]. Once a handshake completes the reliable
//! stream layer takes over; this module only negotiates the session.

use std::collections::VecDeque;
use std::io::Cursor;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use byteorder::{LittleEndian as LE, ReadBytesExt};
use log::{debug, info, warn};
use thiserror::Error;

use crate::addr::Address;
use crate::address_list::AddressList;
use crate::config::Config;
use crate::encryption::{
    CertificateRegistry, KeyCache, CERT_METADATA_LEN, KEY_CACHE_HIGH_WATER, KEY_CACHE_PURGE_MAX,
    KEY_LEN,
};
use crate::protocol::{
    self, ChallengeResponse, KeySection, WireError, AUTH_PROTOCOL_TICKET, MAX_ROUTABLE_PAYLOAD,
};
use crate::request::{RequestCallback, ServerRequest};
use crate::Socket;

/// Stages of the handshake, in the order a client passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignonState {
    /// Not connected.
    None,
    /// Challenge/connect exchange in flight.
    Challenge,
    /// Connect accepted, reliable channel established.
    Connected,
    New,
    PreSpawn,
    Spawn,
    Full,
    ChangeLevel,
}

impl SignonState {
    pub fn from_raw(v: i32) -> Option<SignonState> {
        Some(match v {
            0 => SignonState::None,
            1 => SignonState::Challenge,
            2 => SignonState::Connected,
            3 => SignonState::New,
            4 => SignonState::PreSpawn,
            5 => SignonState::Spawn,
            6 => SignonState::Full,
            7 => SignonState::ChangeLevel,
            _ => return None,
        })
    }
}

/// Server epoch value meaning "not known yet".
pub const EPOCH_UNKNOWN: i32 = -1;

#[derive(Debug, Error, PartialEq)]
pub enum ConnectError {
    #[error("connection failed after {retries} retries")]
    RetriesExhausted { retries: u32 },
    #[error("client connect packet too large: {size} bytes")]
    PacketTooLarge { size: usize },
    #[error("no server address could be resolved")]
    NoResolvedAddress,
    #[error("invalid challenge packet")]
    InvalidChallenge,
    #[error("bad challenge signature")]
    BadSignature,
    #[error("host version mismatch: client {client}, host {host}")]
    VersionMismatch { client: i32, host: i32 },
    #[error("authentication ticket unavailable")]
    TicketUnavailable,
    #[error("connection rejected: {0}")]
    Rejected(String),
}

/// What the engine reports back to the host application.
#[derive(Debug, PartialEq)]
pub enum ClientEvent {
    /// Handshake complete; the reliable stream layer takes over from here.
    Connected {
        remote: Address,
        challenge: i32,
        /// Symmetric key protecting the session, absent for plaintext.
        session_key: Option<Vec<u8>>,
    },
    ConnectFailed(ConnectError),
    /// The host wants a password and none is configured; the attempt is
    /// paused until [`ClientState::password_entered`].
    PasswordRequired,
    Disconnected { reason: String, show_reconnect_ui: bool },
}

/// Source of opaque authentication tickets. The engine embeds the blob in
/// the connect packet and never inspects it.
pub trait AuthTickets {
    fn session_ticket(&mut self, host_id: u64, secure: bool) -> Option<Vec<u8>>;
}

/// Ticketless client; hosts demanding the ticket protocol will be refused.
pub struct NoAuth;

impl AuthTickets for NoAuth {
    fn session_ticket(&mut self, _host_id: u64, _secure: bool) -> Option<Vec<u8>> {
        None
    }
}

/// Verifies a host's key-exchange offer and derives the session key blob
/// (`[key: KEY_LEN bytes][encrypted exchange]`). Returning `None` rejects
/// the host.
pub trait SessionKeyExchange {
    fn establish(
        &mut self,
        official: bool,
        remote: Address,
        public_key: &[u8],
        signature: &[u8],
    ) -> Option<Vec<u8>>;
}

/// Refuses every key-exchange offer; only plaintext hosts are reachable.
pub struct NoKeyExchange;

impl SessionKeyExchange for NoKeyExchange {
    fn establish(&mut self, _: bool, _: Address, _: &[u8], _: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Short-lived record of a lobby the user asked to join directly; cleared
/// once a connection fully establishes.
#[derive(Debug, Clone)]
pub struct DirectConnectLobby {
    pub remote: Address,
    pub lobby_id: u64,
}

/// Challenge data held between receiving the host's challenge response and
/// emitting the connect packet built from it.
#[derive(Default)]
struct DeferredConnection {
    active: bool,
    remote: Option<Address>,
    challenge: i32,
    auth_protocol: i32,
    host_id: u64,
    secure: bool,
    lobby_type: String,
    requires_password: bool,
    lobby_id: u64,
    /// Id of the key generated for this challenge, zero when plaintext.
    encryption_key: i32,
}

struct ConnectionAttempt {
    challenge: i32,
    /// `None` forces the first connect packet out on the next tick.
    connect_time: Option<Instant>,
    retries: u32,
    retry_limit: u32,
    num_players: u8,
}

impl Default for ConnectionAttempt {
    fn default() -> Self {
        Self {
            challenge: 0,
            connect_time: None,
            retries: 0,
            retry_limit: 0,
            num_players: 1,
        }
    }
}

pub struct ClientState<S: Socket = UdpSocket> {
    socket: S,
    config: Config,

    signon: SignonState,
    server_epoch: i32,
    /// Playback of previously recorded traffic; ordering/epoch checks are
    /// skipped in this mode.
    replay: bool,

    remotes: AddressList,
    attempt: ConnectionAttempt,
    deferred: DeferredConnection,
    waiting_for_password: bool,
    /// A redirect hop is in flight; keep the reservation cookie alive.
    server_redirect: bool,

    reservation_cookie: u64,
    server_version: i32,
    host_id: u64,

    key_cache: KeyCache,
    certificates: CertificateRegistry,
    key_exchange: Box<dyn SessionKeyExchange>,
    tickets: Box<dyn AuthTickets>,
    direct_connect: Option<DirectConnectLobby>,

    pings: Vec<ServerRequest>,
    reservation_checks: Vec<ServerRequest>,

    /// Per-player opaque user-info blocks for the connect packet.
    user_info: Vec<Vec<u8>>,
    next_cmd_time: Option<Instant>,
    events: VecDeque<ClientEvent>,
}

impl<S: Socket> ClientState<S> {
    pub fn new(socket: S, config: Config) -> Self {
        Self {
            socket,
            config,
            signon: SignonState::None,
            server_epoch: EPOCH_UNKNOWN,
            replay: false,
            remotes: AddressList::new(),
            attempt: ConnectionAttempt::default(),
            deferred: DeferredConnection::default(),
            waiting_for_password: false,
            server_redirect: false,
            reservation_cookie: 0,
            server_version: 0,
            host_id: 0,
            key_cache: KeyCache::new(),
            certificates: CertificateRegistry::new(),
            key_exchange: Box::new(NoKeyExchange),
            tickets: Box::new(NoAuth),
            direct_connect: None,
            pings: Vec::new(),
            reservation_checks: Vec::new(),
            user_info: Vec::new(),
            next_cmd_time: None,
            events: VecDeque::new(),
        }
    }

    pub fn signon_state(&self) -> SignonState {
        self.signon
    }

    pub fn server_epoch(&self) -> i32 {
        self.server_epoch
    }

    /// Set once the reliable layer learns the host's epoch from server info.
    pub fn set_server_epoch(&mut self, epoch: i32) {
        self.server_epoch = epoch;
    }

    pub fn set_replay(&mut self, replay: bool) {
        self.replay = replay;
    }

    /// Identity of the host being connected to, zero until a connect
    /// packet has gone out.
    pub fn host_id(&self) -> u64 {
        self.host_id
    }

    pub fn reservation_cookie(&self) -> u64 {
        self.reservation_cookie
    }

    pub fn set_reservation_cookie(&mut self, cookie: u64) {
        self.reservation_cookie = cookie;
    }

    pub fn set_direct_connect_lobby(&mut self, lobby: DirectConnectLobby) {
        self.direct_connect = Some(lobby);
    }

    pub fn set_auth_tickets(&mut self, tickets: Box<dyn AuthTickets>) {
        self.tickets = tickets;
    }

    pub fn set_key_exchange(&mut self, key_exchange: Box<dyn SessionKeyExchange>) {
        self.key_exchange = key_exchange;
    }

    pub fn set_user_info(&mut self, blocks: Vec<Vec<u8>>) {
        self.user_info = blocks;
    }

    pub fn set_password(&mut self, password: &str) {
        self.config.password = password.to_owned();
    }

    /// Resumes an attempt paused on [`ClientEvent::PasswordRequired`].
    pub fn password_entered(&mut self, now: Instant) {
        self.waiting_for_password = false;
        self.check_for_resend(now, true);
    }

    pub fn remotes(&self) -> &AddressList {
        &self.remotes
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.key_cache
    }

    pub fn key_cache_mut(&mut self) -> &mut KeyCache {
        &mut self.key_cache
    }

    /// Installs an externally supplied authentication payload for a host,
    /// keyed by its textual address.
    pub fn register_certificate(&mut self, addr_key: &str, payload: &[u8]) {
        self.certificates.register(addr_key, payload);
    }

    /// Clock the handshake may send its next command at; reset on connect.
    pub fn next_cmd_time(&self) -> Option<Instant> {
        self.next_cmd_time
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn connect(&mut self, public: &str, private: &str, join_type: &str) {
        self.connect_internal(public, private, 1, join_type);
    }

    pub fn connect_split_screen(
        &mut self,
        public: &str,
        private: &str,
        num_players: u8,
        join_type: &str,
    ) {
        self.connect_internal(public, private, num_players, join_type);
    }

    fn connect_internal(&mut self, public: &str, private: &str, num_players: u8, join_type: &str) {
        self.remotes.remove_all();
        self.remotes.add_remote(public, "public");
        self.remotes.add_remote(private, "private");
        if let Some(lobby) = &self.direct_connect {
            if let Address::Ip(sa) = lobby.remote {
                info!("adding direct connect address {}", sa);
                self.remotes.add_remote(&sa.to_string(), "direct");
            }
        }

        self.attempt = ConnectionAttempt {
            challenge: 0,
            connect_time: None, // fire the first request on the next tick
            retries: 0,
            retry_limit: self.config.retry_limit(),
            num_players,
        };
        self.deferred = DeferredConnection::default();
        self.waiting_for_password = false;
        self.server_redirect = false;
        self.server_version = 0;
        self.server_epoch = EPOCH_UNKNOWN;
        self.host_id = 0;

        // A reset, not a server-driven transition: assigned directly so the
        // ordering invariant stays strict for the wire path.
        self.signon = SignonState::Challenge;
        debug!("connecting ({}): {}", join_type, self.remotes.describe());
    }

    /// One cooperative tick: drains the socket, drives the connect
    /// retransmit timer and every outstanding request.
    pub fn run_frame(&mut self, now: Instant) {
        let mut buf = [0u8; MAX_ROUTABLE_PAYLOAD];
        while let Ok((len, from)) = self.socket.recv_from(&mut buf) {
            self.process_packet(now, from, &buf[..len]);
        }

        if self.signon == SignonState::Challenge {
            self.check_for_resend(now, false);
        }

        // Update then sweep. Completion callbacks only ever see the request
        // itself, so the collections cannot change under the update pass.
        for req in self.reservation_checks.iter_mut() {
            req.update(now, &self.socket, self.config.host_version);
        }
        self.reservation_checks.retain(|r| !r.is_finished());

        for req in self.pings.iter_mut() {
            req.update(now, &self.socket, self.config.host_version);
        }
        self.pings.retain(|r| !r.is_finished());
    }

    /// Starts a liveness probe against a host. The callback fires once with
    /// the round-trip time in milliseconds, or with `Failed`.
    pub fn ping_server<C: RequestCallback + 'static>(&mut self, remote: Address, callback: C) {
        self.pings.push(ServerRequest::ping(remote, Box::new(callback)));
    }

    /// Starts polling a host for confirmation of a slot reservation. The
    /// callback fires on every "players still awaited" update and once on
    /// the terminal transition.
    pub fn check_reservation<C: RequestCallback + 'static>(
        &mut self,
        remote: Address,
        cookie: u64,
        stage: u32,
        callback: C,
    ) {
        let attempts = if stage > 1 {
            self.config.reservation_extended_attempts
        } else {
            self.config.reservation_attempts
        };
        self.reservation_checks.push(ServerRequest::reserve_check(
            remote,
            cookie,
            stage,
            self.config.client_id,
            attempts,
            Box::new(callback),
        ));
    }

    /// Cancels all outstanding requests to a host. No wire traffic results;
    /// removal from the tracking collection is the cancellation primitive.
    pub fn cancel_requests(&mut self, remote: Address) {
        self.pings.retain(|r| !r.remote().matches(&remote));
        self.reservation_checks.retain(|r| !r.remote().matches(&remote));
    }

    /// Resend a challenge/connect request if the last one timed out.
    fn check_for_resend(&mut self, now: Instant, force: bool) {
        if self.signon != SignonState::Challenge {
            return;
        }
        if self.waiting_for_password {
            return;
        }
        if !force {
            if let Some(t) = self.attempt.connect_time {
                if now.duration_since(t) < self.config.resend_interval {
                    return;
                }
            }
        }
        if self.remotes.is_empty() {
            return;
        }
        if self.remotes.resolved().next().is_none() {
            self.fail_connect(ConnectError::NoResolvedAddress);
            return;
        }
        if self.attempt.retries >= self.attempt.retry_limit {
            self.fail_connect(ConnectError::RetriesExhausted {
                retries: self.attempt.retry_limit,
            });
            return;
        }

        self.attempt.connect_time = Some(now);
        info!(
            "{} {}",
            if self.attempt.retries == 0 { "connecting to" } else { "retrying" },
            self.remotes.describe()
        );

        let packet = protocol::challenge_request(self.deferred.challenge);
        for addr in self.remotes.resolved() {
            if let Err(err) = self.socket.send_to(&packet, addr.socket_addr()) {
                warn!("challenge request to {} failed: {}", addr, err);
            }
        }
        self.attempt.retries += 1;
    }

    /// Routes one inbound connectionless datagram.
    pub fn process_packet(&mut self, now: Instant, from: SocketAddr, packet: &[u8]) {
        let (opcode, body) = match protocol::strip_header(packet) {
            Ok(x) => x,
            Err(_) => {
                debug!("bad connectionless packet from {}", from);
                return;
            }
        };
        let from = Address::canonical(from);

        match opcode {
            protocol::S2C_CHALLENGE => self.on_challenge(now, from, body),
            protocol::S2C_CONNECTION => self.on_connection(now, from, body),
            protocol::S2C_CONNREJECT => self.on_reject(from, body),
            protocol::S2A_PING_RESPONSE => Self::route_response(
                &mut self.pings,
                now,
                from,
                body,
                self.config.host_version,
            ),
            protocol::S2A_RESERVE_CHECK_RESPONSE => Self::route_response(
                &mut self.reservation_checks,
                now,
                from,
                body,
                self.config.host_version,
            ),
            _ => debug!(
                "ignoring connectionless packet '{}' from {}",
                opcode as char, from
            ),
        }
    }

    fn route_response(
        requests: &mut Vec<ServerRequest>,
        now: Instant,
        from: Address,
        body: &[u8],
        expected_version: i32,
    ) {
        let mut cur = Cursor::new(body);
        let host_version = match cur.read_i32::<LE>() {
            Ok(v) => v,
            Err(_) => return,
        };
        let token = match cur.read_u32::<LE>() {
            Ok(v) => v,
            Err(_) => return,
        };
        let rest = &body[8..];
        for req in requests.iter_mut() {
            if from.matches(&req.remote()) {
                req.handle_response(now, from, host_version, token, rest, expected_version);
            }
        }
    }

    fn on_challenge(&mut self, now: Instant, from: Address, body: &[u8]) {
        if self.signon != SignonState::Challenge {
            // not asking for a challenge right now
            return;
        }

        let resp = match ChallengeResponse::read(body) {
            Ok(r) => r,
            Err(_) => {
                self.fail_connect(ConnectError::InvalidChallenge);
                return;
            }
        };
        if resp.auth_protocol == AUTH_PROTOCOL_TICKET && resp.auth_key_size != 0 {
            self.fail_connect(ConnectError::InvalidChallenge);
            return;
        }

        self.deferred.active = false;
        self.deferred.remote = Some(from);
        self.deferred.challenge = resp.challenge;
        self.deferred.auth_protocol = resp.auth_protocol;
        self.deferred.host_id = resp.host_id;
        self.deferred.secure = resp.secure;

        if resp.context.starts_with("reserve") {
            // reservation requests are negotiated by the matchmaking layer
            debug!("ignoring reservation challenge from {}", from);
            return;
        }
        if !resp.context.starts_with("connect") {
            return;
        }
        let details = match resp.connect {
            Some(d) => d,
            None => return,
        };

        self.deferred.active = true;
        self.server_version = details.version;
        if details.version != self.config.host_version {
            info!(
                "host is running version {}, client version {}",
                details.version, self.config.host_version
            );
            self.fail_connect(ConnectError::VersionMismatch {
                client: self.config.host_version,
                host: details.version,
            });
            return;
        }

        match &details.key_exchange {
            Some(kx) => {
                match self
                    .key_exchange
                    .establish(details.official, from, &kx.public_key, &kx.signature)
                {
                    Some(blob) => {
                        self.deferred.encryption_key = self.key_cache.offer(blob);
                    }
                    None => {
                        self.fail_connect(ConnectError::BadSignature);
                        return;
                    }
                }
            }
            None => self.deferred.encryption_key = 0,
        }

        self.deferred.lobby_type = details.lobby_type;
        self.deferred.requires_password = details.requires_password;
        self.deferred.lobby_id = details.lobby_id;
        info!(
            "host using '{}' lobbies, requiring pw {}, lobby id {:x}",
            if self.deferred.lobby_type.is_empty() { "<none>" } else { &self.deferred.lobby_type },
            if self.deferred.requires_password { "yes" } else { "no" },
            self.deferred.lobby_id,
        );

        if self.deferred.lobby_type.is_empty()
            && self.deferred.lobby_id == 0
            && self.deferred.requires_password
            && self.config.password.is_empty()
        {
            // stop resending challenges while the prompt is up
            self.waiting_for_password = true;
            self.events.push_back(ClientEvent::PasswordRequired);
            return;
        }
        if resp.context.starts_with("connect-retry") {
            // the host will reserve itself briefly; reissue with the
            // challenge we now hold
            info!("grace request retry for unreserved host");
            self.check_for_resend(now, true);
            return;
        }
        if resp.context.starts_with("connect-matchmaking-only") {
            self.fail_connect(ConnectError::Rejected(
                "host only accepts matchmaking connections".to_owned(),
            ));
            return;
        }
        if resp.context.starts_with("connect-lan-only") {
            self.fail_connect(ConnectError::Rejected(
                "host is restricted to LAN connections".to_owned(),
            ));
            return;
        }

        self.handle_deferred_connection(now);
    }

    fn handle_deferred_connection(&mut self, now: Instant) {
        if !self.deferred.active {
            return;
        }
        let remote = match self.deferred.remote {
            Some(r) => r,
            None => return,
        };
        let (challenge, auth_protocol) = (self.deferred.challenge, self.deferred.auth_protocol);
        let (host_id, secure) = (self.deferred.host_id, self.deferred.secure);
        self.send_connect_packet(now, remote, challenge, auth_protocol, host_id, secure);
    }

    /// Builds and transmits the connect request. The encryption key is
    /// chosen by priority: the key generated for this challenge, else a
    /// registered certificate for the address, else none.
    fn send_connect_packet(
        &mut self,
        now: Instant,
        remote: Address,
        challenge: i32,
        auth_protocol: i32,
        host_id: u64,
        secure: bool,
    ) {
        if !remote.is_loopback() && !self.remotes.is_address_in_list(remote) {
            warn!("sending connect packet to unexpected address {}", remote);
        }

        let auth = if auth_protocol == AUTH_PROTOCOL_TICKET {
            match self.tickets.session_ticket(host_id, secure) {
                Some(ticket) => protocol::AuthTrailer::Ticket(ticket),
                None => {
                    self.fail_connect(ConnectError::TicketUnavailable);
                    return;
                }
            }
        } else {
            protocol::AuthTrailer::KeyHash(self.config.key_hash.clone())
        };

        let mut players = Vec::with_capacity(self.attempt.num_players as usize);
        for slot in 0..self.attempt.num_players {
            let info = self.user_info.get(slot as usize).cloned().unwrap_or_else(|| {
                if slot == 0 {
                    self.config.client_name.clone().into_bytes()
                } else {
                    Vec::new()
                }
            });
            players.push(info);
        }

        let packet = protocol::ConnectPacket {
            version: if self.server_version != 0 { self.server_version } else { self.config.host_version },
            auth_protocol,
            challenge,
            // the name travels in the user-info block; the field stays empty
            name: String::new(),
            password: self.config.password.clone(),
            players,
            low_violence: self.config.low_violence,
            reservation_cookie: self.reservation_cookie,
            platform: self.config.platform,
            key: self.connect_key_section(remote),
            auth,
        };

        let wire = match packet.write() {
            Ok(wire) => wire,
            Err(WireError::Oversize { size }) => {
                // deterministic local bug, never handed to the transport
                warn!("client connect packet too large for {}: {} bytes", remote, size);
                self.fail_connect(ConnectError::PacketTooLarge { size });
                return;
            }
            Err(err) => {
                warn!("failed to build connect packet for {}: {}", remote, err);
                return;
            }
        };

        debug!("sending client connect packet to {}, {} bytes", remote, wire.len());
        if let Err(err) = self.socket.send_to(&wire, remote.socket_addr()) {
            warn!("connect packet send to {} failed: {}", remote, err);
        }

        // mark time and challenge for retransmit matching
        self.attempt.connect_time = Some(now);
        self.attempt.challenge = challenge;
        self.host_id = host_id;
    }

    fn connect_key_section(&self, remote: Address) -> KeySection {
        if self.deferred.encryption_key != 0 {
            let id = self.deferred.encryption_key;
            let exchange = match self.key_cache.lookup(id) {
                Some(blob) => blob.get(KEY_LEN..).unwrap_or(&[]).to_vec(),
                // key aged out of the cache; the host sees a bare id
                None => Vec::new(),
            };
            return KeySection::Key { id, exchange };
        }
        match self.certificates.lookup(&remote.to_string()) {
            Some(payload) if payload.len() > CERT_METADATA_LEN => {
                let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                if id == 0 {
                    return KeySection::None;
                }
                KeySection::Key { id, exchange: payload[CERT_METADATA_LEN..].to_vec() }
            }
            _ => KeySection::None,
        }
    }

    fn on_connection(&mut self, now: Instant, from: Address, body: &[u8]) {
        if self.signon != SignonState::Challenge {
            return;
        }
        let expected = match self.deferred.remote {
            Some(r) => r,
            None => return,
        };
        if !from.matches(&expected) {
            return;
        }
        let key_id = match protocol::read_connection_response(body) {
            Ok(id) => id,
            Err(_) => return,
        };
        // the host must echo a key id exactly when we negotiated one
        let expecting_key = self.deferred.encryption_key != 0
            || self.certificates.contains(&from.to_string());
        if (key_id != 0) == expecting_key {
            self.full_connect(now, from, key_id);
        }
    }

    fn on_reject(&mut self, from: Address, body: &[u8]) {
        if self.signon != SignonState::Challenge {
            return;
        }
        let reason = match protocol::read_connection_reject(body) {
            Ok(r) => r,
            Err(_) => return,
        };
        if reason.starts_with("ConnectRedirectAddress:") {
            let redirect = &reason["ConnectRedirectAddress:".len()..];
            info!("connection redirected to {}", redirect);
            self.remotes.remove_all();
            self.remotes.add_remote(redirect, "public");
            self.signon = SignonState::Challenge;
            self.attempt.connect_time = None;
            self.attempt.retries = 0;
            self.attempt.retry_limit = self.config.retry_limit();
            self.server_redirect = true;
            return;
        }
        info!("connection rejected by {}: {}", from, reason);
        self.fail_connect(ConnectError::Rejected(reason));
    }

    /// Finishes the handshake: resolves the session key, hands the session
    /// to the reliable stream layer and marks the client connected.
    fn full_connect(&mut self, now: Instant, remote: Address, key_id: i32) {
        let session_key = self.resolve_session_key(remote, key_id);

        // bump so we don't immediately resend a connect request
        self.attempt.connect_time = Some(now);
        // a command may go out right away
        self.next_cmd_time = Some(now);
        // the reservation that got us the slot is spent
        self.reservation_cookie = 0;
        self.server_redirect = false;

        self.set_signon_state(SignonState::Connected, EPOCH_UNKNOWN);
        self.events.push_back(ClientEvent::Connected {
            remote,
            challenge: self.attempt.challenge,
            session_key,
        });
    }

    fn resolve_session_key(&self, remote: Address, key_id: i32) -> Option<Vec<u8>> {
        if key_id == 0 {
            return None;
        }
        if let Some(blob) = self.key_cache.lookup(key_id) {
            return blob.get(..KEY_LEN).map(<[u8]>::to_vec);
        }
        let payload = self.certificates.lookup(&remote.to_string())?;
        if payload.len() > CERT_METADATA_LEN {
            payload.get(4..4 + KEY_LEN).map(<[u8]>::to_vec)
        } else {
            None
        }
    }

    /// Applies a server-driven signon transition, enforcing ordering and
    /// epoch invariants. Returns `false` (state unchanged) on violation.
    /// Transitions to `None` are always legal; replay mode skips the
    /// checks entirely.
    pub fn set_signon_state(&mut self, state: SignonState, epoch: i32) -> bool {
        if state != SignonState::None && !self.replay {
            if state <= self.signon {
                warn!("received signon {:?} when at {:?}", state, self.signon);
                return false;
            }
            if epoch != self.server_epoch
                && epoch != EPOCH_UNKNOWN
                && self.server_epoch != EPOCH_UNKNOWN
            {
                warn!("received wrong server epoch {} when at {}", epoch, self.server_epoch);
                return false;
            }
        }

        if self.signon < SignonState::Connected && state >= SignonState::Connected {
            // in game now: the direct-connect record is spent, and keys
            // accumulated across past negotiations can be trimmed
            self.direct_connect = None;
            let purged = self.key_cache.purge_oldest(KEY_CACHE_HIGH_WATER, KEY_CACHE_PURGE_MAX);
            if purged > 0 {
                debug!("purged {} stale session keys", purged);
            }
        }

        self.signon = state;
        true
    }

    fn fail_connect(&mut self, err: ConnectError) {
        warn!("{}", err);
        self.events.push_back(ClientEvent::ConnectFailed(err));
        self.disconnect_with("could not connect", true);
    }

    /// Tears the session down. Idempotent: a second call while already
    /// disconnected does nothing.
    pub fn disconnect(&mut self, show_reconnect_ui: bool) {
        self.disconnect_with("disconnect", show_reconnect_ui);
    }

    fn disconnect_with(&mut self, reason: &str, show_reconnect_ui: bool) {
        self.deferred.active = false;
        self.waiting_for_password = false;
        self.attempt.connect_time = None;
        self.attempt.retries = 0;
        self.host_id = 0;

        if self.signon == SignonState::None {
            return;
        }
        self.set_signon_state(SignonState::None, EPOCH_UNKNOWN);

        // keep the cookie while hopping to a redirected host
        if !self.server_redirect {
            self.reservation_cookie = 0;
        }
        self.next_cmd_time = None;
        self.events.push_back(ClientEvent::Disconnected {
            reason: reason.to_owned(),
            show_reconnect_ui,
        });
    }
}
