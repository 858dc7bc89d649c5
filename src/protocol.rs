//! Connectionless wire formats.
//!
//! Every out-of-session datagram opens with a fixed 4-byte marker and a
//! one-byte opcode. Multi-byte fields are little-endian, strings are
//! NUL-terminated. Packet types come in pairs: the client-side builders
//! used by the engine and the host-side counterparts used by tests and
//! tooling.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian as LE, ReadBytesExt};
use thiserror::Error;

/// Marker distinguishing connectionless datagrams from in-session traffic.
pub const CONNECTIONLESS_MARKER: u32 = 0xFFFF_FFFF;

/// Largest datagram the engine will read.
pub const MAX_ROUTABLE_PAYLOAD: usize = 1260;

/// Hard ceiling on a serialized connect request. Exceeding it is a local
/// packaging bug, not a send failure.
pub const MAX_CONNECT_PAYLOAD: usize = 896;

// Opcodes. Client-to-host are lowercase, host-to-client uppercase.
pub const A2S_GET_CHALLENGE: u8 = b'q';
pub const S2C_CHALLENGE: u8 = b'A';
pub const C2S_CONNECT: u8 = b'k';
pub const S2C_CONNECTION: u8 = b'B';
pub const S2C_CONNREJECT: u8 = b'9';
pub const A2S_PING: u8 = b'i';
pub const S2A_PING_RESPONSE: u8 = b'j';
pub const A2S_RESERVE_CHECK: u8 = b'c';
pub const S2A_RESERVE_CHECK_RESPONSE: u8 = b'd';

/// Authenticate with a hashed product key string.
pub const AUTH_PROTOCOL_KEY_HASH: i32 = 2;
/// Authenticate with an opaque ticket from the external identity service.
pub const AUTH_PROTOCOL_TICKET: i32 = 3;

/// Sentinel "players still awaited" count meaning the reservation failed.
pub const RESERVATION_FAILED: u8 = 0x7F;

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("packet truncated")]
    Truncated,
    #[error("connect payload too large: {size} bytes")]
    Oversize { size: usize },
    #[error("missing connectionless marker")]
    BadMarker,
}

impl From<io::Error> for WireError {
    fn from(_: io::Error) -> Self {
        WireError::Truncated
    }
}

/// Checks the marker and splits off the opcode.
pub fn strip_header(packet: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if packet.len() < 5 {
        return Err(WireError::Truncated);
    }
    let marker = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
    if marker != CONNECTIONLESS_MARKER {
        return Err(WireError::BadMarker);
    }
    Ok((packet[4], &packet[5..]))
}

fn begin(opcode: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&CONNECTIONLESS_MARKER.to_le_bytes());
    buf.push(opcode);
    buf
}

fn put_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn get_cstring(cur: &mut Cursor<&[u8]>) -> Result<String, WireError> {
    let mut bytes = Vec::new();
    loop {
        let b = cur.read_u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn get_bytes(cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>, WireError> {
    if len > MAX_ROUTABLE_PAYLOAD {
        return Err(WireError::Truncated);
    }
    let mut v = vec![0u8; len];
    cur.read_exact(&mut v)?;
    Ok(v)
}

/// Challenge/connect request: carries the last challenge number the client
/// knows about (zero on the first attempt) inside the context string.
pub fn challenge_request(challenge: i32) -> Vec<u8> {
    let mut buf = begin(A2S_GET_CHALLENGE);
    put_cstring(&mut buf, &format!("connect0x{:08X}", challenge as u32));
    buf
}

/// Liveness probe.
pub fn ping_request(version: i32, token: u32) -> Vec<u8> {
    let mut buf = begin(A2S_PING);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&token.to_le_bytes());
    buf
}

pub fn ping_response(version: i32, token: u32) -> Vec<u8> {
    let mut buf = begin(S2A_PING_RESPONSE);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&token.to_le_bytes());
    buf
}

/// Reservation-slot confirmation probe.
pub fn reserve_check_request(
    version: i32,
    token: u32,
    stage: u32,
    cookie: u64,
    client_id: u64,
) -> Vec<u8> {
    let mut buf = begin(A2S_RESERVE_CHECK);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&token.to_le_bytes());
    buf.extend_from_slice(&stage.to_le_bytes());
    buf.extend_from_slice(&cookie.to_le_bytes());
    buf.extend_from_slice(&client_id.to_le_bytes());
    buf
}

pub fn reserve_check_response(version: i32, token: u32, stage: u32, awaited: u8) -> Vec<u8> {
    let mut buf = begin(S2A_RESERVE_CHECK_RESPONSE);
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&token.to_le_bytes());
    buf.extend_from_slice(&stage.to_le_bytes());
    buf.push(awaited);
    buf
}

/// Host acceptance of a connect request. A zero key id means the session
/// runs in the clear.
pub fn connection_response(key_id: i32) -> Vec<u8> {
    let mut buf = begin(S2C_CONNECTION);
    buf.extend_from_slice(&key_id.to_le_bytes());
    buf
}

pub fn read_connection_response(body: &[u8]) -> Result<i32, WireError> {
    let mut cur = Cursor::new(body);
    Ok(cur.read_i32::<LE>()?)
}

pub fn connection_reject(reason: &str) -> Vec<u8> {
    let mut buf = begin(S2C_CONNREJECT);
    put_cstring(&mut buf, reason);
    buf
}

pub fn read_connection_reject(body: &[u8]) -> Result<String, WireError> {
    get_cstring(&mut Cursor::new(body))
}

/// Host's answer to a challenge request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeResponse {
    pub challenge: i32,
    pub auth_protocol: i32,
    /// Legacy auth-key size; must be zero under the ticket protocol.
    pub auth_key_size: u16,
    pub host_id: u64,
    pub secure: bool,
    pub context: String,
    /// Present when the context begins with `connect`.
    pub connect: Option<ConnectDetails>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectDetails {
    pub version: i32,
    pub lobby_type: String,
    pub requires_password: bool,
    pub lobby_id: u64,
    pub friends_required: bool,
    pub official: bool,
    pub key_exchange: Option<KeyExchange>,
}

/// Host public key and certificate signature offered for session-key
/// negotiation. The engine never inspects these; they go straight to the
/// external key-exchange collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyExchange {
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl ChallengeResponse {
    pub fn write(&self) -> Vec<u8> {
        let mut buf = begin(S2C_CHALLENGE);
        buf.extend_from_slice(&self.challenge.to_le_bytes());
        buf.extend_from_slice(&self.auth_protocol.to_le_bytes());
        buf.extend_from_slice(&self.auth_key_size.to_le_bytes());
        buf.extend_from_slice(&self.host_id.to_le_bytes());
        buf.push(self.secure as u8);
        put_cstring(&mut buf, &self.context);
        if let Some(c) = &self.connect {
            buf.extend_from_slice(&c.version.to_le_bytes());
            put_cstring(&mut buf, &c.lobby_type);
            buf.push(c.requires_password as u8);
            buf.extend_from_slice(&c.lobby_id.to_le_bytes());
            buf.push(c.friends_required as u8);
            buf.push(c.official as u8);
            match &c.key_exchange {
                Some(kx) => {
                    buf.push(1);
                    buf.extend_from_slice(&(kx.public_key.len() as i32).to_le_bytes());
                    buf.extend_from_slice(&kx.public_key);
                    buf.extend_from_slice(&(kx.signature.len() as i32).to_le_bytes());
                    buf.extend_from_slice(&kx.signature);
                }
                None => buf.push(0),
            }
        }
        buf
    }

    pub fn read(body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(body);
        let challenge = cur.read_i32::<LE>()?;
        let auth_protocol = cur.read_i32::<LE>()?;
        let auth_key_size = cur.read_u16::<LE>()?;
        let host_id = cur.read_u64::<LE>()?;
        let secure = cur.read_u8()? != 0;
        let context = get_cstring(&mut cur)?;

        let connect = if context.starts_with("connect") {
            let version = cur.read_i32::<LE>()?;
            let lobby_type = get_cstring(&mut cur)?;
            let requires_password = cur.read_u8()? != 0;
            let lobby_id = cur.read_u64::<LE>()?;
            let friends_required = cur.read_u8()? != 0;
            let official = cur.read_u8()? != 0;
            let key_exchange = if cur.read_u8()? != 0 {
                let pub_len = cur.read_i32::<LE>()?;
                let public_key = get_bytes(&mut cur, pub_len.max(0) as usize)?;
                let sig_len = cur.read_i32::<LE>()?;
                let signature = get_bytes(&mut cur, sig_len.max(0) as usize)?;
                Some(KeyExchange { public_key, signature })
            } else {
                None
            };
            Some(ConnectDetails {
                version,
                lobby_type,
                requires_password,
                lobby_id,
                friends_required,
                official,
                key_exchange,
            })
        } else {
            None
        };

        Ok(ChallengeResponse {
            challenge,
            auth_protocol,
            auth_key_size,
            host_id,
            secure,
            context,
            connect,
        })
    }
}

/// Encryption-key section of a connect request.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySection {
    None,
    Key { id: i32, exchange: Vec<u8> },
}

/// Authentication trailer of a connect request.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthTrailer {
    KeyHash(String),
    Ticket(Vec<u8>),
}

/// The connect request proper.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPacket {
    pub version: i32,
    pub auth_protocol: i32,
    pub challenge: i32,
    pub name: String,
    pub password: String,
    /// One opaque user-info block per connecting player.
    pub players: Vec<Vec<u8>>,
    pub low_violence: bool,
    pub reservation_cookie: u64,
    pub platform: u8,
    pub key: KeySection,
    pub auth: AuthTrailer,
}

impl ConnectPacket {
    /// Serializes, enforcing the [`MAX_CONNECT_PAYLOAD`] ceiling. An
    /// oversize packet is never handed to the transport.
    pub fn write(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = begin(C2S_CONNECT);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.auth_protocol.to_le_bytes());
        buf.extend_from_slice(&self.challenge.to_le_bytes());
        put_cstring(&mut buf, &self.name);
        put_cstring(&mut buf, &self.password);
        buf.push(self.players.len() as u8);
        for info in &self.players {
            buf.extend_from_slice(&(info.len() as u16).to_le_bytes());
            buf.extend_from_slice(info);
        }
        buf.push(self.low_violence as u8);
        buf.extend_from_slice(&self.reservation_cookie.to_le_bytes());
        buf.push(self.platform);
        match &self.key {
            KeySection::None => buf.extend_from_slice(&0i32.to_le_bytes()),
            KeySection::Key { id, exchange } => {
                buf.extend_from_slice(&id.to_le_bytes());
                buf.extend_from_slice(&(exchange.len() as i32).to_le_bytes());
                buf.extend_from_slice(exchange);
            }
        }
        match &self.auth {
            AuthTrailer::KeyHash(hash) => put_cstring(&mut buf, hash),
            AuthTrailer::Ticket(ticket) => {
                buf.extend_from_slice(&(ticket.len() as u16).to_le_bytes());
                buf.extend_from_slice(ticket);
            }
        }
        if buf.len() > MAX_CONNECT_PAYLOAD {
            return Err(WireError::Oversize { size: buf.len() });
        }
        Ok(buf)
    }

    /// Host-side decode, used by tests and tooling.
    pub fn read(body: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(body);
        let version = cur.read_i32::<LE>()?;
        let auth_protocol = cur.read_i32::<LE>()?;
        let challenge = cur.read_i32::<LE>()?;
        let name = get_cstring(&mut cur)?;
        let password = get_cstring(&mut cur)?;
        let num_players = cur.read_u8()?;
        let mut players = Vec::with_capacity(num_players as usize);
        for _ in 0..num_players {
            let len = cur.read_u16::<LE>()? as usize;
            players.push(get_bytes(&mut cur, len)?);
        }
        let low_violence = cur.read_u8()? != 0;
        let reservation_cookie = cur.read_u64::<LE>()?;
        let platform = cur.read_u8()?;
        let key_id = cur.read_i32::<LE>()?;
        let key = if key_id != 0 {
            let len = cur.read_i32::<LE>()?;
            KeySection::Key { id: key_id, exchange: get_bytes(&mut cur, len.max(0) as usize)? }
        } else {
            KeySection::None
        };
        let auth = if auth_protocol == AUTH_PROTOCOL_TICKET {
            let len = cur.read_u16::<LE>()? as usize;
            AuthTrailer::Ticket(get_bytes(&mut cur, len)?)
        } else {
            AuthTrailer::KeyHash(get_cstring(&mut cur)?)
        };
        Ok(ConnectPacket {
            version,
            auth_protocol,
            challenge,
            name,
            password,
            players,
            low_violence,
            reservation_cookie,
            platform,
            key,
            auth,
        })
    }
}

#[test]
fn header_rw() {
    let pkt = ping_request(100, 42);
    let (opcode, body) = strip_header(&pkt).unwrap();
    assert_eq!(opcode, A2S_PING);
    assert_eq!(body.len(), 8);
    assert_eq!(strip_header(&[0, 0, 0, 0, b'i']), Err(WireError::BadMarker));
    assert_eq!(strip_header(&[0xFF; 4]), Err(WireError::Truncated));
}

#[test]
fn connect_packet_rw() {
    let pkt = ConnectPacket {
        version: 2077,
        auth_protocol: AUTH_PROTOCOL_TICKET,
        challenge: -12345,
        name: String::new(),
        password: "hunter2".to_owned(),
        players: vec![b"slot0".to_vec(), b"slot1".to_vec()],
        low_violence: false,
        reservation_cookie: 0xDEAD_BEEF_CAFE_F00D,
        platform: 1,
        key: KeySection::Key { id: 7, exchange: vec![9; 48] },
        auth: AuthTrailer::Ticket(vec![3; 128]),
    };
    let wire = pkt.write().unwrap();
    assert!(wire.len() <= MAX_CONNECT_PAYLOAD);
    let (opcode, body) = strip_header(&wire).unwrap();
    assert_eq!(opcode, C2S_CONNECT);
    assert_eq!(ConnectPacket::read(body).unwrap(), pkt);
}

#[test]
fn connect_packet_ceiling() {
    let pkt = ConnectPacket {
        version: 2077,
        auth_protocol: AUTH_PROTOCOL_KEY_HASH,
        challenge: 0,
        name: String::new(),
        password: String::new(),
        players: vec![vec![0u8; 600]],
        low_violence: false,
        reservation_cookie: 0,
        platform: 0,
        key: KeySection::Key { id: 1, exchange: vec![0; 400] },
        auth: AuthTrailer::KeyHash("NOCDKEY".to_owned()),
    };
    match pkt.write() {
        Err(WireError::Oversize { size }) => assert!(size > MAX_CONNECT_PAYLOAD),
        other => panic!("expected oversize error, got {:?}", other.map(|v| v.len())),
    }
}

#[test]
fn challenge_response_rw() {
    let resp = ChallengeResponse {
        challenge: 777,
        auth_protocol: AUTH_PROTOCOL_TICKET,
        auth_key_size: 0,
        host_id: 0x1122_3344_5566_7788,
        secure: true,
        context: "connect-granted".to_owned(),
        connect: Some(ConnectDetails {
            version: 2077,
            lobby_type: "public".to_owned(),
            requires_password: false,
            lobby_id: 99,
            friends_required: false,
            official: true,
            key_exchange: Some(KeyExchange {
                public_key: vec![1; 64],
                signature: vec![2; 32],
            }),
        }),
    };
    let wire = resp.write();
    let (opcode, body) = strip_header(&wire).unwrap();
    assert_eq!(opcode, S2C_CHALLENGE);
    assert_eq!(ChallengeResponse::read(body).unwrap(), resp);
}

#[test]
fn truncated_challenge_response() {
    let wire = ChallengeResponse {
        challenge: 1,
        auth_protocol: AUTH_PROTOCOL_KEY_HASH,
        auth_key_size: 0,
        host_id: 0,
        secure: false,
        context: "connect".to_owned(),
        connect: Some(ConnectDetails {
            version: 1,
            lobby_type: String::new(),
            requires_password: false,
            lobby_id: 0,
            friends_required: false,
            official: false,
            key_exchange: None,
        }),
    };
    let mut wire = wire.write();
    wire.truncate(wire.len() - 4);
    let (_, body) = strip_header(&wire).unwrap();
    assert_eq!(ChallengeResponse::read(body), Err(WireError::Truncated));
}
