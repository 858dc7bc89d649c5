//! End-to-end handshake exercises over the simulated network: a scripted
//! host on one socket, a real [`ClientState`] on the other.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use signon::protocol::{
    self, AuthTrailer, ChallengeResponse, ConnectDetails, ConnectPacket, KeyExchange, KeySection,
    AUTH_PROTOCOL_KEY_HASH, A2S_GET_CHALLENGE, A2S_PING, A2S_RESERVE_CHECK, C2S_CONNECT,
};
use signon::{
    simulator, Address, ClientEvent, ClientState, Config, ConnectError, RequestState,
    ServerRequest, SessionKeyExchange, SignonState, KEY_LEN,
};

struct Host {
    socket: simulator::Socket,
}

impl Host {
    fn new() -> Self {
        Self { socket: simulator::Socket::bind_any() }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    fn addr_string(&self) -> String {
        self.addr().to_string()
    }

    fn recv(&self) -> Option<(u8, Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 1400];
        match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let (opcode, body) = protocol::strip_header(&buf[..len]).unwrap();
                Some((opcode, body.to_vec(), from))
            }
            Err(_) => None,
        }
    }

    fn drain(&self) -> Vec<(u8, Vec<u8>, SocketAddr)> {
        let mut out = Vec::new();
        while let Some(p) = self.recv() {
            out.push(p);
        }
        out
    }

    fn send(&self, to: SocketAddr, packet: &[u8]) {
        self.socket.send_to(packet, to).unwrap();
    }
}

fn client() -> ClientState<simulator::Socket> {
    client_with(Config::default())
}

fn client_with(config: Config) -> ClientState<simulator::Socket> {
    ClientState::new(simulator::Socket::bind_any(), config)
}

fn challenge_granted(
    challenge: i32,
    requires_password: bool,
    key_exchange: Option<KeyExchange>,
) -> Vec<u8> {
    ChallengeResponse {
        challenge,
        auth_protocol: AUTH_PROTOCOL_KEY_HASH,
        auth_key_size: 0,
        host_id: 0x42,
        secure: false,
        context: "connect-granted".to_owned(),
        connect: Some(ConnectDetails {
            version: Config::default().host_version,
            lobby_type: String::new(),
            requires_password,
            lobby_id: 0,
            friends_required: false,
            official: false,
            key_exchange,
        }),
    }
    .write()
}

#[test]
fn plaintext_handshake_completes() {
    let host = Host::new();
    let mut c = client();
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);

    let (opcode, body, client_addr) = host.recv().unwrap();
    assert_eq!(opcode, A2S_GET_CHALLENGE);
    // first request carries no prior challenge
    assert_eq!(body, b"connect0x00000000\0");

    host.send(client_addr, &challenge_granted(777, false, None));
    c.run_frame(t0 + Duration::from_millis(50));

    let (opcode, body, _) = host.recv().unwrap();
    assert_eq!(opcode, C2S_CONNECT);
    let pkt = ConnectPacket::read(&body).unwrap();
    assert_eq!(pkt.challenge, 777);
    assert_eq!(pkt.key, KeySection::None);
    assert_eq!(pkt.auth, AuthTrailer::KeyHash("NOCDKEY".to_owned()));
    assert_eq!(pkt.players.len(), 1);

    host.send(client_addr, &protocol::connection_response(0));
    c.run_frame(t0 + Duration::from_millis(100));

    assert_eq!(c.signon_state(), SignonState::Connected);
    match c.poll_event() {
        Some(ClientEvent::Connected { remote, challenge, session_key }) => {
            assert_eq!(remote, Address::Ip(host.addr()));
            assert_eq!(challenge, 777);
            assert_eq!(session_key, None);
        }
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[test]
fn unanswered_attempt_retries_then_fails() {
    let host = Host::new();
    let mut c = client();
    c.connect(&host.addr_string(), "", "server_browser");

    // default tuning: 2s interval, 10s budget, so 5 requests then failure
    let t0 = Instant::now();
    for sec in 0..=10 {
        c.run_frame(t0 + Duration::from_secs(sec));
    }

    let requests = host.drain();
    assert_eq!(requests.len(), 5);
    assert!(requests.iter().all(|(op, _, _)| *op == A2S_GET_CHALLENGE));

    assert_eq!(c.signon_state(), SignonState::None);
    match c.poll_event() {
        Some(ClientEvent::ConnectFailed(ConnectError::RetriesExhausted { retries: 5 })) => {}
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    match c.poll_event() {
        Some(ClientEvent::Disconnected { .. }) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }
}

#[test]
fn oversize_connect_packet_is_never_sent() {
    let host = Host::new();
    let mut c = client_with(Config {
        password: "x".repeat(1000),
        ..Config::default()
    });
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    host.send(client_addr, &challenge_granted(5, false, None));
    c.run_frame(t0 + Duration::from_millis(50));

    // the oversize packet stayed local and the attempt died
    assert!(host.recv().is_none());
    assert_eq!(c.signon_state(), SignonState::None);
    match c.poll_event() {
        Some(ClientEvent::ConnectFailed(ConnectError::PacketTooLarge { size })) => {
            assert!(size > protocol::MAX_CONNECT_PAYLOAD);
        }
        other => panic!("expected PacketTooLarge, got {:?}", other),
    }
}

struct FixedExchange;

impl SessionKeyExchange for FixedExchange {
    fn establish(
        &mut self,
        _official: bool,
        _remote: Address,
        public_key: &[u8],
        signature: &[u8],
    ) -> Option<Vec<u8>> {
        assert_eq!(public_key, &[7u8; 64][..]);
        assert_eq!(signature, &[8u8; 32][..]);
        let mut blob = vec![0xAB; KEY_LEN];
        blob.extend_from_slice(&[0xCD; 16]);
        Some(blob)
    }
}

#[test]
fn encrypted_handshake_uses_negotiated_key() {
    let host = Host::new();
    let mut c = client();
    c.set_key_exchange(Box::new(FixedExchange));
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    let kx = KeyExchange { public_key: vec![7; 64], signature: vec![8; 32] };
    host.send(client_addr, &challenge_granted(9, false, Some(kx)));
    c.run_frame(t0 + Duration::from_millis(50));

    let (opcode, body, _) = host.recv().unwrap();
    assert_eq!(opcode, C2S_CONNECT);
    let pkt = ConnectPacket::read(&body).unwrap();
    // encrypted exchange travels, the key itself never leaves the client
    assert_eq!(pkt.key, KeySection::Key { id: 1, exchange: vec![0xCD; 16] });

    host.send(client_addr, &protocol::connection_response(1));
    c.run_frame(t0 + Duration::from_millis(100));

    match c.poll_event() {
        Some(ClientEvent::Connected { session_key, .. }) => {
            assert_eq!(session_key, Some(vec![0xAB; KEY_LEN]));
        }
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[test]
fn plaintext_acceptance_after_key_negotiation_is_ignored() {
    let host = Host::new();
    let mut c = client();
    c.set_key_exchange(Box::new(FixedExchange));
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    let kx = KeyExchange { public_key: vec![7; 64], signature: vec![8; 32] };
    host.send(client_addr, &challenge_granted(9, false, Some(kx)));
    c.run_frame(t0 + Duration::from_millis(50));
    host.recv().unwrap(); // connect packet

    // a key was negotiated, so an acceptance without one is inconsistent
    host.send(client_addr, &protocol::connection_response(0));
    c.run_frame(t0 + Duration::from_millis(100));
    assert_eq!(c.signon_state(), SignonState::Challenge);
    assert!(c.poll_event().is_none());
}

#[test]
fn redirect_carries_reservation_cookie_to_new_host() {
    let host_a = Host::new();
    let host_b = Host::new();
    let mut c = client();
    c.set_reservation_cookie(0x1234_5678);
    c.connect(&host_a.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host_a.recv().unwrap();

    let reject = protocol::connection_reject(&format!("ConnectRedirectAddress:{}", host_b.addr()));
    host_a.send(client_addr, &reject);

    // one frame both absorbs the redirect and challenges the new host
    c.run_frame(t0 + Duration::from_millis(50));
    let (opcode, _, client_addr) = host_b.recv().unwrap();
    assert_eq!(opcode, A2S_GET_CHALLENGE);
    assert_eq!(c.signon_state(), SignonState::Challenge);

    host_b.send(client_addr, &challenge_granted(31, false, None));
    c.run_frame(t0 + Duration::from_millis(100));
    let (_, body, _) = host_b.recv().unwrap();
    let pkt = ConnectPacket::read(&body).unwrap();
    assert_eq!(pkt.reservation_cookie, 0x1234_5678);

    host_b.send(client_addr, &protocol::connection_response(0));
    c.run_frame(t0 + Duration::from_millis(150));
    assert_eq!(c.signon_state(), SignonState::Connected);
    // the cookie is spent once the connection establishes
    assert_eq!(c.reservation_cookie(), 0);
}

#[test]
fn rejection_fails_the_attempt() {
    let host = Host::new();
    let mut c = client();
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    host.send(client_addr, &protocol::connection_reject("Server is full."));
    c.run_frame(t0 + Duration::from_millis(50));

    assert_eq!(c.signon_state(), SignonState::None);
    match c.poll_event() {
        Some(ClientEvent::ConnectFailed(ConnectError::Rejected(reason))) => {
            assert_eq!(reason, "Server is full.");
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[test]
fn password_prompt_pauses_then_resumes_attempt() {
    let host = Host::new();
    let mut c = client();
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    host.send(client_addr, &challenge_granted(0x309, true, None));
    c.run_frame(t0 + Duration::from_millis(50));
    assert_eq!(c.poll_event(), Some(ClientEvent::PasswordRequired));
    // no connect packet while the prompt is up, and no resends either
    c.run_frame(t0 + Duration::from_secs(5));
    assert!(host.recv().is_none());

    c.set_password("letmein");
    c.password_entered(t0 + Duration::from_secs(6));

    // the new request carries the challenge we already hold
    let (opcode, body, _) = host.recv().unwrap();
    assert_eq!(opcode, A2S_GET_CHALLENGE);
    assert_eq!(body, b"connect0x00000309\0");

    host.send(client_addr, &challenge_granted(0x309, true, None));
    c.run_frame(t0 + Duration::from_secs(7));
    let (opcode, body, _) = host.recv().unwrap();
    assert_eq!(opcode, C2S_CONNECT);
    let pkt = ConnectPacket::read(&body).unwrap();
    assert_eq!(pkt.password, "letmein");
}

#[test]
fn certificate_registry_supplies_key_section() {
    let host = Host::new();
    let mut c = client();
    let mut payload = 5i32.to_le_bytes().to_vec();
    payload.extend_from_slice(&[0xEE; KEY_LEN]);
    payload.extend_from_slice(&[0x11; 8]);
    c.register_certificate(&host.addr_string(), &payload);
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    // no key exchange in the challenge; the registered certificate applies
    host.send(client_addr, &challenge_granted(3, false, None));
    c.run_frame(t0 + Duration::from_millis(50));

    let (_, body, _) = host.recv().unwrap();
    let pkt = ConnectPacket::read(&body).unwrap();
    assert_eq!(pkt.key, KeySection::Key { id: 5, exchange: vec![0x11; 8] });

    host.send(client_addr, &protocol::connection_response(5));
    c.run_frame(t0 + Duration::from_millis(100));
    match c.poll_event() {
        Some(ClientEvent::Connected { session_key, .. }) => {
            assert_eq!(session_key, Some(vec![0xEE; KEY_LEN]));
        }
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[test]
fn short_certificate_payload_falls_back_to_plaintext() {
    let host = Host::new();
    let mut c = client();
    // too short to carry an exchange blob past the id and key
    c.register_certificate(&host.addr_string(), &[0u8; 20]);
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();
    host.send(client_addr, &challenge_granted(3, false, None));
    c.run_frame(t0 + Duration::from_millis(50));

    let (_, body, _) = host.recv().unwrap();
    let pkt = ConnectPacket::read(&body).unwrap();
    assert_eq!(pkt.key, KeySection::None);
}

#[test]
fn host_version_mismatch_fails_the_attempt() {
    let host = Host::new();
    let mut c = client();
    c.connect(&host.addr_string(), "", "server_browser");

    let t0 = Instant::now();
    c.run_frame(t0);
    let (_, _, client_addr) = host.recv().unwrap();

    let resp = ChallengeResponse {
        challenge: 1,
        auth_protocol: AUTH_PROTOCOL_KEY_HASH,
        auth_key_size: 0,
        host_id: 0,
        secure: false,
        context: "connect-granted".to_owned(),
        connect: Some(ConnectDetails {
            version: Config::default().host_version + 1,
            lobby_type: String::new(),
            requires_password: false,
            lobby_id: 0,
            friends_required: false,
            official: false,
            key_exchange: None,
        }),
    };
    host.send(client_addr, &resp.write());
    c.run_frame(t0 + Duration::from_millis(50));

    assert!(host.recv().is_none());
    assert_eq!(c.signon_state(), SignonState::None);
    match c.poll_event() {
        Some(ClientEvent::ConnectFailed(ConnectError::VersionMismatch { client, host })) => {
            assert_eq!(host, client + 1);
        }
        other => panic!("expected VersionMismatch, got {:?}", other),
    }
}

#[test]
fn ping_round_trip() {
    let host = Host::new();
    let mut c = client();
    let results: Rc<RefCell<Vec<(RequestState, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let log = results.clone();
    c.ping_server(Address::Ip(host.addr()), move |req: &ServerRequest| {
        log.borrow_mut().push((req.state(), req.result()));
    });

    let t0 = Instant::now();
    c.run_frame(t0);
    let (opcode, body, client_addr) = host.recv().unwrap();
    assert_eq!(opcode, A2S_PING);
    let version = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let token = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);

    host.send(client_addr, &protocol::ping_response(version, token));
    c.run_frame(t0 + Duration::from_millis(37));
    assert_eq!(&*results.borrow(), &[(RequestState::Succeeded, 37)]);
}

#[test]
fn reservation_poll_reports_interim_then_success() {
    let host = Host::new();
    let mut c = client();
    let results: Rc<RefCell<Vec<(RequestState, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let log = results.clone();
    c.check_reservation(Address::Ip(host.addr()), 0xC0FFEE, 1, move |req: &ServerRequest| {
        log.borrow_mut().push((req.state(), req.result()));
    });

    let t0 = Instant::now();
    c.run_frame(t0);
    let (opcode, body, client_addr) = host.recv().unwrap();
    assert_eq!(opcode, A2S_RESERVE_CHECK);
    let version = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let token = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    let stage = u32::from_le_bytes([body[8], body[9], body[10], body[11]]);
    let cookie = u64::from_le_bytes([
        body[12], body[13], body[14], body[15], body[16], body[17], body[18], body[19],
    ]);
    assert_eq!(stage, 1);
    assert_eq!(cookie, 0xC0FFEE);

    // two players still missing
    host.send(client_addr, &protocol::reserve_check_response(version, token, 1, 2));
    c.run_frame(t0 + Duration::from_millis(100));
    assert_eq!(&*results.borrow(), &[(RequestState::Running, 2)]);

    // next probe a second later, then everyone showed up
    c.run_frame(t0 + Duration::from_secs(1));
    let (_, body, _) = host.recv().unwrap();
    let token = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
    host.send(client_addr, &protocol::reserve_check_response(version, token, 1, 0));
    c.run_frame(t0 + Duration::from_millis(1100));
    assert_eq!(
        &*results.borrow(),
        &[(RequestState::Running, 2), (RequestState::Succeeded, 0)]
    );
}
