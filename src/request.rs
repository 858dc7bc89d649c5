//! Retry/timeout engine for one outstanding request to one remote host.
//!
//! Each request owns a token that changes on every (re)send; a response is
//! accepted only when it arrives from the expected address carrying the
//! most recent token, checked before any body parsing. Two variants exist:
//! the liveness probe and the reservation-slot confirmation.

use std::io::Cursor;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian as LE, ReadBytesExt};
use log::{debug, warn};
use rand::{thread_rng, Rng};

use crate::addr::Address;
use crate::protocol::{self, RESERVATION_FAILED};
use crate::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Running,
    Succeeded,
    Failed,
}

/// Completion notification. Fired exactly once on a terminal transition;
/// the reservation confirmation additionally fires on every interim
/// "players still awaited" update while remaining `Running`.
pub trait RequestCallback {
    fn finished(&mut self, request: &ServerRequest);
}

impl<F: FnMut(&ServerRequest)> RequestCallback for F {
    fn finished(&mut self, request: &ServerRequest) {
        self(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    ReserveCheck { cookie: u64, stage: u32, client_id: u64 },
}

const PING_ATTEMPTS: u32 = 3;
const PING_TIMEOUT: Duration = Duration::from_secs(5);
// Reservation probes fire once per second, as many times as the stage's
// configured budget allows.
const RESERVE_PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub struct ServerRequest {
    kind: RequestKind,
    state: RequestState,
    remote: Address,
    token: u32,
    attempts: u32,
    max_attempts: u32,
    timeout: Duration,
    last_send: Option<Instant>,
    result: u64,
    callback: Option<Box<dyn RequestCallback>>,
}

impl ServerRequest {
    /// Liveness probe: 3 attempts, 5 seconds each.
    pub fn ping(remote: Address, callback: Box<dyn RequestCallback>) -> Self {
        Self::new(RequestKind::Ping, remote, PING_ATTEMPTS, PING_TIMEOUT, callback)
    }

    /// Reservation-slot confirmation; `attempts` comes from the stage's
    /// configured duration.
    pub fn reserve_check(
        remote: Address,
        cookie: u64,
        stage: u32,
        client_id: u64,
        attempts: u32,
        callback: Box<dyn RequestCallback>,
    ) -> Self {
        Self::new(
            RequestKind::ReserveCheck { cookie, stage, client_id },
            remote,
            attempts,
            RESERVE_PROBE_INTERVAL,
            callback,
        )
    }

    fn new(
        kind: RequestKind,
        remote: Address,
        max_attempts: u32,
        timeout: Duration,
        callback: Box<dyn RequestCallback>,
    ) -> Self {
        Self {
            kind,
            state: RequestState::Running,
            remote,
            token: thread_rng().gen(),
            attempts: 0,
            max_attempts,
            timeout,
            last_send: None,
            result: 0,
            callback: Some(callback),
        }
    }

    pub fn kind(&self) -> RequestKind { self.kind }
    pub fn state(&self) -> RequestState { self.state }
    pub fn remote(&self) -> Address { self.remote }
    pub fn result(&self) -> u64 { self.result }
    pub fn attempts(&self) -> u32 { self.attempts }

    pub fn is_finished(&self) -> bool {
        self.state != RequestState::Running
    }

    /// Resends or expires the request. Terminal states are sticky.
    pub fn update<S: Socket>(&mut self, now: Instant, socket: &S, version: i32) {
        if self.state != RequestState::Running {
            return;
        }

        if let Some(last) = self.last_send {
            if now.duration_since(last) < self.timeout {
                return;
            }
        }

        if self.attempts >= self.max_attempts {
            self.state = RequestState::Failed;
            self.notify();
            return;
        }

        self.token = thread_rng().gen();
        let packet = match self.kind {
            RequestKind::Ping => {
                debug!("pinging {}", self.remote);
                protocol::ping_request(version, self.token)
            }
            RequestKind::ReserveCheck { cookie, stage, client_id } => {
                protocol::reserve_check_request(version, self.token, stage, cookie, client_id)
            }
        };
        if let Err(err) = socket.send_to(&packet, self.remote.socket_addr()) {
            warn!("request send to {} failed: {}", self.remote, err);
        }
        self.last_send = Some(now);
        self.attempts += 1;
    }

    /// The sole defense against spoofed or stale packets; must pass before
    /// any response body is parsed.
    pub fn is_valid_response(&self, from: Address, token: u32) -> bool {
        if self.state != RequestState::Running {
            // not expecting any responses
            return false;
        }
        if !from.matches(&self.remote) {
            return false;
        }
        if token != self.token {
            // response to an earlier transmission
            return false;
        }
        true
    }

    /// Handles a routed response body (everything past version and token).
    pub fn handle_response(
        &mut self,
        now: Instant,
        from: Address,
        host_version: i32,
        token: u32,
        body: &[u8],
        expected_version: i32,
    ) {
        if host_version != expected_version {
            return;
        }
        if !self.is_valid_response(from, token) {
            return;
        }

        match self.kind {
            RequestKind::Ping => {
                let rtt = self
                    .last_send
                    .map(|t| now.duration_since(t))
                    .unwrap_or_default();
                self.response_received(rtt.as_millis() as u64);
            }
            RequestKind::ReserveCheck { .. } => {
                let mut cur = Cursor::new(body);
                let stage = match cur.read_u32::<LE>() {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let awaited = match cur.read_u8() {
                    Ok(v) => v,
                    Err(_) => return,
                };
                if awaited == 0 {
                    debug!("host confirmed all players for reservation stage {}", stage);
                    self.response_received(0);
                } else if awaited == RESERVATION_FAILED {
                    self.state = RequestState::Failed;
                    self.notify();
                } else {
                    debug!("reservation stage {} still awaiting {} players", stage, awaited);
                    // stay Running so the probe keeps polling for updates
                    self.result = u64::from(awaited);
                    self.notify();
                }
            }
        }
    }

    /// Records a successful result. A no-op on non-`Running` instances.
    pub fn response_received(&mut self, result: u64) {
        if self.state == RequestState::Running {
            self.state = RequestState::Succeeded;
            self.result = result;
            self.notify();
        }
    }

    fn notify(&mut self) {
        // Taken out for the call so the callback sees a shared borrow only.
        if let Some(mut cb) = self.callback.take() {
            cb.finished(self);
            self.callback = Some(cb);
        }
    }
}

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}
