use std::time::Duration;

/// Tunables the host application injects at session start.
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum time between connect-packet retransmissions.
    pub resend_interval: Duration,
    /// Total time budget for a connect attempt before giving up.
    pub resend_timeout: Duration,
    /// Reservation-confirmation attempts for the initial stage (one probe
    /// per second).
    pub reservation_attempts: u32,
    /// Attempts for stages past the first.
    pub reservation_extended_attempts: u32,
    /// Embedded verbatim into the connect request.
    pub password: String,
    /// Client display name; used as the default user-info block for the
    /// first player slot when no explicit blocks are installed.
    pub client_name: String,
    /// Local build/version number stamped into every request.
    pub host_version: i32,
    /// Requester identity for reservation probes, zero if unavailable.
    pub client_id: u64,
    /// Hashed product key used under the legacy auth protocol.
    pub key_hash: String,
    pub low_violence: bool,
    /// Platform identifier byte for the connect packet.
    pub platform: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resend_interval: Duration::from_secs(2),
            resend_timeout: Duration::from_secs(10),
            reservation_attempts: 5,
            reservation_extended_attempts: 15,
            password: String::new(),
            client_name: String::new(),
            host_version: 1,
            client_id: 0,
            key_hash: "NOCDKEY".to_owned(),
            low_violence: false,
            platform: 0,
        }
    }
}

impl Config {
    /// Connect retransmissions allowed before the attempt fails. Derived
    /// once at attempt start and held for the attempt's lifetime.
    pub fn retry_limit(&self) -> u32 {
        let interval = self.resend_interval.as_secs_f64().max(0.001);
        (self.resend_timeout.as_secs_f64() / interval).floor() as u32
    }
}

#[test]
fn retry_limit_is_timeout_over_interval() {
    let config = Config {
        resend_interval: Duration::from_secs(2),
        resend_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    assert_eq!(config.retry_limit(), 5);
}
