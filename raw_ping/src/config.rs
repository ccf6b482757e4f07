use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::ping::message::DEFAULT_PAYLOAD_SIZE;
use crate::ping::PingError;
use crate::timestamp::TIMESTAMP_LEN;

pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_TCP_SOURCE_PORT: u16 = 23333;

/// Options shared by the ICMP and TCP pingers.
///
/// Fields that only one of them reads are documented as such. Every field has
/// a default, so a partial JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seeds the ICMP identifier and the TCP initial sequence base. Random when unset.
    pub identifier_seed: Option<u64>,
    /// How long `ping` waits for a reply.
    pub timeout_ms: u64,
    /// Read deadline of the listener; bounds how long `close` takes.
    /// Defaults to the timeout, capped at 100ms.
    pub poll_interval_ms: Option<u64>,
    /// ICMP only. Echo payload length, timestamp included.
    pub payload_size: usize,
    pub ttl: Option<u8>,
    /// Size of the raw socket receive buffer.
    pub buffer_size: usize,
    /// Stop the listener after this many read errors in a row. Never stops when unset.
    pub max_consecutive_read_errors: Option<u32>,
    /// TCP only. Fixed source port of every SYN; replies are matched on it.
    pub source_port: u16,
    /// TCP only. Address used in the checksum pseudo-header. Looked up from
    /// the routing table per destination when unset.
    pub source_addr: Option<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identifier_seed: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: None,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            ttl: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_consecutive_read_errors: None,
            source_port: DEFAULT_TCP_SOURCE_PORT,
            source_addr: None,
        }
    }
}

impl Config {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        match self.poll_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.timeout().min(DEFAULT_POLL_INTERVAL),
        }
    }

    pub fn validate(&self) -> Result<(), PingError> {
        if self.timeout_ms == 0 {
            return Err(PingError::InvalidConfig("timeout_ms must be positive".into()));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(PingError::InvalidConfig(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.payload_size < TIMESTAMP_LEN {
            return Err(PingError::InvalidConfig(format!(
                "payload_size must be at least {} bytes",
                TIMESTAMP_LEN
            )));
        }
        if self.buffer_size == 0 {
            return Err(PingError::InvalidConfig("buffer_size must be positive".into()));
        }
        if self.source_port == 0 {
            return Err(PingError::InvalidConfig("source_port must not be 0".into()));
        }
        Ok(())
    }
}
