use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ping::message::DecodeError;

/// Size in bytes of an encoded timestamp.
pub const TIMESTAMP_LEN: usize = 8;

/// A point in time as the number of nanoseconds elapsed since the unix epoch.
///
/// Echo probes carry it big-endian at the start of their payload so the round
/// trip time can be computed from the reply alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    /// Saturates at the bounds of `i64` nanoseconds (roughly year 1677 to 2262).
    pub fn from_system_time(time: SystemTime) -> Self {
        let nanos = match time.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
            Err(e) => i64::try_from(e.duration().as_nanos())
                .map(|n| -n)
                .unwrap_or(i64::MIN),
        };
        Self(nanos)
    }

    pub fn to_system_time(self) -> SystemTime {
        let offset = Duration::from_nanos(self.0.unsigned_abs());
        if self.0 >= 0 {
            UNIX_EPOCH + offset
        } else {
            UNIX_EPOCH - offset
        }
    }

    pub fn encode(self) -> [u8; TIMESTAMP_LEN] {
        self.0.to_be_bytes()
    }

    /// Reads a timestamp from the first 8 bytes of `data`. Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let bytes: [u8; TIMESTAMP_LEN] = data
            .get(..TIMESTAMP_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(DecodeError::Truncated {
                what: "timestamp",
                expected: TIMESTAMP_LEN,
                actual: data.len(),
            })?;
        Ok(Self(i64::from_be_bytes(bytes)))
    }

    /// Time elapsed between `self` and `later`, clamped at zero when the clock went backwards.
    pub fn elapsed_until(self, later: SystemTime) -> Duration {
        later
            .duration_since(self.to_system_time())
            .unwrap_or(Duration::ZERO)
    }
}
