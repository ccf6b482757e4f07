pub mod icmp;
pub mod message;
pub mod tcp;

use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::io;
use thiserror::Error;

pub type IcmpCode = pnet::packet::icmp::IcmpCode;
pub type IcmpType = pnet::packet::icmp::IcmpType;

pub use message::DecodeError;

#[derive(Debug, Error)]
pub enum PingError {
    #[error("timeout")]
    Timeout,
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(UnreachableReason),
    #[error("time exceeded: {0}")]
    TimeExceeded(TimeExceededReason),
    #[error("port closed")]
    PortClosed,
    #[error("failed to encode probe: {0}")]
    Encode(String),
    #[error("reply did not decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to send probe: {0}")]
    Transport(#[source] io::Error),
    #[error("failed to open raw socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to start listener thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("pinger closed")]
    Closed,
    #[error("sequence number still in flight")]
    Collision,
}

/// Why a router or the target refused the probe (ICMP type 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableReason {
    Network,
    Host,
    Protocol,
    Port,
    FragmentationNeeded,
    SourceRouteFailed,
    Other(u8),
}

impl From<IcmpCode> for UnreachableReason {
    fn from(code: IcmpCode) -> Self {
        match code.0 {
            0 => Self::Network,
            1 => Self::Host,
            2 => Self::Protocol,
            3 => Self::Port,
            4 => Self::FragmentationNeeded,
            5 => Self::SourceRouteFailed,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for UnreachableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network unreachable"),
            Self::Host => write!(f, "host unreachable"),
            Self::Protocol => write!(f, "protocol unreachable"),
            Self::Port => write!(f, "port unreachable"),
            Self::FragmentationNeeded => write!(f, "fragmentation needed"),
            Self::SourceRouteFailed => write!(f, "source route failed"),
            Self::Other(code) => write!(f, "unreachable (code {})", code),
        }
    }
}

/// Why a router discarded the probe (ICMP type 11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExceededReason {
    TtlExceeded,
    FragmentReassembly,
    Other(u8),
}

impl From<IcmpCode> for TimeExceededReason {
    fn from(code: IcmpCode) -> Self {
        match code.0 {
            0 => Self::TtlExceeded,
            1 => Self::FragmentReassembly,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for TimeExceededReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TtlExceeded => write!(f, "ttl exceeded in transit"),
            Self::FragmentReassembly => write!(f, "fragment reassembly time exceeded"),
            Self::Other(code) => write!(f, "time exceeded (code {})", code),
        }
    }
}

/// Draws from a generator seeded with `seed`, or from the thread generator when unset.
pub(crate) fn seeded_random<T>(seed: Option<u64>) -> T
where
    Standard: Distribution<T>,
{
    match seed {
        Some(seed) => Standard.sample(&mut StdRng::seed_from_u64(seed)),
        None => rand::random(),
    }
}
