//! Raw-socket reachability probes.
//!
//! [`ping::icmp::Pinger`] sends ICMP echo requests, [`ping::tcp::Pinger`]
//! sends half-open TCP SYNs. Each owns one raw socket and one listener thread
//! that reads everything arriving on it, matches replies to the probe that
//! caused them and wakes the waiting caller. Probes may be issued
//! concurrently from any number of tasks.
//!
//! ```no_run
//! use raw_ping::{ping::icmp::Pinger, Config};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), raw_ping::PingError> {
//! let pinger = Pinger::new(&Config::with_timeout(Duration::from_secs(3)))?;
//! let rtt = pinger.ping("127.0.0.1".parse().unwrap()).await?;
//! println!("rtt={:?}", rtt);
//! pinger.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod listener;
pub mod pending;
pub mod ping;
pub mod timestamp;
pub mod transport;

pub use config::Config;
pub use ping::{PingError, TimeExceededReason, UnreachableReason};
pub use timestamp::Timestamp;
