//! Half-open TCP probing: send a SYN, wait for SYN+ACK (open) or RST (closed),
//! never complete the handshake.

use parking_lot::Mutex;
use pnet::packet::tcp::{self as wire, MutableTcpPacket, TcpFlags, TcpPacket};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::message::DecodeError;
use super::{seeded_random, PingError};
use crate::config::Config;
use crate::listener::{self, Dispatch, Listener, LoopPolicy};
use crate::pending::PendingTable;
use crate::transport::{self, Datagram, Protocol, Sender};

const WINDOW: u16 = 64240;

/// A SYN is identified by our source port and its initial sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynKey {
    pub port: u16,
    pub seq: u32,
}

/// The fields of a TCP header the prober cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub syn: bool,
    pub ack: bool,
    pub rst: bool,
}

impl Segment {
    /// Key of the SYN this segment answers, assuming it was sent from `port`.
    pub fn answers(&self, port: u16) -> Option<SynKey> {
        if self.destination_port != port {
            return None;
        }
        Some(SynKey {
            port,
            seq: self.acknowledgement.wrapping_sub(1),
        })
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

/// Builds a bare SYN segment with its checksum computed over the IPv4 pseudo-header.
pub fn encode_syn(src: SocketAddrV4, dst: SocketAddrV4, seq: u32) -> Result<Vec<u8>, PingError> {
    let mut vec: Vec<u8> = vec![0; MutableTcpPacket::minimum_packet_size()];
    let mut syn = MutableTcpPacket::new(&mut vec[..])
        .ok_or_else(|| PingError::Encode("tcp buffer too small".into()))?;
    syn.set_source(src.port());
    syn.set_destination(dst.port());
    syn.set_sequence(seq);
    syn.set_acknowledgement(0);
    syn.set_data_offset(5);
    syn.set_flags(TcpFlags::SYN);
    syn.set_window(WINDOW);
    let csum = wire::ipv4_checksum(&syn.to_immutable(), src.ip(), dst.ip());
    syn.set_checksum(csum);
    Ok(vec)
}

/// Decodes a TCP header, IP header already stripped.
pub fn decode(data: &[u8]) -> Result<Segment, DecodeError> {
    let tcp = TcpPacket::new(data).ok_or(DecodeError::Truncated {
        what: "tcp header",
        expected: TcpPacket::minimum_packet_size(),
        actual: data.len(),
    })?;
    let flags = tcp.get_flags();
    Ok(Segment {
        source_port: tcp.get_source(),
        destination_port: tcp.get_destination(),
        sequence: tcp.get_sequence(),
        acknowledgement: tcp.get_acknowledgement(),
        syn: flags & TcpFlags::SYN != 0,
        ack: flags & TcpFlags::ACK != 0,
        rst: flags & TcpFlags::RST != 0,
    })
}

type Outcome = Result<Instant, PingError>;

#[derive(Debug)]
struct Shared {
    port: u16,
    seq: AtomicU32,
    pending: Arc<PendingTable<SynKey, Outcome>>,
    closed: AtomicBool,
}

impl Shared {
    fn new(port: u16, initial_seq: u32) -> Self {
        Self {
            port,
            seq: AtomicU32::new(initial_seq),
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn next_key(&self) -> SynKey {
        SynKey {
            port: self.port,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn ensure_open(&self) -> Result<(), PingError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PingError::Closed)
        } else {
            Ok(())
        }
    }

    fn classify(&self, datagram: &Datagram) -> Option<(SynKey, Outcome)> {
        let segment = match decode(&datagram.bytes) {
            Ok(segment) => segment,
            Err(e) => {
                debug!(peer = %datagram.peer, error = %e, "dropping undecodable tcp segment");
                return None;
            }
        };
        let key = match segment.answers(self.port) {
            Some(key) => key,
            None => {
                trace!(
                    peer = %datagram.peer,
                    port = segment.destination_port,
                    "dropping tcp segment for another port"
                );
                return None;
            }
        };
        let outcome = if segment.is_syn_ack() {
            Ok(datagram.received)
        } else {
            trace!(peer = %datagram.peer, rst = segment.rst, "probe refused");
            Err(PingError::PortClosed)
        };
        Some((key, outcome))
    }
}

impl Dispatch for Shared {
    fn dispatch(&self, datagram: Datagram) {
        if let Some((key, outcome)) = self.classify(&datagram) {
            if !self.pending.deliver(key, outcome) {
                debug!(seq = key.seq, "no pending probe for segment");
            }
        }
    }

    fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
    }
}

struct Inner {
    shared: Arc<Shared>,
    sender: Sender,
    listener: Mutex<Option<Listener>>,
    timeout: Duration,
    source_addr: Option<Ipv4Addr>,
}

/// Half-open TCP pinger.
///
/// Every SYN leaves from the same configured source port; replies are
/// matched on that port and on the acknowledged sequence number. The kernel
/// knows nothing of these connections and answers a SYN+ACK with a RST,
/// which tears the half-open connection down on the remote side.
#[derive(Clone)]
pub struct Pinger {
    inner: Arc<Inner>,
}

impl Pinger {
    pub fn new(config: &Config) -> Result<Self, PingError> {
        config.validate()?;
        let (sender, receiver) = transport::open(Protocol::Tcp, config.buffer_size, config.ttl)?;
        let initial_seq = seeded_random(config.identifier_seed);
        let shared = Arc::new(Shared::new(config.source_port, initial_seq));
        let listener = Listener::spawn(
            "tcp-listener",
            receiver,
            Arc::clone(&shared),
            LoopPolicy::from(config),
        )?;
        info!(port = shared.port, timeout = ?config.timeout(), "tcp pinger started");
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                sender,
                listener: Mutex::new(Some(listener)),
                timeout: config.timeout(),
                source_addr: config.source_addr,
            }),
        })
    }

    pub fn source_port(&self) -> u16 {
        self.inner.shared.port
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::Acquire)
    }

    /// Sends one SYN to `dst` and waits for the answer.
    ///
    /// SYN+ACK yields the round trip time, measured from registration of the
    /// probe. Any other answer is [`PingError::PortClosed`].
    pub async fn ping(&self, dst: SocketAddrV4) -> Result<Duration, PingError> {
        let inner = &self.inner;
        inner.shared.ensure_open()?;

        let src_ip = match inner.source_addr {
            Some(addr) => addr,
            None => transport::local_addr_for(dst).map_err(PingError::Transport)?,
        };
        let key = inner.shared.next_key();
        let mut registration = inner.shared.pending.register(key)?;
        let segment = encode_syn(SocketAddrV4::new(src_ip, key.port), dst, key.seq)?;
        inner.sender.send(&segment, *dst.ip())?;
        trace!(%dst, seq = key.seq, "syn sent");

        let arrived = registration.wait(inner.timeout).await??;
        Ok(arrived.saturating_duration_since(registration.created()))
    }

    /// See [`icmp::Pinger::close`](super::icmp::Pinger::close); the same
    /// guarantees and the same restriction on concurrent `ping` apply.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.shared.closed.store(true, Ordering::Release);
        if listener::shutdown(&inner.sender, &inner.listener).await {
            let abandoned = inner.shared.pending.clear();
            info!(port = inner.shared.port, abandoned, "tcp pinger closed");
        }
    }
}
