use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace};

use super::message::{self, EchoKey, Message};
use super::{seeded_random, PingError};
use crate::config::Config;
use crate::listener::{self, Dispatch, Listener, LoopPolicy};
use crate::pending::PendingTable;
use crate::timestamp::Timestamp;
use crate::transport::{self, Datagram, Protocol, Sender};

/// An echo reply matched to one of our probes.
#[derive(Debug, Clone)]
pub struct EchoReply {
    pub peer: Ipv4Addr,
    pub payload: Vec<u8>,
    pub received_at: SystemTime,
}

impl EchoReply {
    /// Time between the send timestamp echoed in the payload and the arrival of the reply.
    pub fn round_trip(&self) -> Result<Duration, PingError> {
        let sent = Timestamp::decode(&self.payload)?;
        Ok(sent.elapsed_until(self.received_at))
    }
}

type Outcome = Result<EchoReply, PingError>;

/// State shared between the probing side and the listener thread.
#[derive(Debug)]
struct Shared {
    id: u16,
    seq: AtomicU16,
    pending: Arc<PendingTable<EchoKey, Outcome>>,
    closed: AtomicBool,
}

impl Shared {
    fn new(id: u16) -> Self {
        Self {
            id,
            seq: AtomicU16::new(0),
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn next_key(&self) -> EchoKey {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        EchoKey { id: self.id, seq }
    }

    fn ensure_open(&self) -> Result<(), PingError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PingError::Closed)
        } else {
            Ok(())
        }
    }

    fn classify(&self, datagram: Datagram) -> Option<(EchoKey, Outcome)> {
        let peer = datagram.peer;
        let message = match message::decode(&datagram.bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(%peer, error = %e, "dropping undecodable icmp message");
                return None;
            }
        };
        let key = match message.key() {
            Some(key) if key.id == self.id => key,
            _ => {
                trace!(%peer, ?message, "dropping icmp message for someone else");
                return None;
            }
        };
        let outcome = match message {
            Message::EchoReply { payload, .. } => Ok(EchoReply {
                peer,
                payload,
                received_at: datagram.received_at,
            }),
            Message::DestinationUnreachable { reason, .. } => {
                Err(PingError::DestinationUnreachable(reason))
            }
            Message::TimeExceeded { reason, .. } => Err(PingError::TimeExceeded(reason)),
            Message::EchoRequest | Message::Unknown { .. } => return None,
        };
        Some((key, outcome))
    }
}

impl Dispatch for Shared {
    fn dispatch(&self, datagram: Datagram) {
        if let Some((key, outcome)) = self.classify(datagram) {
            if !self.pending.deliver(key, outcome) {
                debug!(seq = key.seq, "no pending probe for reply");
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
    payload_size: usize,
}

/// ICMP echo pinger.
///
/// All clones share one raw socket and one listener thread; any number of
/// tasks may `ping` through it concurrently. Replies are matched on
/// (identifier, sequence), so several probes to the same host can be in
/// flight at once.
#[derive(Clone)]
pub struct Pinger {
    inner: Arc<Inner>,
}

impl Pinger {
    /// Opens the raw socket and starts the listener. Usually needs root or `CAP_NET_RAW`.
    pub fn new(config: &Config) -> Result<Self, PingError> {
        config.validate()?;
        let (sender, receiver) = transport::open(Protocol::Icmp, config.buffer_size, config.ttl)?;
        let shared = Arc::new(Shared::new(seeded_random(config.identifier_seed)));
        let listener = Listener::spawn(
            "icmp-listener",
            receiver,
            Arc::clone(&shared),
            LoopPolicy::from(config),
        )?;
        info!(id = shared.id, timeout = ?config.timeout(), "icmp pinger started");
        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                sender,
                listener: Mutex::new(Some(listener)),
                timeout: config.timeout(),
                payload_size: config.payload_size,
            }),
        })
    }

    /// Identifier carried by every echo request of this pinger.
    pub fn identifier(&self) -> u16 {
        self.inner.shared.id
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::Acquire)
    }

    /// Sends one echo request to `addr` and waits for its reply.
    ///
    /// Returns the round trip time, or the ICMP error a router sent back in
    /// its place, or [`PingError::Timeout`]. There is no retry.
    pub async fn ping(&self, addr: Ipv4Addr) -> Result<Duration, PingError> {
        let inner = &self.inner;
        inner.shared.ensure_open()?;

        let key = inner.shared.next_key();
        let mut registration = inner.shared.pending.register(key)?;
        let request = message::encode_echo_request(key, Timestamp::now(), inner.payload_size)?;
        inner.sender.send(&request, addr)?;
        trace!(%addr, seq = key.seq, "echo request sent");

        let reply = registration.wait(inner.timeout).await??;
        reply.round_trip()
    }

    /// Stops the listener and releases the socket. Pending probes fail with
    /// [`PingError::Closed`], as does every later `ping`. Closing twice is a no-op.
    ///
    /// Calling `ping` while `close` is in progress is not supported: such a
    /// probe may still complete, or fail with `Closed` or a transport error.
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.shared.closed.store(true, Ordering::Release);
        if listener::shutdown(&inner.sender, &inner.listener).await {
            let abandoned = inner.shared.pending.clear();
            info!(id = inner.shared.id, abandoned, "icmp pinger closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::message::testing::{echo_reply, icmp_error, quoted_request};
    use crate::ping::{TimeExceededReason, UnreachableReason};
    use pnet::packet::icmp::IcmpTypes;

    const ID: u16 = 0x1234;

    fn payload(sent: Timestamp) -> Vec<u8> {
        let mut payload = sent.encode().to_vec();
        payload.resize(56, 0);
        payload
    }

    fn arrive(bytes: Vec<u8>) -> Datagram {
        Datagram::new(bytes, Ipv4Addr::new(192, 0, 2, 7))
    }

    #[test]
    fn sequence_starts_at_one_and_wraps() {
        let shared = Shared::new(ID);
        assert_eq!(shared.next_key(), EchoKey { id: ID, seq: 1 });
        shared.seq.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(shared.next_key().seq, u16::MAX);
        assert_eq!(shared.next_key().seq, 0);
    }

    #[tokio::test]
    async fn own_reply_is_delivered() {
        let shared = Shared::new(ID);
        let key = shared.next_key();
        let mut reg = shared.pending.register(key).unwrap();
        let sent = Timestamp::now();
        shared.dispatch(arrive(echo_reply(key, &payload(sent))));
        assert!(shared.pending.is_empty());

        let reply = reg.wait(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(reply.peer, Ipv4Addr::new(192, 0, 2, 7));
        assert!(reply.round_trip().unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn foreign_identifier_is_dropped() {
        let shared = Shared::new(ID);
        let key = shared.next_key();
        let _reg = shared.pending.register(key).unwrap();
        let foreign = EchoKey { id: ID + 1, ..key };
        shared.dispatch(arrive(echo_reply(foreign, &payload(Timestamp::now()))));
        let quoted = quoted_request(foreign);
        shared.dispatch(arrive(icmp_error(IcmpTypes::DestinationUnreachable, 3, 1, &quoted)));
        shared.dispatch(arrive(icmp_error(IcmpTypes::TimeExceeded, 0, 1, &quoted)));
        assert_eq!(shared.pending.len(), 1);
    }

    #[test]
    fn echo_requests_and_garbage_are_ignored() {
        let shared = Shared::new(ID);
        let key = shared.next_key();
        let _reg = shared.pending.register(key).unwrap();
        let own_request = message::encode_echo_request(key, Timestamp::now(), 56).unwrap();
        shared.dispatch(arrive(own_request));
        shared.dispatch(arrive(vec![0xFF]));
        shared.dispatch(arrive(icmp_error(IcmpTypes::DestinationUnreachable, 3, 1, &[8])));
        assert_eq!(shared.pending.len(), 1);
    }

    #[tokio::test]
    async fn port_unreachable_is_reported_as_such() {
        let shared = Shared::new(ID);
        let key = shared.next_key();
        let mut reg = shared.pending.register(key).unwrap();
        shared.dispatch(arrive(icmp_error(
            IcmpTypes::DestinationUnreachable,
            3,
            1,
            &quoted_request(key),
        )));
        let outcome = reg.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            outcome,
            Err(PingError::DestinationUnreachable(UnreachableReason::Port))
        ));
    }

    #[tokio::test]
    async fn time_exceeded_is_reported_as_such() {
        let shared = Shared::new(ID);
        let key = shared.next_key();
        let mut reg = shared.pending.register(key).unwrap();
        shared.dispatch(arrive(icmp_error(
            IcmpTypes::TimeExceeded,
            1,
            1,
            &quoted_request(key),
        )));
        let outcome = reg.wait(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            outcome,
            Err(PingError::TimeExceeded(TimeExceededReason::FragmentReassembly))
        ));
    }

    #[tokio::test]
    async fn concurrent_probes_get_their_own_reply() {
        let shared = Arc::new(Shared::new(ID));
        let mut handles = Vec::new();
        let mut keys = Vec::new();
        for _ in 0..16 {
            let key = shared.next_key();
            let mut reg = shared.pending.register(key).unwrap();
            keys.push(key);
            handles.push(tokio::spawn(async move {
                let reply = reg.wait(Duration::from_secs(5)).await.unwrap().unwrap();
                (key, reply)
            }));
        }
        // Replies arrive out of order, each tagged with its sequence in the padding.
        for key in keys.iter().rev() {
            let mut p = payload(Timestamp::now());
            p[8..10].copy_from_slice(&key.seq.to_be_bytes());
            shared.dispatch(arrive(echo_reply(*key, &p)));
        }
        for handle in handles {
            let (key, reply) = handle.await.unwrap();
            assert_eq!(&reply.payload[8..10], &key.seq.to_be_bytes());
        }
        assert!(shared.pending.is_empty());
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_dropped() {
        let shared = Shared::new(ID);
        let key = shared.next_key();
        let mut reg = shared.pending.register(key).unwrap();
        assert!(matches!(
            reg.wait(Duration::from_millis(10)).await,
            Err(PingError::Timeout)
        ));
        drop(reg);
        shared.dispatch(arrive(echo_reply(key, &payload(Timestamp::now()))));
        assert!(shared.pending.is_empty());
    }

    #[tokio::test]
    async fn abort_fails_waiters_and_later_probes() {
        let shared = Shared::new(ID);
        let mut reg = shared.pending.register(shared.next_key()).unwrap();
        shared.abort();
        assert!(matches!(
            reg.wait(Duration::from_secs(1)).await,
            Err(PingError::Closed)
        ));
        assert!(matches!(shared.ensure_open(), Err(PingError::Closed)));
    }

    #[test]
    fn round_trip_uses_echoed_timestamp() {
        let sent = Timestamp::now();
        let reply = EchoReply {
            peer: Ipv4Addr::LOCALHOST,
            payload: payload(sent),
            received_at: sent.to_system_time() + Duration::from_millis(7),
        };
        assert_eq!(reply.round_trip().unwrap(), Duration::from_millis(7));

        let mangled = EchoReply {
            payload: vec![1, 2, 3],
            ..reply
        };
        assert!(matches!(mangled.round_trip(), Err(PingError::Decode(_))));
    }
}
