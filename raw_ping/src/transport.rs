use parking_lot::Mutex;
use pnet::packet::ipv4::Ipv4Packet;
use socket2::{Domain, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

use crate::ping::PingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Icmp,
    Tcp,
}

impl Protocol {
    fn socket_protocol(self) -> socket2::Protocol {
        match self {
            Self::Icmp => socket2::Protocol::ICMPV4,
            Self::Tcp => socket2::Protocol::TCP,
        }
    }
}

/// One datagram read off the raw socket, IP header stripped.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub peer: Ipv4Addr,
    /// Wall clock at arrival, comparable with timestamps echoed back by the peer.
    pub received_at: SystemTime,
    pub received: Instant,
}

impl Datagram {
    pub fn new(bytes: Vec<u8>, peer: Ipv4Addr) -> Self {
        Self {
            bytes,
            peer,
            received_at: SystemTime::now(),
            received: Instant::now(),
        }
    }
}

/// Source of datagrams for the listener.
pub trait Source: Send + 'static {
    /// Blocks for at most `timeout`. `Ok(None)` means nothing usable arrived in time.
    fn receive(&mut self, timeout: Duration) -> io::Result<Option<Datagram>>;
}

/// Opens one raw IPv4 socket carrying `protocol` and splits it into its two halves.
///
/// The halves hold separate descriptors on the same socket, so releasing the
/// send half leaves the listener's reads untouched.
pub fn open(
    protocol: Protocol,
    buffer_size: usize,
    ttl: Option<u8>,
) -> Result<(Sender, Receiver), PingError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(protocol.socket_protocol()))
        .map_err(PingError::Socket)?;
    if let Some(ttl) = ttl {
        socket.set_ttl(u32::from(ttl)).map_err(PingError::Socket)?;
    }
    let reader = socket.try_clone().map_err(PingError::Socket)?;
    Ok((
        Sender {
            inner: Mutex::new(Some(socket)),
        },
        Receiver {
            socket: reader,
            buffer: vec![0; buffer_size],
            read_timeout: None,
        },
    ))
}

/// Send half. Sends from concurrent callers are serialized.
pub struct Sender {
    inner: Mutex<Option<Socket>>,
}

impl Sender {
    /// Sends one transport-layer message; the kernel prepends the IP header.
    pub fn send(&self, bytes: &[u8], dst: Ipv4Addr) -> Result<usize, PingError> {
        let inner = self.inner.lock();
        let socket = inner.as_ref().ok_or(PingError::Closed)?;
        socket
            .send_to(bytes, &SockAddr::from(SocketAddrV4::new(dst, 0)))
            .map_err(PingError::Transport)
    }

    /// Releases the send half. Returns `false` if it was already released.
    pub fn close(&self) -> bool {
        self.inner.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

/// Receive half, owned by the listener thread.
pub struct Receiver {
    socket: Socket,
    buffer: Vec<u8>,
    read_timeout: Option<Duration>,
}

impl Source for Receiver {
    fn receive(&mut self, timeout: Duration) -> io::Result<Option<Datagram>> {
        // A zero read timeout would block forever.
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout != Some(timeout) {
            self.socket.set_read_timeout(Some(timeout))?;
            self.read_timeout = Some(timeout);
        }
        let len = match self.socket.read(&mut self.buffer) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        // Arrival is recorded before anything looks at the bytes.
        let (received_at, received) = (SystemTime::now(), Instant::now());
        match split_ipv4(&self.buffer[..len]) {
            Some((peer, payload)) => Ok(Some(Datagram {
                bytes: payload.to_vec(),
                peer,
                received_at,
                received,
            })),
            None => {
                trace!(len, "dropping datagram without a usable ipv4 header");
                Ok(None)
            }
        }
    }
}

/// Source address and payload of a raw IPv4 datagram.
///
/// The payload runs to the end of what was read; BSD kernels rewrite the
/// total length field, so it is not trusted.
fn split_ipv4(datagram: &[u8]) -> Option<(Ipv4Addr, &[u8])> {
    let ip = Ipv4Packet::new(datagram)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    if ip.get_version() != 4 || header_len < Ipv4Packet::minimum_packet_size() {
        return None;
    }
    let payload = datagram.get(header_len..)?;
    Some((ip.get_source(), payload))
}

/// Local address the kernel would pick to reach `dst`.
///
/// Connecting a UDP socket sends nothing; it only performs the route lookup.
pub fn local_addr_for(dst: SocketAddrV4) -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(dst)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) => Ok(addr),
        IpAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no ipv4 route to destination",
        )),
    }
}
