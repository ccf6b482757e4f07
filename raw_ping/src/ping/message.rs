//! ICMPv4 encoding of echo probes and classification of whatever arrives on
//! the raw socket.

use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use thiserror::Error;

use super::{IcmpCode, IcmpType, PingError, TimeExceededReason, UnreachableReason};
use crate::timestamp::{Timestamp, TIMESTAMP_LEN};

/// Payload length of a standard `ping`.
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;

/// Correlates a reply with the probe that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EchoKey {
    pub id: u16,
    pub seq: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    EchoReply {
        key: EchoKey,
        payload: Vec<u8>,
    },
    EchoRequest,
    /// `original` is `None` when the quoted datagram was not an echo request.
    DestinationUnreachable {
        reason: UnreachableReason,
        original: Option<EchoKey>,
    },
    TimeExceeded {
        reason: TimeExceededReason,
        original: Option<EchoKey>,
    },
    Unknown {
        ty: IcmpType,
        code: IcmpCode,
    },
}

impl Message {
    /// Key of the probe this message answers, if it answers one at all.
    pub fn key(&self) -> Option<EchoKey> {
        match self {
            Self::EchoReply { key, .. } => Some(*key),
            Self::DestinationUnreachable { original, .. } => *original,
            Self::TimeExceeded { original, .. } => *original,
            Self::EchoRequest | Self::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{what} truncated: need {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("quoted IP header is invalid (version {version}, header length {header_len})")]
    QuotedHeader { version: u8, header_len: usize },
}

fn truncated(what: &'static str, expected: usize, actual: usize) -> DecodeError {
    DecodeError::Truncated {
        what,
        expected,
        actual,
    }
}

/// Builds an echo request whose payload starts with `sent` and is zero padded
/// to `payload_size` bytes.
pub fn encode_echo_request(
    key: EchoKey,
    sent: Timestamp,
    payload_size: usize,
) -> Result<Vec<u8>, PingError> {
    if payload_size < TIMESTAMP_LEN {
        return Err(PingError::Encode(format!(
            "payload of {} bytes cannot hold a timestamp",
            payload_size
        )));
    }
    let mut payload = vec![0u8; payload_size];
    payload[..TIMESTAMP_LEN].copy_from_slice(&sent.encode());

    let mut vec: Vec<u8> = vec![0; EchoRequestPacket::minimum_packet_size() + payload_size];
    let mut echo_packet = MutableEchoRequestPacket::new(&mut vec[..])
        .ok_or_else(|| PingError::Encode("echo request buffer too small".into()))?;
    echo_packet.set_icmp_type(IcmpTypes::EchoRequest);
    echo_packet.set_icmp_code(IcmpCode::new(0));
    echo_packet.set_identifier(key.id);
    echo_packet.set_sequence_number(key.seq);
    echo_packet.set_payload(&payload);
    let csum = pnet::util::checksum(echo_packet.packet(), 1);
    echo_packet.set_checksum(csum);
    Ok(vec)
}

/// Decodes one ICMP message, IP header already stripped.
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    let packet = IcmpPacket::new(data)
        .ok_or_else(|| truncated("icmp header", IcmpPacket::minimum_packet_size(), data.len()))?;
    let ty = packet.get_icmp_type();
    let code = packet.get_icmp_code();

    match ty {
        IcmpTypes::EchoReply => {
            let reply = EchoReplyPacket::new(data).ok_or_else(|| {
                truncated("echo reply", EchoReplyPacket::minimum_packet_size(), data.len())
            })?;
            Ok(Message::EchoReply {
                key: EchoKey {
                    id: reply.get_identifier(),
                    seq: reply.get_sequence_number(),
                },
                payload: reply.payload().to_vec(),
            })
        }
        IcmpTypes::EchoRequest => Ok(Message::EchoRequest),
        IcmpTypes::DestinationUnreachable => {
            let packet = DestinationUnreachablePacket::new(data).ok_or_else(|| {
                truncated(
                    "destination unreachable",
                    DestinationUnreachablePacket::minimum_packet_size(),
                    data.len(),
                )
            })?;
            Ok(Message::DestinationUnreachable {
                reason: code.into(),
                original: decode_original(packet.payload())?,
            })
        }
        IcmpTypes::TimeExceeded => {
            let packet = TimeExceededPacket::new(data).ok_or_else(|| {
                truncated(
                    "time exceeded",
                    TimeExceededPacket::minimum_packet_size(),
                    data.len(),
                )
            })?;
            Ok(Message::TimeExceeded {
                reason: code.into(),
                original: decode_original(packet.payload())?,
            })
        }
        _ => Ok(Message::Unknown { ty, code }),
    }
}

/// Recovers the key of the request quoted in an ICMP error: one IPv4 header
/// followed by the leading bytes of the original datagram.
fn decode_original(quoted: &[u8]) -> Result<Option<EchoKey>, DecodeError> {
    let ip = Ipv4Packet::new(quoted).ok_or_else(|| {
        truncated(
            "quoted ip header",
            Ipv4Packet::minimum_packet_size(),
            quoted.len(),
        )
    })?;
    let header_len = ip.get_header_length() as usize * 4;
    if ip.get_version() != 4 || header_len < Ipv4Packet::minimum_packet_size() {
        return Err(DecodeError::QuotedHeader {
            version: ip.get_version(),
            header_len,
        });
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return Ok(None);
    }
    let rest = quoted.get(header_len..).unwrap_or(&[]);
    let request = EchoRequestPacket::new(rest).ok_or_else(|| {
        truncated(
            "quoted echo request",
            EchoRequestPacket::minimum_packet_size(),
            rest.len(),
        )
    })?;
    if request.get_icmp_type() != IcmpTypes::EchoRequest {
        return Ok(None);
    }
    Ok(Some(EchoKey {
        id: request.get_identifier(),
        seq: request.get_sequence_number(),
    }))
}
