//! Outer framing: 1 byte packet type + 2 bytes BE length + payload.

use crate::types::Ipid;

/// Size of the outer packet header.
pub const HEADER_SIZE: usize = 3;

/// Largest payload a packet can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Lead-in bytes of an online request, before the IPID.
pub const ONLINE_REQUEST_LEAD_IN: [u8; 5] = [0x7f, 0x00, 0x00, 0x01, 0x00];
/// Trailing byte of an online request, after the IPID.
pub const ONLINE_REQUEST_TRAILER: u8 = 0x40;
/// Hello payload sent by the host.
pub const HELLO_PAYLOAD: [u8; 1] = [0x02];
/// Online OK payload sent by the host.
pub const ONLINE_OK_PAYLOAD: [u8; 4] = [0x00, 0x00, 0x00, 0x03];

/// Outer packet types.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PacketType {
    OnlineRequest = 0x01,
    OnlineOk = 0x02,
    Update = 0x05,
    Ping = 0x0d,
    Pong = 0x0e,
    Hello = 0x0f,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        Ok(match b {
            0x01 => PacketType::OnlineRequest,
            0x02 => PacketType::OnlineOk,
            0x05 => PacketType::Update,
            0x0d => PacketType::Ping,
            0x0e => PacketType::Pong,
            0x0f => PacketType::Hello,
            other => return Err(other),
        })
    }
}

/// A decoded outer packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Build a packet from a raw type byte. Unknown types are an error.
    pub fn from_parts(kind: u8, payload: Vec<u8>) -> Result<Self, PacketDecodeError> {
        let kind = PacketType::try_from(kind).map_err(|kind| PacketDecodeError::UnsupportedType {
            kind,
            len: payload.len(),
        })?;
        Ok(Self { kind, payload })
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketEncodeError> {
        encode_packet(self.kind, &self.payload)
    }
}

/// Parse an outer header into (raw type byte, payload length).
pub fn parse_header(header: [u8; HEADER_SIZE]) -> (u8, usize) {
    (header[0], u16::from_be_bytes([header[1], header[2]]) as usize)
}

/// Encode one packet: type, BE length, payload.
pub fn encode_packet(kind: PacketType, payload: &[u8]) -> Result<Vec<u8>, PacketEncodeError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(PacketEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketEncodeError {
    #[error("payload of {0} bytes does not fit a packet")]
    TooLarge(usize),
}

/// Decode one packet from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if the packet is not complete yet.
pub fn decode_packet(bytes: &[u8]) -> Result<(Packet, usize), PacketDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(PacketDecodeError::NeedMore);
    }
    let (kind, len) = parse_header([bytes[0], bytes[1], bytes[2]]);
    if bytes.len() < HEADER_SIZE + len {
        return Err(PacketDecodeError::NeedMore);
    }
    let packet = Packet::from_parts(kind, bytes[HEADER_SIZE..HEADER_SIZE + len].to_vec())?;
    Ok((packet, HEADER_SIZE + len))
}

/// Error decoding a packet.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PacketDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("unrecognized packet type {kind:02x} (payload length {len})")]
    UnsupportedType { kind: u8, len: usize },
}

/// Online request sent by a client announcing its IPID.
pub fn online_request(ipid: Ipid) -> Vec<u8> {
    let mut payload = Vec::with_capacity(7);
    payload.extend_from_slice(&ONLINE_REQUEST_LEAD_IN);
    payload.push(ipid.0);
    payload.push(ONLINE_REQUEST_TRAILER);
    fixed_packet(PacketType::OnlineRequest, &payload)
}

pub fn hello() -> Vec<u8> {
    fixed_packet(PacketType::Hello, &HELLO_PAYLOAD)
}

pub fn online_ok() -> Vec<u8> {
    fixed_packet(PacketType::OnlineOk, &ONLINE_OK_PAYLOAD)
}

pub fn ping(payload: [u8; 2]) -> Vec<u8> {
    fixed_packet(PacketType::Ping, &payload)
}

/// Pong echoing a ping payload. Payloads longer than a packet are truncated.
pub fn pong(payload: &[u8]) -> Vec<u8> {
    fixed_packet(PacketType::Pong, &payload[..payload.len().min(MAX_PAYLOAD_LEN)])
}

fn fixed_packet(kind: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_handshake_bytes() {
        assert_eq!(
            online_request(Ipid(0x03)),
            vec![0x01, 0x00, 0x07, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x03, 0x40]
        );
        assert_eq!(hello(), vec![0x0f, 0x00, 0x01, 0x02]);
        assert_eq!(online_ok(), vec![0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(pong(&[0x12, 0x34]), vec![0x0e, 0x00, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn decode_online_request() {
        let bytes = [0x01, 0x00, 0x07, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x03, 0x40];
        let (packet, n) = decode_packet(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(packet.kind, PacketType::OnlineRequest);
        assert_eq!(packet.payload[5], 0x03);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = hello();
        assert!(matches!(
            decode_packet(&frame[..2]),
            Err(PacketDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_packet(&frame[..HEADER_SIZE]),
            Err(PacketDecodeError::NeedMore)
        ));
    }

    #[test]
    fn unknown_type_rejected() {
        let bytes = [0x42, 0x00, 0x01, 0xaa];
        assert!(matches!(
            decode_packet(&bytes),
            Err(PacketDecodeError::UnsupportedType { kind: 0x42, len: 1 })
        ));
    }

    #[test]
    fn multiple_packets() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&hello());
        buf.extend_from_slice(&online_ok());
        let (p1, n1) = decode_packet(&buf).unwrap();
        assert_eq!(n1, 4);
        let (p2, n2) = decode_packet(&buf[n1..]).unwrap();
        assert_eq!(n2, 7);
        assert_eq!(p1.kind, PacketType::Hello);
        assert_eq!(p2.kind, PacketType::OnlineOk);
        assert_eq!(p2.payload, ONLINE_OK_PAYLOAD);
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(
            encode_packet(PacketType::Update, &payload),
            Err(PacketEncodeError::TooLarge(_))
        ));
    }
}
