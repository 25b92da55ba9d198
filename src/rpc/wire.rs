use bitflags::bitflags;

use crate::error::{Error, Result};

use super::message::{MessageFlags, MessageHeader};

pub const PROTOCOL_VERSION: u8 = 0x01;

/// Fixed packet header size on the wire.
pub const PACKET_HEADER_SIZE: usize = 16;
/// Fixed record sub-header size inside data packets.
pub const RECORD_HEADER_SIZE: usize = 16;
/// Upper bound for a serialized message header (flags, ids and url).
/// Bounded so a serialized header always fits the first record of a
/// message even in the smallest permitted send buffer.
pub const MAX_MESSAGE_HEADER_SIZE: usize = 14 + MAX_URL_LEN;
pub const MAX_URL_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    KeepAlive = 2,
    Connecting = 3,
    Accepting = 4,
}

impl PacketType {
    fn from_u8(v: u8) -> Result<PacketType> {
        match v {
            1 => Ok(PacketType::Data),
            2 => Ok(PacketType::KeepAlive),
            3 => Ok(PacketType::Connecting),
            4 => Ok(PacketType::Accepting),
            _ => Err(Error::ConnectionInvalidState),
        }
    }
}

bitflags! {
    /// Packet-level flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u16 {
        const NEW_MESSAGE        = 0x0001;
        const CONTINUED          = 0x0002;
        const RESPONSE           = 0x0004;
        const CANCELED           = 0x0008;
        const SWITCH_TO_NEW_PROTO = 0x0010;
        const REQUEST_RECEIPT    = 0x0020;
        const ACCEPTED           = 0x0040;
        const CONNECTING         = 0x0080;
    }
}

bitflags! {
    /// Record-level flag byte inside data packet payloads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordFlags: u8 {
        const NEW_MESSAGE    = 0x01;
        const CONTINUED      = 0x02;
        const RESPONSE       = 0x04;
        const CANCELED       = 0x08;
        /// Standalone request-cancel notification; carries no body.
        const CANCEL_REQUEST = 0x10;
    }
}

/// 16-byte big-endian packet header.
///
/// `updates_count` and `retransmit_id` belong to a retransmitting
/// codec this core does not speak; they are written as zero and, in
/// strict mode, rejected when non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub ptype: PacketType,
    pub flags: PacketFlags,
    pub length: u32,
    pub message_index: u16,
    pub ack_count: u8,
    pub updates_count: u16,
    pub retransmit_id: u16,
}

impl PacketHeader {
    pub fn new(ptype: PacketType) -> PacketHeader {
        PacketHeader {
            ptype,
            flags: PacketFlags::empty(),
            length: 0,
            message_index: 0,
            ack_count: 0,
            updates_count: 0,
            retransmit_id: 0,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= PACKET_HEADER_SIZE);
        out[0] = PROTOCOL_VERSION;
        out[1] = self.ptype as u8;
        out[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out[8..10].copy_from_slice(&self.message_index.to_be_bytes());
        out[10] = self.ack_count;
        out[11] = 0;
        out[12..14].copy_from_slice(&self.updates_count.to_be_bytes());
        out[14..16].copy_from_slice(&self.retransmit_id.to_be_bytes());
    }

    pub fn decode(input: &[u8], strict: bool) -> Result<PacketHeader> {
        if input.len() < PACKET_HEADER_SIZE {
            return Err(Error::ConnectionInvalidState);
        }
        if input[0] != PROTOCOL_VERSION {
            return Err(Error::ConnectionInvalidState);
        }
        let ptype = PacketType::from_u8(input[1])?;
        let flags = PacketFlags::from_bits_truncate(u16::from_be_bytes([input[2], input[3]]));
        let length = u32::from_be_bytes([input[4], input[5], input[6], input[7]]);
        let message_index = u16::from_be_bytes([input[8], input[9]]);
        let ack_count = input[10];
        let updates_count = u16::from_be_bytes([input[12], input[13]]);
        let retransmit_id = u16::from_be_bytes([input[14], input[15]]);

        if strict && (input[11] != 0 || updates_count != 0 || retransmit_id != 0) {
            return Err(Error::ConnectionInvalidState);
        }

        Ok(PacketHeader {
            ptype,
            flags,
            length,
            message_index,
            ack_count,
            updates_count,
            retransmit_id,
        })
    }
}

/// 16-byte big-endian record sub-header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub flags: RecordFlags,
    pub relay_hops: u8,
    pub message_index: u16,
    pub length: u32,
    pub sender_request_id: u32,
    pub recipient_request_id: u32,
}

impl RecordHeader {
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= RECORD_HEADER_SIZE);
        out[0] = self.flags.bits();
        out[1] = self.relay_hops;
        out[2..4].copy_from_slice(&self.message_index.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out[8..12].copy_from_slice(&self.sender_request_id.to_be_bytes());
        out[12..16].copy_from_slice(&self.recipient_request_id.to_be_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<RecordHeader> {
        if input.len() < RECORD_HEADER_SIZE {
            return Err(Error::ConnectionInvalidState);
        }
        Ok(RecordHeader {
            flags: RecordFlags::from_bits_truncate(input[0]),
            relay_hops: input[1],
            message_index: u16::from_be_bytes([input[2], input[3]]),
            length: u32::from_be_bytes([input[4], input[5], input[6], input[7]]),
            sender_request_id: u32::from_be_bytes([input[8], input[9], input[10], input[11]]),
            recipient_request_id: u32::from_be_bytes([input[12], input[13], input[14], input[15]]),
        })
    }
}

/// Serializes a message header: flags, request ids, then the
/// length-prefixed url. Always emitted whole inside the first record
/// of a message.
pub fn encode_message_header(header: &MessageHeader, out: &mut Vec<u8>) -> Result<()> {
    if header.url.len() > MAX_URL_LEN {
        return Err(Error::ConnectionInvalidState);
    }
    out.extend_from_slice(&header.flags.bits().to_be_bytes());
    out.extend_from_slice(&header.sender_request_id.to_be_bytes());
    out.extend_from_slice(&header.recipient_request_id.to_be_bytes());
    out.extend_from_slice(&(header.url.len() as u16).to_be_bytes());
    out.extend_from_slice(header.url.as_bytes());
    Ok(())
}

/// Decodes a message header, returning it with the bytes consumed.
pub fn decode_message_header(input: &[u8]) -> Result<(MessageHeader, usize)> {
    if input.len() < 14 {
        return Err(Error::ConnectionInvalidState);
    }
    let flags =
        MessageFlags::from_bits_truncate(u32::from_be_bytes([input[0], input[1], input[2], input[3]]));
    let sender_request_id = u32::from_be_bytes([input[4], input[5], input[6], input[7]]);
    let recipient_request_id = u32::from_be_bytes([input[8], input[9], input[10], input[11]]);
    let url_len = u16::from_be_bytes([input[12], input[13]]) as usize;
    if url_len > MAX_URL_LEN || input.len() < 14 + url_len {
        return Err(Error::ConnectionInvalidState);
    }
    let url = std::str::from_utf8(&input[14..14 + url_len])
        .map_err(|_| Error::ConnectionInvalidState)?
        .to_owned();
    Ok((
        MessageHeader {
            flags,
            url,
            sender_request_id,
            recipient_request_id,
        },
        14 + url_len,
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_header_roundtrip() {
        let mut hdr = PacketHeader::new(PacketType::Data);
        hdr.flags = PacketFlags::NEW_MESSAGE | PacketFlags::RESPONSE;
        hdr.length = 4096;
        hdr.message_index = 7;
        hdr.ack_count = 3;

        let mut buf = [0u8; PACKET_HEADER_SIZE];
        hdr.encode(&mut buf);
        let back = PacketHeader::decode(&buf, true).unwrap();
        assert_eq!(hdr, back);
    }

    #[test]
    fn strict_decode_rejects_reserved_fields() {
        let mut hdr = PacketHeader::new(PacketType::Data);
        hdr.retransmit_id = 9;
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        hdr.encode(&mut buf);

        assert!(PacketHeader::decode(&buf, true).is_err());
        let relaxed = PacketHeader::decode(&buf, false).unwrap();
        assert_eq!(relaxed.retransmit_id, 9);
    }

    #[test]
    fn rejects_unknown_version_and_type() {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        PacketHeader::new(PacketType::KeepAlive).encode(&mut buf);

        let mut bad = buf;
        bad[0] = 0x02;
        assert!(PacketHeader::decode(&bad, false).is_err());

        let mut bad = buf;
        bad[1] = 0x7f;
        assert!(PacketHeader::decode(&bad, false).is_err());
    }

    #[test]
    fn record_header_roundtrip() {
        let hdr = RecordHeader {
            flags: RecordFlags::NEW_MESSAGE | RecordFlags::CONTINUED,
            relay_hops: 1,
            message_index: 12,
            length: 512,
            sender_request_id: 77,
            recipient_request_id: 0,
        };
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(RecordHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn message_header_roundtrip() {
        let hdr = MessageHeader {
            flags: MessageFlags::WAIT_RESPONSE | MessageFlags::SYNCHRONOUS,
            url: "room/peer-2".into(),
            sender_request_id: 41,
            recipient_request_id: 0,
        };
        let mut buf = Vec::new();
        encode_message_header(&hdr, &mut buf).unwrap();
        let (back, used) = decode_message_header(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(back, hdr);
    }

    #[test]
    fn message_header_rejects_truncation() {
        let hdr = MessageHeader {
            flags: MessageFlags::empty(),
            url: "abc".into(),
            sender_request_id: 1,
            recipient_request_id: 2,
        };
        let mut buf = Vec::new();
        encode_message_header(&hdr, &mut buf).unwrap();
        assert!(decode_message_header(&buf[..buf.len() - 1]).is_err());
    }
}
