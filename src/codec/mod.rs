//! Serialization and deserialization of MQTT 3.1.1 control packets.
//!
//! Packets are framed with a fixed header (packet type + flags in the first
//! byte, then a variable length encoded remaining length) followed by a
//! packet specific variable header and payload. [`read`] extracts the next
//! complete packet out of a byte stream, [`Packet::write`] serializes one
//! into a buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::slice::Iter;

mod connack;
mod connect;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod suback;
mod subscribe;
pub mod topic;
mod unsuback;
mod unsubscribe;

pub use connack::{ConnAck, ConnectReturnCode};
pub use connect::{Connect, LastWill, Login};
pub use puback::PubAck;
pub use pubcomp::PubComp;
pub use publish::Publish;
pub use pubrec::PubRec;
pub use pubrel::PubRel;
pub use suback::{SubAck, SubscribeReturnCode};
pub use subscribe::{Subscribe, SubscribeFilter};
pub use unsuback::UnsubAck;
pub use unsubscribe::Unsubscribe;

/// Largest value the 4 byte variable length remaining length field can hold.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Errors during serialization and deserialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("reserved fixed header flags have an invalid value")]
    IncorrectPacketFormat,
    #[error("invalid protocol name")]
    InvalidProtocol,
    #[error("invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("invalid connect return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("invalid subscribe return code: {0}")]
    InvalidSubscribeReturnCode(u8),
    #[error("invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("packet identifier must be non zero")]
    PacketIdZero,
    #[error("payload is required by the packet type")]
    PayloadRequired,
    #[error("payload is too long to encode")]
    PayloadTooLong,
    #[error("payload size limit exceeded: {0}")]
    PayloadSizeLimitExceeded(usize),
    #[error("length crosses the packet boundary: {0}")]
    BoundaryCrossed(usize),
    #[error("malformed packet")]
    MalformedPacket,
    #[error("malformed remaining length")]
    MalformedRemainingLength,
    #[error("topic is not valid UTF-8")]
    TopicNotUtf8,
    /// More bytes required to frame the packet. Carries the minimum number
    /// of additional bytes needed to make progress. This is a framing
    /// signal, not a protocol fault.
    #[error("insufficient bytes, {0} more required")]
    InsufficientBytes(usize),
}

/// MQTT control packet type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// Quality of service
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Maps a number to QoS
pub fn qos(num: u8) -> Result<QoS, Error> {
    match num {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        qos => Err(Error::InvalidQoS(qos)),
    }
}

/// Encapsulates all MQTT packet types
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Serializes the packet into `buffer` and returns the number of bytes
    /// written. The remaining length field always matches the serialized
    /// variable header + payload size exactly.
    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        match self {
            Packet::Connect(connect) => connect.write(buffer),
            Packet::ConnAck(connack) => connack.write(buffer),
            Packet::Publish(publish) => publish.write(buffer),
            Packet::PubAck(puback) => puback.write(buffer),
            Packet::PubRec(pubrec) => pubrec.write(buffer),
            Packet::PubRel(pubrel) => pubrel.write(buffer),
            Packet::PubComp(pubcomp) => pubcomp.write(buffer),
            Packet::Subscribe(subscribe) => subscribe.write(buffer),
            Packet::SubAck(suback) => suback.write(buffer),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(buffer),
            Packet::UnsubAck(unsuback) => unsuback.write(buffer),
            Packet::PingReq => write_empty(buffer, 0xC0),
            Packet::PingResp => write_empty(buffer, 0xD0),
            Packet::Disconnect => write_empty(buffer, 0xE0),
        }
    }
}

fn write_empty(buffer: &mut BytesMut, byte1: u8) -> Result<usize, Error> {
    buffer.put_u8(byte1);
    buffer.put_u8(0x00);
    Ok(2)
}

/// Fixed header of a control packet. First byte of the stream carries the
/// packet type and flags, followed by 1 to 4 bytes of variable length
/// encoded remaining length (variable header + payload size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type and flags
    byte1: u8,
    /// Length of the fixed header itself. Byte 1 + (1..4) length bytes
    header_len: usize,
    /// Size of variable header + payload
    remaining_len: usize,
}

impl FixedHeader {
    fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> FixedHeader {
        FixedHeader {
            byte1,
            header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        match self.byte1 >> 4 {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            num => Err(Error::InvalidPacketType(num)),
        }
    }

    fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    /// Size of the full packet on the wire
    pub fn frame_length(&self) -> usize {
        self.header_len + self.remaining_len
    }
}

/// Checks if the stream has enough bytes to frame a packet and returns the
/// fixed header only if a full packet can be framed from `stream`.
pub fn check(stream: Iter<u8>, max_packet_size: usize) -> Result<FixedHeader, Error> {
    let stream_len = stream.len();
    let fixed_header = parse_fixed_header(stream)?;

    // Don't let a rogue peer make us buffer an enormous payload.
    if fixed_header.remaining_len > max_packet_size {
        return Err(Error::PayloadSizeLimitExceeded(fixed_header.remaining_len));
    }

    let frame_length = fixed_header.frame_length();
    if stream_len < frame_length {
        return Err(Error::InsufficientBytes(frame_length - stream_len));
    }

    Ok(fixed_header)
}

fn parse_fixed_header(mut stream: Iter<u8>) -> Result<FixedHeader, Error> {
    // At least 2 bytes are necessary to frame a packet
    let stream_len = stream.len();
    if stream_len < 2 {
        return Err(Error::InsufficientBytes(2 - stream_len));
    }

    let byte1 = stream.next().unwrap();
    let (len_len, len) = decode_remaining_length(stream)?;

    Ok(FixedHeader::new(*byte1, len_len, len))
}

/// Parses a variable length integer from the stream and returns the number
/// of bytes it occupies along with the decoded value.
fn decode_remaining_length(stream: Iter<u8>) -> Result<(usize, usize), Error> {
    let mut len: usize = 0;
    let mut len_len = 0;
    let mut done = false;
    let mut shift = 0;

    // Continuation bit at position 7 keeps the decode going. Stream
    // 0b1xxx_xxxx 0b0yyy_yyyy decodes as 0byyy_yyyy_xxx_xxxx.
    for byte in stream {
        len_len += 1;
        let byte = *byte as usize;
        len += (byte & 0x7F) << shift;

        done = (byte & 0x80) == 0;
        if done {
            break;
        }

        shift += 7;

        // Only a max of 4 bytes are allowed; more than 3 shifts
        // (0, 7, 14, 21) implies a bad length
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    if !done {
        return Err(Error::InsufficientBytes(1));
    }

    Ok((len_len, len))
}

/// Writes the remaining length to the stream and returns the number of
/// bytes used by the encoding.
fn encode_remaining_length(stream: &mut BytesMut, len: usize) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::PayloadTooLong);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 128;
        }

        stream.put_u8(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

/// Reads a stream of bytes and extracts the next MQTT packet out of it
pub fn read(stream: &mut BytesMut, max_packet_size: usize) -> Result<Packet, Error> {
    let fixed_header = check(stream.iter(), max_packet_size)?;

    let packet = stream.split_to(fixed_header.frame_length());
    let packet_type = fixed_header.packet_type()?;

    if fixed_header.remaining_len == 0 {
        // no payload packets; reserved flag bits must be zero
        if fixed_header.flags() != 0 {
            return Err(Error::IncorrectPacketFormat);
        }

        return match packet_type {
            PacketType::PingReq => Ok(Packet::PingReq),
            PacketType::PingResp => Ok(Packet::PingResp),
            PacketType::Disconnect => Ok(Packet::Disconnect),
            _ => Err(Error::PayloadRequired),
        };
    }

    let packet = packet.freeze();
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(Connect::read(fixed_header, packet)?),
        PacketType::ConnAck => Packet::ConnAck(ConnAck::read(fixed_header, packet)?),
        PacketType::Publish => Packet::Publish(Publish::read(fixed_header, packet)?),
        PacketType::PubAck => Packet::PubAck(PubAck::read(fixed_header, packet)?),
        PacketType::PubRec => Packet::PubRec(PubRec::read(fixed_header, packet)?),
        PacketType::PubRel => Packet::PubRel(PubRel::read(fixed_header, packet)?),
        PacketType::PubComp => Packet::PubComp(PubComp::read(fixed_header, packet)?),
        PacketType::Subscribe => Packet::Subscribe(Subscribe::read(fixed_header, packet)?),
        PacketType::SubAck => Packet::SubAck(SubAck::read(fixed_header, packet)?),
        PacketType::Unsubscribe => {
            Packet::Unsubscribe(Unsubscribe::read(fixed_header, packet)?)
        }
        PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(fixed_header, packet)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    Ok(packet)
}

/// Reads a length prefixed series of bytes from the stream
fn read_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;

    // Reading a length prefixed field must never cross the packet boundary
    // promised by the fixed header.
    if len > stream.len() {
        return Err(Error::BoundaryCrossed(len));
    }

    Ok(stream.split_to(len))
}

/// Reads a length prefixed UTF-8 string from the stream
fn read_string(stream: &mut Bytes) -> Result<String, Error> {
    let s = read_bytes(stream)?;
    String::from_utf8(s.to_vec()).map_err(|_| Error::TopicNotUtf8)
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u8())
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

/// Serializes bytes to the stream, including the length prefix
fn write_bytes(stream: &mut BytesMut, bytes: &[u8]) {
    stream.put_u16(bytes.len() as u16);
    stream.extend_from_slice(bytes);
}

/// Serializes a length prefixed string to the stream
fn write_string(stream: &mut BytesMut, string: &str) {
    write_bytes(stream, string.as_bytes());
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encoded_length_size(len: usize) -> usize {
        let mut buffer = BytesMut::new();
        encode_remaining_length(&mut buffer, len).unwrap()
    }

    #[test]
    fn remaining_length_encodes_to_expected_sizes() {
        assert_eq!(encoded_length_size(0), 1);
        assert_eq!(encoded_length_size(127), 1);
        assert_eq!(encoded_length_size(128), 2);
        assert_eq!(encoded_length_size(16383), 2);
        assert_eq!(encoded_length_size(16384), 3);
        assert_eq!(encoded_length_size(2_097_151), 3);
        assert_eq!(encoded_length_size(2_097_152), 4);
        assert_eq!(encoded_length_size(268_435_455), 4);
    }

    #[test]
    fn remaining_length_above_max_fails() {
        let mut buffer = BytesMut::new();
        assert_eq!(
            encode_remaining_length(&mut buffer, MAX_REMAINING_LENGTH + 1),
            Err(Error::PayloadTooLong)
        );
    }

    #[test]
    fn remaining_length_roundtrips() {
        for len in [0, 1, 127, 128, 16383, 16384, 2_097_152, 268_435_455] {
            let mut buffer = BytesMut::new();
            let count = encode_remaining_length(&mut buffer, len).unwrap();
            let (len_len, decoded) = decode_remaining_length(buffer.iter()).unwrap();
            assert_eq!(len_len, count);
            assert_eq!(decoded, len);
        }
    }

    #[test]
    fn five_byte_remaining_length_is_malformed() {
        let stream = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            decode_remaining_length(stream.iter()),
            Err(Error::MalformedRemainingLength)
        );
    }

    #[test]
    fn truncated_remaining_length_asks_for_more_bytes() {
        let stream = [0xFF, 0xFF];
        assert_eq!(
            decode_remaining_length(stream.iter()),
            Err(Error::InsufficientBytes(1))
        );
    }

    #[test]
    fn oversized_packets_are_rejected_before_buffering() {
        let mut stream = BytesMut::new();
        let publish = Publish::new("a/b", QoS::AtMostOnce, vec![0u8; 512]);
        publish.write(&mut stream).unwrap();

        assert_eq!(
            read(&mut stream, 100),
            Err(Error::PayloadSizeLimitExceeded(517))
        );
    }

    #[test]
    fn reserved_flags_on_empty_packets_are_rejected() {
        let mut stream = BytesMut::from(&[0xC1u8, 0x00][..]);
        assert_eq!(read(&mut stream, 100), Err(Error::IncorrectPacketFormat));
    }

    #[test]
    fn every_packet_variant_roundtrips() {
        let mut connect = Connect::new("roundtrip");
        connect.keep_alive = 30;
        connect.clean_session = false;
        connect.login = Some(Login::new("user", "pass"));
        connect.last_will = Some(LastWill::new("will/topic", "gone", QoS::AtLeastOnce, true));

        let mut publish = Publish::new("a/b/c", QoS::ExactlyOnce, vec![1, 2, 3]);
        publish.pkid = 12;
        publish.retain = true;

        let mut subscribe = Subscribe::new("a/+", QoS::AtLeastOnce);
        subscribe.pkid = 2;
        subscribe.add("b/#".to_owned(), QoS::AtMostOnce);

        let mut unsubscribe = Unsubscribe::new("a/+");
        unsubscribe.pkid = 3;

        let packets = vec![
            Packet::Connect(connect),
            Packet::ConnAck(ConnAck::new(ConnectReturnCode::Accepted, true)),
            Packet::Publish(publish),
            Packet::PubAck(PubAck::new(12)),
            Packet::PubRec(PubRec::new(12)),
            Packet::PubRel(PubRel::new(12)),
            Packet::PubComp(PubComp::new(12)),
            Packet::Subscribe(subscribe),
            Packet::SubAck(SubAck::new(
                2,
                vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                ],
            )),
            Packet::Unsubscribe(unsubscribe),
            Packet::UnsubAck(UnsubAck::new(3)),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ];

        let mut stream = BytesMut::new();
        for packet in packets.iter() {
            packet.write(&mut stream).unwrap();
        }

        for expected in packets {
            let decoded = read(&mut stream, 10 * 1024).unwrap();
            assert_eq!(decoded, expected);
        }

        assert!(stream.is_empty());
    }
}
