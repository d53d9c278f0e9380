use super::*;
use bytes::{Buf, Bytes};

/// Acknowledgement to QoS1 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

impl PubAck {
    pub fn new(pkid: u16) -> PubAck {
        PubAck { pkid }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubAck, Error> {
        if fixed_header.flags() != 0 {
            return Err(Error::IncorrectPacketFormat);
        }

        let variable_header_index = fixed_header.header_len;
        bytes.advance(variable_header_index);

        if fixed_header.remaining_len != 2 {
            return Err(Error::MalformedPacket);
        }

        let pkid = read_u16(&mut bytes)?;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        Ok(PubAck { pkid })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        buffer.put_u8(0x40);
        buffer.put_u8(0x02);
        buffer.put_u16(self.pkid);
        Ok(4)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn puback_parsing_works() {
        let stream = &[
            0b0100_0000,
            0x02, // packet type, flags and remaining len
            0x00,
            0x0a, // variable header. pkid = 10
            0xDE,
            0xAD,
            0xBE,
            0xEF, // extra packets in the stream
        ];

        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let ack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = PubAck::read(fixed_header, ack_bytes).unwrap();
        assert_eq!(packet, PubAck { pkid: 10 });
    }

    #[test]
    fn puback_encoding_works() {
        let mut buf = BytesMut::new();
        PubAck::new(10).write(&mut buf).unwrap();
        assert_eq!(buf, vec![0b0100_0000, 0x02, 0x00, 0x0a]);
    }

    #[test]
    fn puback_with_zero_pkid_is_rejected() {
        let stream = &[0b0100_0000, 0x02, 0x00, 0x00];
        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let ack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        assert_eq!(PubAck::read(fixed_header, ack_bytes), Err(Error::PacketIdZero));
    }
}
