use super::*;
use bytes::{Buf, Bytes};

/// Acknowledgement to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

impl UnsubAck {
    pub fn new(pkid: u16) -> UnsubAck {
        UnsubAck { pkid }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<UnsubAck, Error> {
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

        Ok(UnsubAck { pkid })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        buffer.put_u8(0xB0);
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
    fn unsuback_parsing_works() {
        let stream = &[0xB0, 0x02, 0x00, 0x23];
        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let ack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = UnsubAck::read(fixed_header, ack_bytes).unwrap();
        assert_eq!(packet, UnsubAck { pkid: 35 });
    }

    #[test]
    fn unsuback_encoding_works() {
        let mut buf = BytesMut::new();
        UnsubAck::new(35).write(&mut buf).unwrap();
        assert_eq!(buf, vec![0xB0, 0x02, 0x00, 0x23]);
    }
}
