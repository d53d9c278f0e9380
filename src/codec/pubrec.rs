use super::*;
use bytes::{Buf, Bytes};

/// Acknowledgement of a QoS2 publish, first leg of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

impl PubRec {
    pub fn new(pkid: u16) -> PubRec {
        PubRec { pkid }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubRec, Error> {
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

        Ok(PubRec { pkid })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        buffer.put_u8(0x50);
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
    fn pubrec_parsing_works() {
        let stream = &[0b0101_0000, 0x02, 0x00, 0x0a];
        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let ack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = PubRec::read(fixed_header, ack_bytes).unwrap();
        assert_eq!(packet, PubRec { pkid: 10 });
    }

    #[test]
    fn pubrec_encoding_works() {
        let mut buf = BytesMut::new();
        PubRec::new(10).write(&mut buf).unwrap();
        assert_eq!(buf, vec![0b0101_0000, 0x02, 0x00, 0x0a]);
    }
}
