use super::*;
use bytes::{Buf, Bytes};

/// Release of a QoS2 publish, second leg of the handshake. The fixed
/// header flags carry a mandatory 0b0010.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

impl PubRel {
    pub fn new(pkid: u16) -> PubRel {
        PubRel { pkid }
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubRel, Error> {
        if fixed_header.flags() != 0b0010 {
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

        Ok(PubRel { pkid })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        buffer.put_u8(0x62);
        buffer.put_u8(0x02);
        buffer.put_u16(self.pkid);
        Ok(4)
    }
}
