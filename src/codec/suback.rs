use super::*;
use bytes::{Buf, Bytes};

/// Acknowledgement to subscribe
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// Broker's ack of each filter in the subscribe packet. 0x80 marks a
/// rejected filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubAck {
    pub fn new(pkid: u16, return_codes: Vec<SubscribeReturnCode>) -> SubAck {
        SubAck { pkid, return_codes }
    }

    fn len(&self) -> usize {
        2 + self.return_codes.len()
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
        let variable_header_index = fixed_header.header_len;
        bytes.advance(variable_header_index);
        let pkid = read_u16(&mut bytes)?;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        if !bytes.has_remaining() {
            return Err(Error::MalformedPacket);
        }

        let mut return_codes = Vec::new();
        while bytes.has_remaining() {
            let return_code = read_u8(&mut bytes)?;
            match return_code {
                0 | 1 | 2 => return_codes.push(SubscribeReturnCode::Success(qos(return_code)?)),
                128 => return_codes.push(SubscribeReturnCode::Failure),
                code => return Err(Error::InvalidSubscribeReturnCode(code)),
            }
        }

        Ok(SubAck { pkid, return_codes })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        buffer.put_u8(0x90);
        let len = self.len();
        let count = encode_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);

        for code in self.return_codes.iter() {
            let code = match code {
                SubscribeReturnCode::Success(qos) => *qos as u8,
                SubscribeReturnCode::Failure => 0x80,
            };

            buffer.put_u8(code);
        }

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn suback_parsing_works() {
        let stream = &[
            0x90, 4, // packet type, flags and remaining len
            0x00, 0x0F, // variable header. pkid = 15
            0x01, 0x80, // payload. return codes [success qos1, failure]
            0xDE, 0xAD, 0xBE, 0xEF, // extra packets in the stream
        ];

        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let ack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = SubAck::read(fixed_header, ack_bytes).unwrap();

        assert_eq!(
            packet,
            SubAck {
                pkid: 15,
                return_codes: vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                ],
            }
        );
    }

    #[test]
    fn suback_encoding_works() {
        let suback = SubAck::new(
            15,
            vec![
                SubscribeReturnCode::Success(QoS::AtLeastOnce),
                SubscribeReturnCode::Failure,
            ],
        );

        let mut buf = BytesMut::new();
        suback.write(&mut buf).unwrap();
        assert_eq!(buf, vec![0x90, 4, 0x00, 0x0F, 0x01, 0x80]);
    }

    #[test]
    fn suback_with_invalid_return_code_is_rejected() {
        let stream = &[0x90, 3, 0x00, 0x0F, 0x05];
        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let ack_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        assert_eq!(
            SubAck::read(fixed_header, ack_bytes),
            Err(Error::InvalidSubscribeReturnCode(5))
        );
    }
}
