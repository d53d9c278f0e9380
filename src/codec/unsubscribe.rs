use super::*;
use bytes::{Buf, Bytes};

/// Unsubscribe packet
#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

impl Unsubscribe {
    pub fn new<S: Into<String>>(topic: S) -> Unsubscribe {
        Unsubscribe {
            pkid: 0,
            topics: vec![topic.into()],
        }
    }

    fn len(&self) -> usize {
        // len of pkid + vec![unsubscribe topic len]
        2 + self.topics.iter().fold(0, |s, t| s + t.len() + 2)
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
        if fixed_header.flags() != 0b0010 {
            return Err(Error::IncorrectPacketFormat);
        }

        let variable_header_index = fixed_header.header_len;
        bytes.advance(variable_header_index);

        let pkid = read_u16(&mut bytes)?;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        let mut payload_bytes = fixed_header.remaining_len - 2;
        let mut topics = Vec::new();

        while payload_bytes > 0 {
            let topic = read_string(&mut bytes)?;
            payload_bytes -= topic.len() + 2;
            topics.push(topic);
        }

        if topics.is_empty() {
            return Err(Error::PayloadRequired);
        }

        Ok(Unsubscribe { pkid, topics })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        if self.topics.is_empty() {
            return Err(Error::PayloadRequired);
        }

        let len = self.len();
        buffer.put_u8(0xA2);
        let count = encode_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);

        for topic in self.topics.iter() {
            write_string(buffer, topic);
        }

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unsubscribe_parsing_works() {
        let stream = &[
            0xA2, 12, // packet type, flags and remaining len
            0x00, 0x23, // variable header. pkid = 35
            0x00, 0x03, b'a', b'/', b'+', // payload. topic filter = 'a/+'
            0x00, 0x03, b'b', b'/', b'c', // payload. topic filter = 'b/c'
            0xDE, 0xAD, 0xBE, 0xEF, // extra packets in the stream
        ];

        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let unsubscribe_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = Unsubscribe::read(fixed_header, unsubscribe_bytes).unwrap();

        assert_eq!(
            packet,
            Unsubscribe {
                pkid: 35,
                topics: vec!["a/+".to_owned(), "b/c".to_owned()],
            }
        );
    }

    #[test]
    fn unsubscribe_encoding_works() {
        let mut unsubscribe = Unsubscribe::new("a/+");
        unsubscribe.pkid = 35;
        unsubscribe.topics.push("b/c".to_owned());

        let mut buf = BytesMut::new();
        unsubscribe.write(&mut buf).unwrap();

        assert_eq!(
            buf,
            vec![
                0xA2, 12, 0x00, 0x23, 0x00, 0x03, b'a', b'/', b'+', 0x00, 0x03, b'b', b'/', b'c'
            ]
        );
    }
}
