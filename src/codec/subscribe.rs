use super::*;
use bytes::{Buf, Bytes};

/// Subscription packet
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscription filter
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl Subscribe {
    pub fn new<S: Into<String>>(path: S, qos: QoS) -> Subscribe {
        let filter = SubscribeFilter {
            path: path.into(),
            qos,
        };

        Subscribe {
            pkid: 0,
            filters: vec![filter],
        }
    }

    pub fn add(&mut self, path: String, qos: QoS) -> &mut Self {
        let filter = SubscribeFilter { path, qos };
        self.filters.push(filter);
        self
    }

    fn len(&self) -> usize {
        // len of pkid + vec![subscribe filter len]
        2 + self
            .filters
            .iter()
            .fold(0, |s, t| s + t.path.len() + 2 + 1)
    }

    pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Subscribe, Error> {
        if fixed_header.flags() != 0b0010 {
            return Err(Error::IncorrectPacketFormat);
        }

        let variable_header_index = fixed_header.header_len;
        bytes.advance(variable_header_index);

        let pkid = read_u16(&mut bytes)?;
        if pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        // variable header size = 2 (packet identifier)
        let mut payload_bytes = fixed_header.remaining_len - 2;
        let mut filters = Vec::new();

        while payload_bytes > 0 {
            let path = read_string(&mut bytes)?;
            let requested_qos = read_u8(&mut bytes)?;
            payload_bytes -= path.len() + 3;
            filters.push(SubscribeFilter {
                path,
                qos: qos(requested_qos)?,
            });
        }

        if filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        Ok(Subscribe { pkid, filters })
    }

    pub fn write(&self, buffer: &mut BytesMut) -> Result<usize, Error> {
        if self.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        if self.filters.is_empty() {
            return Err(Error::PayloadRequired);
        }

        let len = self.len();
        buffer.put_u8(0x82);
        let count = encode_remaining_length(buffer, len)?;
        buffer.put_u16(self.pkid);

        for filter in self.filters.iter() {
            write_string(buffer, &filter.path);
            buffer.put_u8(filter.qos as u8);
        }

        Ok(1 + count + len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribe_parsing_works() {
        let stream = &[
            0b1000_0010,
            20, // packet type, flags and remaining len
            0x01,
            0x04, // variable header. pkid = 260
            0x00,
            0x03,
            b'a',
            b'/',
            b'+', // payload. topic filter = 'a/+'
            0x00, // payload. qos = 0
            0x00,
            0x01,
            b'#', // payload. topic filter = '#'
            0x01, // payload. qos = 1
            0x00,
            0x05,
            b'a',
            b'/',
            b'b',
            b'/',
            b'c', // payload. topic filter = 'a/b/c'
            0x02, // payload. qos = 2
            0xDE,
            0xAD,
            0xBE,
            0xEF, // extra packets in the stream
        ];

        let mut stream = BytesMut::from(&stream[..]);
        let fixed_header = parse_fixed_header(stream.iter()).unwrap();
        let subscribe_bytes = stream.split_to(fixed_header.frame_length()).freeze();
        let packet = Subscribe::read(fixed_header, subscribe_bytes).unwrap();

        assert_eq!(
            packet,
            Subscribe {
                pkid: 260,
                filters: vec![
                    SubscribeFilter {
                        path: "a/+".to_owned(),
                        qos: QoS::AtMostOnce,
                    },
                    SubscribeFilter {
                        path: "#".to_owned(),
                        qos: QoS::AtLeastOnce,
                    },
                    SubscribeFilter {
                        path: "a/b/c".to_owned(),
                        qos: QoS::ExactlyOnce,
                    },
                ],
            }
        );
    }

    #[test]
    fn subscribe_encoding_works() {
        let mut subscribe = Subscribe::new("a/+", QoS::AtMostOnce);
        subscribe.pkid = 260;
        subscribe
            .add("#".to_owned(), QoS::AtLeastOnce)
            .add("a/b/c".to_owned(), QoS::ExactlyOnce);

        let mut buf = BytesMut::new();
        subscribe.write(&mut buf).unwrap();

        assert_eq!(
            buf,
            vec![
                0b1000_0010,
                20,
                0x01,
                0x04,
                0x00,
                0x03,
                b'a',
                b'/',
                b'+',
                0x00,
                0x00,
                0x01,
                b'#',
                0x01,
                0x00,
                0x05,
                b'a',
                b'/',
                b'b',
                b'/',
                b'c',
                0x02
            ]
        );
    }

    #[test]
    fn subscribe_with_zero_pkid_is_rejected() {
        let subscribe = Subscribe::new("a/+", QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        assert_eq!(subscribe.write(&mut buf), Err(Error::PacketIdZero));
    }
}
