use bytes::BytesMut;
use mqttling::codec::{self, ConnAck, ConnectReturnCode, Packet};

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// Single connection broker for integration tests. Runs on its own
/// thread and speaks raw packets, so every test controls the broker side
/// of the conversation exactly.
pub struct Broker {
    stream: TcpStream,
    read: BytesMut,
}

impl Broker {
    /// Accepts one connection, consumes the connect packet and answers
    /// with a connack carrying `code`
    pub fn accept(listener: TcpListener, code: ConnectReturnCode) -> Broker {
        let (stream, _) = listener.accept().unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();

        let mut broker = Broker {
            stream,
            read: BytesMut::new(),
        };

        match broker.read_packet() {
            Packet::Connect(_) => (),
            packet => panic!("expecting connect. received {:?}", packet),
        }

        broker.send(&Packet::ConnAck(ConnAck::new(code, false)));
        broker
    }

    /// Reads the next packet, panicking if the peer closes or stalls
    pub fn read_packet(&mut self) -> Packet {
        loop {
            match codec::read(&mut self.read, 10 * 1024) {
                Ok(packet) => return packet,
                Err(codec::Error::InsufficientBytes(_)) => (),
                Err(e) => panic!("broker couldn't frame a packet: {:?}", e),
            }

            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).unwrap();
            if n == 0 {
                panic!("connection closed while expecting a packet");
            }

            self.read.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn send(&mut self, packet: &Packet) {
        let mut buffer = BytesMut::new();
        packet.write(&mut buffer).unwrap();
        self.stream.write_all(&buffer).unwrap();
        self.stream.flush().unwrap();
    }

    /// Puts raw bytes on the wire, for frames the codec refuses to build
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    /// Blocks until the peer closes the connection
    pub fn wait_close(&mut self) {
        let mut chunk = [0u8; 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}
