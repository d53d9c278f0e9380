//! Blocking network transport with packet framing on top.
//!
//! [`Network`] owns the socket plus the read and write buffers and speaks
//! whole packets. Reads and writes carry caller supplied timeouts through
//! `set_read_timeout`/`set_write_timeout`; a read that can't frame a full
//! packet within its timeout yields `None` so the caller's loop can tick.

use crate::codec::{self, Packet};
#[cfg(feature = "use-rustls")]
use crate::tls;
use crate::{MqttOptions, Transport};

use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Critical errors during network operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[cfg(feature = "use-rustls")]
    #[error("TLS: {0}")]
    Tls(#[from] tls::Error),
    #[error("Connection closed by peer")]
    ConnectionAborted,
    #[error("Timeout")]
    Timeout,
    #[error("Couldn't resolve the broker address")]
    AddressResolution,
    #[error("Malformed packet: {0}")]
    Malformed(#[from] codec::Error),
}

enum Socket {
    Tcp(TcpStream),
    #[cfg(feature = "use-rustls")]
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Socket {
    fn stream(&self) -> &TcpStream {
        match self {
            Socket::Tcp(tcp) => tcp,
            #[cfg(feature = "use-rustls")]
            Socket::Tls(tls) => tls.get_ref(),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(tcp) => tcp.read(buf),
            #[cfg(feature = "use-rustls")]
            Socket::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(tcp) => tcp.write(buf),
            #[cfg(feature = "use-rustls")]
            Socket::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(tcp) => tcp.flush(),
            #[cfg(feature = "use-rustls")]
            Socket::Tls(tls) => tls.flush(),
        }
    }
}

/// Frames mqtt packets over a blocking socket
pub struct Network {
    socket: Socket,
    /// Buffered reads
    read: BytesMut,
    /// Buffered writes
    write: BytesMut,
    /// Maximum packet size accepted from the broker
    max_packet_size: usize,
}

impl Network {
    /// Resolves the broker address, establishes the TCP connection within
    /// the connect timeout and performs the TLS handshake when the
    /// transport asks for one.
    pub fn connect(options: &MqttOptions) -> Result<Network, Error> {
        let (host, port) = options.broker_address();
        let timeout = options.connect_timeout();

        let mut addrs = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| Error::AddressResolution)?
            .peekable();
        if addrs.peek().is_none() {
            return Err(Error::AddressResolution);
        }

        let mut last_error = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }

        let tcp = match tcp {
            Some(tcp) => tcp,
            None => match last_error {
                Some(e) => return Err(Error::Io(e)),
                None => return Err(Error::AddressResolution),
            },
        };

        tcp.set_nodelay(true)?;

        let socket = match options.transport() {
            Transport::Tcp => {
                debug!("Connected to {}:{} over tcp", host, port);
                Socket::Tcp(tcp)
            }
            #[cfg(feature = "use-rustls")]
            Transport::Tls(tls_config) => {
                let stream = tls::tls_connect(&host, tls_config, tcp, timeout)?;
                debug!("Connected to {}:{} over tls", host, port);
                Socket::Tls(Box::new(stream))
            }
        };

        Ok(Network {
            socket,
            read: BytesMut::with_capacity(10 * 1024),
            write: BytesMut::with_capacity(10 * 1024),
            max_packet_size: options.max_packet_size(),
        })
    }

    /// Reads the next complete packet, blocking at most `timeout`.
    /// `Ok(None)` means nothing complete arrived in time.
    pub fn read_packet(&mut self, timeout: Duration) -> Result<Option<Packet>, Error> {
        let deadline = Instant::now() + timeout;
        let mut first = true;

        loop {
            match codec::read(&mut self.read, self.max_packet_size) {
                Ok(packet) => return Ok(Some(packet)),
                Err(codec::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(Error::Malformed(e)),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !first {
                return Ok(None);
            }

            // set_read_timeout(Some(0)) is an invalid argument. A partial
            // frame already buffered still deserves one short read.
            let wait = remaining.max(Duration::from_millis(1));
            first = false;

            self.socket.stream().set_read_timeout(Some(wait))?;
            let mut chunk = [0u8; 4096];
            match self.socket.read(&mut chunk) {
                Ok(0) => return Err(Error::ConnectionAborted),
                Ok(n) => self.read.extend_from_slice(&chunk[..n]),
                Err(e) if would_block(&e) => return Ok(None),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Serializes the packet and flushes it within `timeout`
    pub fn write_packet(&mut self, packet: &Packet, timeout: Duration) -> Result<(), Error> {
        packet.write(&mut self.write)?;

        self.socket.stream().set_write_timeout(Some(timeout))?;
        let result = self
            .socket
            .write_all(&self.write)
            .and_then(|_| self.socket.flush());
        self.write.clear();

        result.map_err(|e| {
            if would_block(&e) {
                Error::Timeout
            } else {
                Error::Io(e)
            }
        })
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
