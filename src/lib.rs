//! A minimal blocking MQTT 3.1.1 client.
//!
//! The crate drives a single broker connection from the caller's thread.
//! Publishes, subscriptions and the keep alive clock all make progress
//! inside the public calls themselves; there is no background thread and
//! no async runtime. Subscription callbacks run synchronously on the
//! loop and can stop it through [`LoopControl`].
//!
//! ```no_run
//! use mqttling::{Client, MqttOptions, QoS};
//!
//! let mut options = MqttOptions::new("demo-1", "broker.example.com", 1883);
//! options.set_keep_alive(std::time::Duration::from_secs(30));
//!
//! let mut client = Client::new(options);
//! client.connect().unwrap();
//! client
//!     .subscribe("hello/+", QoS::AtMostOnce, Box::new(|control, message| {
//!         println!("{}: {:?}", message.topic, message.payload);
//!         control.disconnect();
//!         Ok(())
//!     }))
//!     .unwrap();
//! client.publish("hello/world", QoS::AtLeastOnce, false, "hi").unwrap();
//! client.run().unwrap();
//! ```

#[macro_use]
extern crate log;

pub mod client;
pub mod codec;
pub mod router;
pub mod state;
#[cfg(feature = "use-rustls")]
mod tls;
pub mod transport;

pub use client::{Client, ClientError};
pub use codec::{Packet, QoS};
pub use router::{Callback, LoopControl, Message};
pub use state::ConnectionStatus;

use codec::LastWill;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "use-rustls")]
use std::sync::Arc;

/// Transport methods. Defaults to TCP.
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp,
    #[cfg(feature = "use-rustls")]
    Tls(TlsConfiguration),
}

impl Default for Transport {
    fn default() -> Transport {
        Transport::Tcp
    }
}

impl Transport {
    pub fn tcp() -> Transport {
        Transport::Tcp
    }

    #[cfg(feature = "use-rustls")]
    pub fn tls(config: TlsConfiguration) -> Transport {
        Transport::Tls(config)
    }
}

/// TLS configuration method
#[cfg(feature = "use-rustls")]
#[derive(Debug, Clone)]
pub enum TlsConfiguration {
    Simple {
        /// PEM encoded CA bundle. `None` uses the platform's root store.
        ca: Option<Vec<u8>>,
        /// ALPN settings
        alpn: Option<Vec<Vec<u8>>>,
        /// Skip server certificate verification. Off by default; turning
        /// it on is logged at warn level.
        danger_accept_invalid_certs: bool,
    },
    /// Injected rustls ClientConfig for TLS, to allow more customisation
    Rustls(Arc<rustls::ClientConfig>),
}

#[cfg(feature = "use-rustls")]
impl TlsConfiguration {
    /// Verifies the broker against the given PEM encoded CA bundle
    pub fn with_ca(ca: impl Into<Vec<u8>>) -> TlsConfiguration {
        TlsConfiguration::Simple {
            ca: Some(ca.into()),
            alpn: None,
            danger_accept_invalid_certs: false,
        }
    }

    /// Verifies the broker against the platform's root store
    pub fn with_platform_roots() -> TlsConfiguration {
        TlsConfiguration::Simple {
            ca: None,
            alpn: None,
            danger_accept_invalid_certs: false,
        }
    }
}

/// Events the loop makes progress on, as observed through
/// [`Client::poll`](crate::Client::poll)
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Incoming packet from the broker
    Incoming(Packet),
    /// Outgoing packet to the broker
    Outgoing(Outgoing),
}

/// Current outgoing activity on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing {
    /// Publish packet with packet identifier. 0 if QoS 0
    Publish(u16),
    Subscribe(u16),
    Unsubscribe(u16),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    PingReq,
    Disconnect,
}

/// Options to configure the behaviour of the mqtt connection
#[derive(Clone)]
pub struct MqttOptions {
    /// broker address that you want to connect to
    broker_addr: String,
    /// broker port
    port: u16,
    /// keep alive time to send pingreq to broker when the connection is idle
    keep_alive: Duration,
    /// client identifier
    client_id: String,
    /// clean (or) persistent session
    clean_session: bool,
    /// username and password
    credentials: Option<(String, String)>,
    /// connection timeout covering TCP connect, TLS handshake and connack
    connect_timeout: Duration,
    /// how long an in-flight packet may wait for its ack before a
    /// retransmission
    ack_timeout: Duration,
    /// retransmissions per in-flight packet before delivery fails
    max_retries: u8,
    /// largest packet accepted from the broker
    max_packet_size: usize,
    /// transport to use
    transport: Transport,
    /// last will that the broker publishes on our behalf on an unclean
    /// disconnect
    last_will: Option<LastWill>,
}

impl MqttOptions {
    /// New mqtt options
    pub fn new<S: Into<String>, T: Into<String>>(id: S, host: T, port: u16) -> MqttOptions {
        let id = id.into();
        assert!(!id.starts_with(' ') && !id.is_empty(), "Invalid client id");

        MqttOptions {
            broker_addr: host.into(),
            port,
            keep_alive: Duration::from_secs(60),
            client_id: id,
            clean_session: true,
            credentials: None,
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            max_packet_size: 10 * 1024,
            transport: Transport::Tcp,
            last_will: None,
        }
    }

    /// New mqtt options with a generated client id. The suffix comes from
    /// a CSPRNG, so concurrently started clients won't collide the way
    /// short numeric ids do. Brokers drop the older session when two
    /// clients share an id.
    pub fn with_random_id<S: Into<String>, T: Into<String>>(
        prefix: S,
        host: T,
        port: u16,
    ) -> MqttOptions {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let id = format!("{}-{}", prefix.into(), suffix);
        MqttOptions::new(id, host, port)
    }

    /// Broker address
    pub fn broker_address(&self) -> (String, u16) {
        (self.broker_addr.clone(), self.port)
    }

    /// Set number of seconds after which client should ping the broker
    /// if there is no other data exchange
    pub fn set_keep_alive(&mut self, duration: Duration) -> &mut Self {
        assert!(
            duration.is_zero() || duration.as_secs() >= 1,
            "Keep alives should be either 0 or >= 1 second"
        );
        // the connect packet carries keep alive as a u16 of seconds
        assert!(
            duration.as_secs() <= u16::MAX as u64,
            "Keep alives can't exceed 65535 seconds"
        );

        self.keep_alive = duration;
        self
    }

    /// Keep alive time
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Client identifier
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `clean_session = true` removes all the state from queues & instructs the broker
    /// to clean all the client state when client disconnects.
    ///
    /// When set `false`, broker will hold the client state and performs pending
    /// operations on the client when reconnection with same `client_id`
    /// happens. Local queue state is also held to retransmit packets after reconnection.
    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        assert!(
            !self.client_id.is_empty() || clean_session,
            "Persistent sessions need a client id"
        );

        self.clean_session = clean_session;
        self
    }

    /// Clean session
    pub fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Username and password
    pub fn set_credentials<U: Into<String>, P: Into<String>>(
        &mut self,
        username: U,
        password: P,
    ) -> &mut Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Security options
    pub fn credentials(&self) -> Option<(String, String)> {
        self.credentials.clone()
    }

    /// Time budget for TCP connect, TLS handshake and the connack
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// How long an in-flight QoS 1/2 packet (or a pingreq) may wait for
    /// its ack
    pub fn set_ack_timeout(&mut self, timeout: Duration) -> &mut Self {
        assert!(!timeout.is_zero(), "Ack timeout can't be 0");
        self.ack_timeout = timeout;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Retransmissions per in-flight packet before giving up on delivery
    pub fn set_max_retries(&mut self, retries: u8) -> &mut Self {
        self.max_retries = retries;
        self
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Largest packet accepted from the broker
    pub fn set_max_packet_size(&mut self, size: usize) -> &mut Self {
        self.max_packet_size = size;
        self
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Transport to use
    pub fn set_transport(&mut self, transport: Transport) -> &mut Self {
        self.transport = transport;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Will that the broker forwards on behalf of this client on an
    /// unclean disconnect
    pub fn set_last_will(&mut self, will: LastWill) -> &mut Self {
        self.last_will = Some(will);
        self
    }

    pub fn last_will(&self) -> Option<LastWill> {
        self.last_will.clone()
    }
}

// Implement Debug manually because std::fmt::Debug for the credentials
// would leak the password into logs
impl fmt::Debug for MqttOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttOptions")
            .field("broker_addr", &self.broker_addr)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("max_retries", &self.max_retries)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[should_panic]
    fn client_id_startswith_space() {
        let _mqtt_opts = MqttOptions::new(" client_a", "127.0.0.1", 1883);
    }

    #[test]
    #[should_panic]
    fn no_client_id() {
        let _mqtt_opts = MqttOptions::new("", "127.0.0.1", 1883);
    }

    #[test]
    #[should_panic]
    fn keep_alive_above_the_wire_limit() {
        let mut options = MqttOptions::new("client_a", "127.0.0.1", 1883);
        options.set_keep_alive(Duration::from_secs(u16::MAX as u64 + 1));
    }

    #[test]
    fn keep_alive_at_the_wire_limit_is_accepted() {
        let mut options = MqttOptions::new("client_a", "127.0.0.1", 1883);
        options.set_keep_alive(Duration::from_secs(u16::MAX as u64));
        assert_eq!(options.keep_alive(), Duration::from_secs(u16::MAX as u64));
    }

    #[test]
    fn random_ids_carry_the_prefix_and_differ() {
        let a = MqttOptions::with_random_id("sensor", "127.0.0.1", 1883);
        let b = MqttOptions::with_random_id("sensor", "127.0.0.1", 1883);
        assert!(a.client_id().starts_with("sensor-"));
        assert_eq!(a.client_id().len(), "sensor-".len() + 12);
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn debug_output_hides_credentials() {
        let mut options = MqttOptions::new("client_a", "127.0.0.1", 1883);
        options.set_credentials("user", "hunter2");
        let debug = format!("{:?}", options);
        assert!(!debug.contains("hunter2"));
    }
}
