//! High level blocking MQTT client.
//!
//! [`Client`] composes the transport, the session state machine and the
//! router into one synchronous facade. Everything runs on the caller's
//! thread; progress happens inside the public calls themselves, each of
//! which drives the same cooperative tick.

use crate::codec::{
    self, topic, Connect, ConnectReturnCode, Login, Packet, Publish, QoS, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
use crate::router::{Callback, LoopControl, Message, Router};
use crate::state::{ConnectionStatus, SessionState, StateError};
use crate::transport::{self, Network};
use crate::{Event, MqttOptions};

use std::time::{Duration, Instant};

/// Critical errors during client operation
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Serialization error: {0}")]
    MalformedPacket(#[from] codec::Error),
    #[error("Broker refused the connection: {0:?}")]
    ConnectionRefused(ConnectReturnCode),
    #[error("Network error: {0}")]
    Transport(transport::Error),
    #[error("Delivery failed after exhausting retries. pkid = {0}")]
    DeliveryFailed(u16),
    #[error("Broker rejected the subscription: {0}")]
    SubscribeRejected(String),
    #[error("Invalid publish topic: {0}")]
    InvalidTopic(String),
    #[error("Invalid subscription filter: {0}")]
    InvalidFilter(String),
    #[error("Session error: {0}")]
    Session(#[from] StateError),
}

// A decode fault inside the transport is the application's malformed
// packet, not a network problem.
impl From<transport::Error> for ClientError {
    fn from(e: transport::Error) -> ClientError {
        match e {
            transport::Error::Malformed(e) => ClientError::MalformedPacket(e),
            e => ClientError::Transport(e),
        }
    }
}

/// A blocking MQTT 3.1.1 client driving a single connection
pub struct Client {
    options: MqttOptions,
    state: SessionState,
    router: Router,
    network: Option<Network>,
    disconnect_pending: bool,
}

impl Client {
    pub fn new(options: MqttOptions) -> Client {
        let state = SessionState::new(
            options.keep_alive(),
            options.ack_timeout(),
            options.max_retries(),
        );

        Client {
            options,
            state,
            router: Router::new(),
            network: None,
            disconnect_pending: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.network.is_some() && self.state.is_connected()
    }

    /// Establishes the connection and completes the CONNECT/CONNACK
    /// exchange. A no-op while already connected.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = SessionState::new(
            self.options.keep_alive(),
            self.options.ack_timeout(),
            self.options.max_retries(),
        );
        self.disconnect_pending = false;

        let mut network = Network::connect(&self.options)?;

        let mut connect = Connect::new(self.options.client_id());
        connect.keep_alive = self.options.keep_alive().as_secs() as u16;
        connect.clean_session = self.options.clean_session();
        connect.last_will = self.options.last_will();
        if let Some((username, password)) = self.options.credentials() {
            connect.login = Some(Login::new(username, password));
        }

        let now = Instant::now();
        network.write_packet(&Packet::Connect(connect), self.options.connect_timeout())?;
        self.state.await_connack(now);

        match network.read_packet(self.options.connect_timeout())? {
            Some(Packet::ConnAck(connack)) if connack.code == ConnectReturnCode::Accepted => {
                info!(
                    "Connected to {}:{}. session present = {}",
                    self.options.broker_address().0,
                    self.options.broker_address().1,
                    connack.session_present
                );
                self.state.on_connected(Instant::now());
                self.network = Some(network);
                Ok(())
            }
            Some(Packet::ConnAck(connack)) => {
                self.state.reset();
                Err(ClientError::ConnectionRefused(connack.code))
            }
            Some(packet) => {
                error!("Expecting connack, received {:?}", packet);
                self.state.reset();
                Err(ClientError::Session(StateError::WrongPacket))
            }
            None => {
                self.state.reset();
                Err(ClientError::Transport(transport::Error::Timeout))
            }
        }
    }

    /// Publishes a message. QoS 0 returns as soon as the write finishes;
    /// QoS 1/2 drives the loop until the handshake completes or the retry
    /// budget runs out.
    pub fn publish<S, P>(
        &mut self,
        topic: S,
        qos: QoS,
        retain: bool,
        payload: P,
    ) -> Result<(), ClientError>
    where
        S: Into<String>,
        P: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if !topic::valid_topic(&topic) {
            return Err(ClientError::InvalidTopic(topic));
        }

        let mut publish = Publish::new(topic, qos, payload);
        publish.retain = retain;

        let packet = self.state.handle_outgoing_publish(publish, Instant::now())?;
        let pkid = match &packet {
            Packet::Publish(publish) => publish.pkid,
            _ => unreachable!(),
        };

        self.write(&packet)?;

        if qos == QoS::AtMostOnce {
            return Ok(());
        }

        let wait = self.tick_interval();
        while self.state.is_publish_inflight(pkid) {
            self.tick(wait)?;
        }

        if self.state.take_failure(pkid) {
            return Err(ClientError::DeliveryFailed(pkid));
        }

        Ok(())
    }

    /// Subscribes the callback to a topic filter and waits for the
    /// broker's ack. The registration happens before the SUBSCRIBE goes
    /// out, so a publish racing the ack is not lost. Returns the granted
    /// QoS.
    pub fn subscribe<S: Into<String>>(
        &mut self,
        filter: S,
        qos: QoS,
        callback: Callback,
    ) -> Result<QoS, ClientError> {
        let filter = filter.into();
        if !topic::valid_filter(&filter) {
            return Err(ClientError::InvalidFilter(filter));
        }

        self.router.add(filter.clone(), callback);

        let subscribe = Subscribe::new(filter.clone(), qos);
        let packet = match self.state.handle_outgoing_subscribe(subscribe) {
            Ok(packet) => packet,
            Err(e) => {
                self.router.remove(&filter);
                return Err(e.into());
            }
        };
        let pkid = match &packet {
            Packet::Subscribe(subscribe) => subscribe.pkid,
            _ => unreachable!(),
        };

        if let Err(e) = self.write(&packet) {
            self.router.remove(&filter);
            return Err(e);
        }

        let deadline = Instant::now() + self.options.ack_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state.abandon_subscribe(pkid);
                self.router.remove(&filter);
                return Err(ClientError::Transport(transport::Error::Timeout));
            }

            let event = match self.tick(remaining) {
                Ok(event) => event,
                Err(e) => {
                    self.router.remove(&filter);
                    return Err(e);
                }
            };

            if let Some(Event::Incoming(Packet::SubAck(suback))) = event {
                if suback.pkid != pkid {
                    continue;
                }

                return match suback.return_codes.first() {
                    Some(SubscribeReturnCode::Success(granted)) => Ok(*granted),
                    _ => {
                        self.router.remove(&filter);
                        Err(ClientError::SubscribeRejected(filter))
                    }
                };
            }
        }
    }

    /// Unsubscribes the filter and waits for the broker's ack before
    /// dropping the callback registration
    pub fn unsubscribe<S: Into<String>>(&mut self, filter: S) -> Result<(), ClientError> {
        let filter = filter.into();
        let unsubscribe = Unsubscribe::new(filter.clone());
        let packet = self.state.handle_outgoing_unsubscribe(unsubscribe)?;
        let pkid = match &packet {
            Packet::Unsubscribe(unsubscribe) => unsubscribe.pkid,
            _ => unreachable!(),
        };

        self.write(&packet)?;

        let deadline = Instant::now() + self.options.ack_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.state.abandon_unsubscribe(pkid);
                return Err(ClientError::Transport(transport::Error::Timeout));
            }

            if let Some(Event::Incoming(Packet::UnsubAck(unsuback))) = self.tick(remaining)? {
                if unsuback.pkid != pkid {
                    continue;
                }

                self.router.remove(&filter);
                return Ok(());
            }
        }
    }

    /// Makes at most one unit of progress: a buffered event, the keep
    /// alive clock, overdue retransmissions, then one inbound frame.
    /// `Ok(None)` means the wait elapsed with nothing to do.
    pub fn poll(&mut self, wait: Duration) -> Result<Option<Event>, ClientError> {
        let event = self.tick(wait)?;
        if self.disconnect_pending {
            self.disconnect()?;
        }

        Ok(event)
    }

    /// Cooperative blocking loop. Returns when a callback requests a
    /// disconnect through [`LoopControl`] or the connection dies.
    pub fn run(&mut self) -> Result<(), ClientError> {
        let wait = self.tick_interval();
        loop {
            if self.disconnect_pending {
                return self.disconnect();
            }

            self.tick(wait)?;
        }
    }

    /// Sends a best effort DISCONNECT and releases the connection. Always
    /// ends in `Disconnected`.
    pub fn disconnect(&mut self) -> Result<(), ClientError> {
        if let Some(network) = &mut self.network {
            self.state.disconnecting();
            if let Err(e) = network.write_packet(&Packet::Disconnect, self.options.ack_timeout()) {
                debug!("Disconnect write failed: {}", e);
            }
        }

        self.network = None;
        self.state.reset();
        self.disconnect_pending = false;
        info!("Disconnected");
        Ok(())
    }

    fn tick(&mut self, wait: Duration) -> Result<Option<Event>, ClientError> {
        if let Some(event) = self.state.pop_event() {
            self.deliver(&event);
            return Ok(Some(event));
        }

        if self.network.is_none() {
            return Err(ClientError::Session(StateError::NotConnected));
        }

        let now = Instant::now();
        match self.state.check_keep_alive(now) {
            Ok(Some(pingreq)) => self.write(&pingreq)?,
            Ok(None) => {}
            Err(e) => {
                self.teardown();
                return Err(e.into());
            }
        }

        for packet in self.state.check_retransmits(now) {
            self.write(&packet)?;
        }

        // network stays Some here, guarded above
        let read = match self.network.as_mut() {
            Some(network) => network.read_packet(wait),
            None => return Err(ClientError::Session(StateError::NotConnected)),
        };

        let incoming = match read {
            Ok(incoming) => incoming,
            Err(e) => {
                self.teardown();
                return Err(e.into());
            }
        };

        if let Some(packet) = incoming {
            trace!("Incoming packet = {:?}", packet);
            let reply = match self.state.handle_incoming(&packet, Instant::now()) {
                Ok(reply) => reply,
                Err(e) => {
                    self.teardown();
                    return Err(e.into());
                }
            };

            if let Some(reply) = reply {
                self.write(&reply)?;
            }

            if self.state.status() == ConnectionStatus::Disconnecting {
                self.disconnect_pending = true;
            }
        }

        match self.state.pop_event() {
            Some(event) => {
                self.deliver(&event);
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Routes an incoming publish through the registered callbacks.
    /// Disconnect requests from inside a callback are deferred to the end
    /// of the current loop iteration.
    fn deliver(&mut self, event: &Event) {
        if let Event::Incoming(Packet::Publish(publish)) = event {
            let message = Message::from(publish);
            let mut control = LoopControl::new();
            self.router.route(&mut control, &message);

            if control.disconnect_requested() {
                self.disconnect_pending = true;
            }
        }
    }

    fn write(&mut self, packet: &Packet) -> Result<(), ClientError> {
        let network = match &mut self.network {
            Some(network) => network,
            None => return Err(ClientError::Session(StateError::NotConnected)),
        };

        match network.write_packet(packet, self.options.ack_timeout()) {
            Ok(()) => {
                self.state.mark_outgoing(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(e.into())
            }
        }
    }

    /// Releases the connection after a fault. The DISCONNECT is best
    /// effort so the broker can tell a deliberate departure from a dead
    /// peer and skip the last will.
    fn teardown(&mut self) {
        if let Some(network) = &mut self.network {
            if let Err(e) = network.write_packet(&Packet::Disconnect, self.options.ack_timeout()) {
                debug!("Disconnect write during teardown failed: {}", e);
            }
        }

        self.network = None;
        self.state.reset();
        self.disconnect_pending = false;
    }

    /// How long one loop iteration may block on the socket. A quarter of
    /// the tightest clock keeps the keep alive and retransmit checks
    /// responsive.
    fn tick_interval(&self) -> Duration {
        let keep_alive = self.options.keep_alive();
        let ack_timeout = self.options.ack_timeout();
        let base = if keep_alive.is_zero() {
            ack_timeout
        } else {
            keep_alive.min(ack_timeout)
        };

        (base / 4).max(Duration::from_millis(10))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}
