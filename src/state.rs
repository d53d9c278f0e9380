//! Protocol state of a single MQTT connection.
//!
//! [`SessionState`] owns everything the connection must remember between
//! loop iterations: the lifecycle status, the keep alive clock, in-flight
//! QoS 1/2 handshakes keyed by packet identifier and the retransmission
//! budget for each of them. It is pure state; all I/O happens in the
//! client, which feeds packets in and writes the replies out.

use crate::codec::{
    Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck, Subscribe, UnsubAck,
    Unsubscribe,
};
use crate::{Event, Outgoing};

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Errors during state handling
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Broker acked a packet id with nothing in flight
    #[error("received unsolicited ack for pkid {0}")]
    Unsolicited(u16),
    /// No pingresp arrived within the grace window after a pingreq
    #[error("no pingresp in time for pingreq")]
    AwaitPingResp,
    /// Received a packet the current status can't accept
    #[error("received unexpected packet")]
    WrongPacket,
    #[error("not connected")]
    NotConnected,
}

/// Lifecycle of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    AwaitingConnAck,
    Connected,
    Disconnecting,
}

/// An outgoing publish waiting for its ack, with its retransmission budget
#[derive(Debug, Clone)]
struct Pending<T> {
    packet: T,
    sent_at: Instant,
    retransmits: u8,
}

impl<T> Pending<T> {
    fn new(packet: T, now: Instant) -> Pending<T> {
        Pending {
            packet,
            sent_at: now,
            retransmits: 0,
        }
    }
}

/// State of the mqtt connection
#[derive(Debug)]
pub struct SessionState {
    status: ConnectionStatus,
    keep_alive: Duration,
    ack_timeout: Duration,
    max_retries: u8,
    /// Instant of the last pingreq still waiting for its pingresp
    await_pingresp: Option<Instant>,
    last_incoming: Instant,
    last_outgoing: Instant,
    /// Packet id of the last assigned packet
    last_pkid: u16,
    /// Outgoing QoS 1/2 publishes awaiting puback/pubrec
    outgoing_pub: HashMap<u16, Pending<Publish>>,
    /// Outgoing QoS 2 releases awaiting pubcomp
    outgoing_rel: HashMap<u16, Pending<PubRel>>,
    /// Incoming QoS 2 publishes acked with pubrec, awaiting pubrel
    incoming_rec: HashSet<u16>,
    /// Outgoing subscribes awaiting suback
    outgoing_sub: HashMap<u16, Vec<String>>,
    /// Outgoing unsubscribes awaiting unsuback
    outgoing_unsub: HashMap<u16, Vec<String>>,
    /// Publishes whose retry budget ran out
    failures: Vec<u16>,
    /// Buffered events for the caller to consume
    events: VecDeque<Event>,
}

impl SessionState {
    pub fn new(keep_alive: Duration, ack_timeout: Duration, max_retries: u8) -> SessionState {
        let now = Instant::now();
        SessionState {
            status: ConnectionStatus::Disconnected,
            keep_alive,
            ack_timeout,
            max_retries,
            await_pingresp: None,
            last_incoming: now,
            last_outgoing: now,
            last_pkid: 0,
            outgoing_pub: HashMap::new(),
            outgoing_rel: HashMap::new(),
            incoming_rec: HashSet::new(),
            outgoing_sub: HashMap::new(),
            outgoing_unsub: HashMap::new(),
            failures: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// CONNECT is on the wire, a CONNACK is due next
    pub fn await_connack(&mut self, now: Instant) {
        self.status = ConnectionStatus::AwaitingConnAck;
        self.last_incoming = now;
        self.last_outgoing = now;
    }

    /// Broker accepted the connection
    pub fn on_connected(&mut self, now: Instant) {
        self.status = ConnectionStatus::Connected;
        self.await_pingresp = None;
        self.last_incoming = now;
        self.last_outgoing = now;
    }

    pub fn disconnecting(&mut self) {
        self.status = ConnectionStatus::Disconnecting;
    }

    /// Drops all connection scoped state and returns to `Disconnected`
    pub fn reset(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.await_pingresp = None;
        self.last_pkid = 0;
        self.outgoing_pub.clear();
        self.outgoing_rel.clear();
        self.incoming_rec.clear();
        self.outgoing_sub.clear();
        self.outgoing_unsub.clear();
        self.failures.clear();
        self.events.clear();
    }

    /// Buffered event, if any, for the caller to consume
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// True while the pkid's QoS 1/2 handshake hasn't finished
    pub fn is_publish_inflight(&self, pkid: u16) -> bool {
        self.outgoing_pub.contains_key(&pkid) || self.outgoing_rel.contains_key(&pkid)
    }

    /// Removes and reports a recorded delivery failure for the pkid
    pub fn take_failure(&mut self, pkid: u16) -> bool {
        match self.failures.iter().position(|&id| id == pkid) {
            Some(index) => {
                self.failures.remove(index);
                true
            }
            None => false,
        }
    }

    /// Adds a publish to the outgoing state and returns the packet to put
    /// on the wire. QoS 1/2 publishes get a fresh nonzero packet id and an
    /// in-flight entry.
    pub fn handle_outgoing_publish(
        &mut self,
        mut publish: Publish,
        now: Instant,
    ) -> Result<Packet, StateError> {
        if self.status != ConnectionStatus::Connected {
            return Err(StateError::NotConnected);
        }

        if publish.qos != QoS::AtMostOnce {
            publish.pkid = self.next_pkid();
            self.outgoing_pub
                .insert(publish.pkid, Pending::new(publish.clone(), now));
        }

        debug!(
            "Publish. Topic = {}, pkid = {:?}, payload size = {:?} bytes",
            publish.topic,
            publish.pkid,
            publish.payload.len()
        );

        self.events
            .push_back(Event::Outgoing(Outgoing::Publish(publish.pkid)));
        Ok(Packet::Publish(publish))
    }

    /// Adds a subscribe to the outgoing state and returns the packet to
    /// put on the wire
    pub fn handle_outgoing_subscribe(
        &mut self,
        mut subscribe: Subscribe,
    ) -> Result<Packet, StateError> {
        if self.status != ConnectionStatus::Connected {
            return Err(StateError::NotConnected);
        }

        subscribe.pkid = self.next_pkid();
        let filters = subscribe.filters.iter().map(|f| f.path.clone()).collect();
        self.outgoing_sub.insert(subscribe.pkid, filters);

        debug!(
            "Subscribe. Topics = {:?}, pkid = {:?}",
            subscribe.filters, subscribe.pkid
        );

        self.events
            .push_back(Event::Outgoing(Outgoing::Subscribe(subscribe.pkid)));
        Ok(Packet::Subscribe(subscribe))
    }

    /// Adds an unsubscribe to the outgoing state and returns the packet to
    /// put on the wire
    pub fn handle_outgoing_unsubscribe(
        &mut self,
        mut unsubscribe: Unsubscribe,
    ) -> Result<Packet, StateError> {
        if self.status != ConnectionStatus::Connected {
            return Err(StateError::NotConnected);
        }

        unsubscribe.pkid = self.next_pkid();
        self.outgoing_unsub
            .insert(unsubscribe.pkid, unsubscribe.topics.clone());

        debug!(
            "Unsubscribe. Topics = {:?}, pkid = {:?}",
            unsubscribe.topics, unsubscribe.pkid
        );

        self.events
            .push_back(Event::Outgoing(Outgoing::Unsubscribe(unsubscribe.pkid)));
        Ok(Packet::Unsubscribe(unsubscribe))
    }

    /// Drops the pending subscribe entry after a rejected or timed out
    /// suback
    pub fn abandon_subscribe(&mut self, pkid: u16) {
        self.outgoing_sub.remove(&pkid);
    }

    pub fn abandon_unsubscribe(&mut self, pkid: u16) {
        self.outgoing_unsub.remove(&pkid);
    }

    /// Consolidates handling of all incoming mqtt packets. Returns the
    /// reply to put on the wire, if the packet demands one.
    pub fn handle_incoming(
        &mut self,
        packet: &Packet,
        now: Instant,
    ) -> Result<Option<Packet>, StateError> {
        self.last_incoming = now;
        let reply = match packet {
            Packet::Publish(publish) => self.handle_incoming_publish(publish)?,
            Packet::PubAck(puback) => self.handle_incoming_puback(puback)?,
            Packet::PubRec(pubrec) => self.handle_incoming_pubrec(pubrec, now)?,
            Packet::PubRel(pubrel) => self.handle_incoming_pubrel(pubrel)?,
            Packet::PubComp(pubcomp) => self.handle_incoming_pubcomp(pubcomp)?,
            Packet::SubAck(suback) => self.handle_incoming_suback(suback)?,
            Packet::UnsubAck(unsuback) => self.handle_incoming_unsuback(unsuback)?,
            Packet::PingResp => {
                self.await_pingresp = None;
                self.events.push_back(Event::Incoming(Packet::PingResp));
                None
            }
            Packet::Disconnect => {
                self.status = ConnectionStatus::Disconnecting;
                self.events.push_back(Event::Incoming(Packet::Disconnect));
                None
            }
            packet => {
                error!("Invalid incoming packet = {:?}", packet);
                return Err(StateError::WrongPacket);
            }
        };

        Ok(reply)
    }

    fn handle_incoming_publish(&mut self, publish: &Publish) -> Result<Option<Packet>, StateError> {
        match publish.qos {
            QoS::AtMostOnce => {
                self.events
                    .push_back(Event::Incoming(Packet::Publish(publish.clone())));
                Ok(None)
            }
            QoS::AtLeastOnce => {
                let pkid = publish.pkid;
                self.events
                    .push_back(Event::Incoming(Packet::Publish(publish.clone())));
                self.events
                    .push_back(Event::Outgoing(Outgoing::PubAck(pkid)));
                Ok(Some(Packet::PubAck(PubAck::new(pkid))))
            }
            QoS::ExactlyOnce => {
                let pkid = publish.pkid;

                // A replayed publish for a pkid we already acked with
                // pubrec is answered again but not redelivered.
                if self.incoming_rec.insert(pkid) {
                    self.events
                        .push_back(Event::Incoming(Packet::Publish(publish.clone())));
                } else {
                    warn!("Duplicate qos 2 publish. pkid = {}", pkid);
                }

                self.events
                    .push_back(Event::Outgoing(Outgoing::PubRec(pkid)));
                Ok(Some(Packet::PubRec(PubRec::new(pkid))))
            }
        }
    }

    fn handle_incoming_puback(&mut self, puback: &PubAck) -> Result<Option<Packet>, StateError> {
        if self.outgoing_pub.remove(&puback.pkid).is_none() {
            error!("Unsolicited puback packet: {:?}", puback.pkid);
            return Err(StateError::Unsolicited(puback.pkid));
        }

        self.events
            .push_back(Event::Incoming(Packet::PubAck(*puback)));
        Ok(None)
    }

    fn handle_incoming_pubrec(
        &mut self,
        pubrec: &PubRec,
        now: Instant,
    ) -> Result<Option<Packet>, StateError> {
        if self.outgoing_pub.remove(&pubrec.pkid).is_none() {
            // a pubrel retransmission may cross a second pubrec
            if !self.outgoing_rel.contains_key(&pubrec.pkid) {
                error!("Unsolicited pubrec packet: {:?}", pubrec.pkid);
                return Err(StateError::Unsolicited(pubrec.pkid));
            }
        }

        self.outgoing_rel
            .insert(pubrec.pkid, Pending::new(PubRel::new(pubrec.pkid), now));

        self.events
            .push_back(Event::Incoming(Packet::PubRec(*pubrec)));
        self.events
            .push_back(Event::Outgoing(Outgoing::PubRel(pubrec.pkid)));
        Ok(Some(Packet::PubRel(PubRel::new(pubrec.pkid))))
    }

    fn handle_incoming_pubrel(&mut self, pubrel: &PubRel) -> Result<Option<Packet>, StateError> {
        if !self.incoming_rec.remove(&pubrel.pkid) {
            error!("Unsolicited pubrel packet: {:?}", pubrel.pkid);
            return Err(StateError::Unsolicited(pubrel.pkid));
        }

        self.events
            .push_back(Event::Outgoing(Outgoing::PubComp(pubrel.pkid)));
        Ok(Some(Packet::PubComp(PubComp::new(pubrel.pkid))))
    }

    fn handle_incoming_pubcomp(&mut self, pubcomp: &PubComp) -> Result<Option<Packet>, StateError> {
        if self.outgoing_rel.remove(&pubcomp.pkid).is_none() {
            error!("Unsolicited pubcomp packet: {:?}", pubcomp.pkid);
            return Err(StateError::Unsolicited(pubcomp.pkid));
        }

        self.events
            .push_back(Event::Incoming(Packet::PubComp(*pubcomp)));
        Ok(None)
    }

    fn handle_incoming_suback(&mut self, suback: &SubAck) -> Result<Option<Packet>, StateError> {
        if self.outgoing_sub.remove(&suback.pkid).is_none() {
            error!("Unsolicited suback packet: {:?}", suback.pkid);
            return Err(StateError::Unsolicited(suback.pkid));
        }

        self.events
            .push_back(Event::Incoming(Packet::SubAck(suback.clone())));
        Ok(None)
    }

    fn handle_incoming_unsuback(
        &mut self,
        unsuback: &UnsubAck,
    ) -> Result<Option<Packet>, StateError> {
        if self.outgoing_unsub.remove(&unsuback.pkid).is_none() {
            error!("Unsolicited unsuback packet: {:?}", unsuback.pkid);
            return Err(StateError::Unsolicited(unsuback.pkid));
        }

        self.events
            .push_back(Event::Incoming(Packet::UnsubAck(*unsuback)));
        Ok(None)
    }

    /// Marks the keep alive clock for an outbound packet
    pub fn mark_outgoing(&mut self, now: Instant) {
        self.last_outgoing = now;
    }

    /// Checks the keep alive clock. Returns a pingreq when the connection
    /// has been idle past the keep alive interval, errors when the
    /// previous pingreq got no pingresp within the grace window.
    pub fn check_keep_alive(&mut self, now: Instant) -> Result<Option<Packet>, StateError> {
        if let Some(pinged_at) = self.await_pingresp {
            if now.duration_since(pinged_at) >= self.ack_timeout {
                error!("No pingresp within {:?} of pingreq", self.ack_timeout);
                return Err(StateError::AwaitPingResp);
            }

            return Ok(None);
        }

        if self.keep_alive.is_zero() {
            return Ok(None);
        }

        let idle = now.duration_since(self.last_outgoing);
        if idle < self.keep_alive {
            return Ok(None);
        }

        debug!(
            "Pingreq. last incoming packet before {:?}, last outgoing packet before {:?}",
            now.duration_since(self.last_incoming),
            idle,
        );

        self.await_pingresp = Some(now);
        self.events.push_back(Event::Outgoing(Outgoing::PingReq));
        Ok(Some(Packet::PingReq))
    }

    /// Returns the in-flight packets whose ack is overdue, each with the
    /// dup flag set and its attempt count bumped. An entry that has used
    /// its whole retry budget is dropped instead and recorded as a
    /// delivery failure. The connection stays open either way.
    pub fn check_retransmits(&mut self, now: Instant) -> Vec<Packet> {
        let mut packets = Vec::new();
        let ack_timeout = self.ack_timeout;
        let max_retries = self.max_retries;
        let failures = &mut self.failures;

        self.outgoing_pub.retain(|pkid, pending| {
            if now.duration_since(pending.sent_at) < ack_timeout {
                return true;
            }

            if pending.retransmits >= max_retries {
                error!("Retry budget exhausted for publish. pkid = {}", pkid);
                failures.push(*pkid);
                return false;
            }

            pending.retransmits += 1;
            pending.sent_at = now;
            let mut publish = pending.packet.clone();
            publish.dup = true;
            warn!(
                "Retransmitting publish. pkid = {}, attempt = {}",
                pkid, pending.retransmits
            );
            packets.push(Packet::Publish(publish));
            true
        });

        self.outgoing_rel.retain(|pkid, pending| {
            if now.duration_since(pending.sent_at) < ack_timeout {
                return true;
            }

            if pending.retransmits >= max_retries {
                error!("Retry budget exhausted for pubrel. pkid = {}", pkid);
                failures.push(*pkid);
                return false;
            }

            pending.retransmits += 1;
            pending.sent_at = now;
            warn!(
                "Retransmitting pubrel. pkid = {}, attempt = {}",
                pkid, pending.retransmits
            );
            packets.push(Packet::PubRel(pending.packet));
            true
        });

        packets
    }

    /// Next available packet id. 0 is never assigned, in-flight ids are
    /// skipped.
    fn next_pkid(&mut self) -> u16 {
        let mut pkid = self.last_pkid;
        loop {
            pkid = if pkid == u16::MAX { 1 } else { pkid + 1 };
            if !self.is_publish_inflight(pkid)
                && !self.outgoing_sub.contains_key(&pkid)
                && !self.outgoing_unsub.contains_key(&pkid)
            {
                break;
            }
        }

        self.last_pkid = pkid;
        pkid
    }
}
