// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client gateway session.
//!
//! A session bridges one MQTT-SN client to its own MQTT broker connection.
//! Toward the client the gateway is the confirming peer for client requests
//! and the requesting peer for deliveries; toward the broker it always
//! requests.
//!
//! ```text
//!  Connecting ──CONNACK──> Active <──DISCONNECT(d)/PINGREQ──> Asleep
//!                            ^                                  │
//!                            └──── queue drained ──── Awake <───┘
//!
//!  any state ──DISCONNECT / timeout / link loss / terminate──> Disconnected
//! ```
//!
//! Timekeeping follows the driver's program/cancel pair: every entry point
//! converts the cancelled tick into elapsed time, runs expired deadlines and
//! programs the next one before returning.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use mqttsn::tracker::{MsgIdAllocator, RetryTracker, TrackerEvent};
use mqttsn::{
    frame, Driver, Error, LastWill, Message, QoS, ReturnCode, SubscribeTopic, TickClock,
    TopicRef, TopicRegistry,
};

use crate::config::{AuthInfo, GatewayConfig};
use crate::mqtt::{self, ConnackCode, Packet, SUBACK_FAILURE};

/// Host hooks for one session: the client datagram path, the broker stream
/// and a single-shot timer.
pub trait SessionDriver {
    fn send_to_client(&mut self, data: &[u8]);

    fn send_to_broker(&mut self, data: &[u8]);

    /// Request one `Session::tick()` after `ms` milliseconds, replacing any
    /// earlier request.
    fn program_tick(&mut self, ms: u64);

    /// Cancel the pending tick and return the milliseconds left on it.
    fn cancel_tick(&mut self) -> u64;

    /// Open (or reopen) the broker connection. The host answers with
    /// `Session::broker_connected`.
    fn broker_reconnect_request(&mut self);

    fn client_connected(&mut self, _client_id: &str) {}

    /// Broker credentials. Falls back to the configured auth entries.
    fn auth_info(&mut self, _client_id: &str) -> Option<AuthInfo> {
        None
    }

    fn session_terminated(&mut self, _client_id: &str) {}
}

/// Timer view of a session driver for [`TickClock`].
struct Timer<'a, D: SessionDriver>(&'a mut D);

impl<D: SessionDriver> Driver for Timer<'_, D> {
    fn send_data(&mut self, data: &[u8], _broadcast: bool) {
        self.0.send_to_client(data);
    }

    fn program_tick(&mut self, ms: u64) {
        self.0.program_tick(ms);
    }

    fn cancel_tick(&mut self) -> u64 {
        self.0.cancel_tick()
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Asleep,
    Awake,
    Disconnected,
}

/// A message waiting for delivery to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ClientKey {
    WillTopic,
    WillMsg,
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BrokerKey {
    /// Waiting for the host to bring the broker connection up.
    Link,
    Connect,
    Ping,
    Publish(u16),
    Pubrel(u16),
    Subscribe(u16),
    Unsubscribe(u16),
}

/// Why the broker CONNECT is being (re)sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPurpose {
    Session,
    Reconnect,
    WillTopicUpdate,
    WillMsgUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Register { topic_id: u16 },
    Publish,
    Release,
}

/// The single confirmable exchange in flight toward the client.
#[derive(Debug)]
struct Delivery {
    msg_id: u16,
    stage: Stage,
    msg: OutboundMessage,
}

/// One client's bridge state.
pub struct Session<D: SessionDriver> {
    config: Arc<GatewayConfig>,
    driver: D,
    clock: TickClock,
    now_ms: u64,
    state: SessionState,
    connect_started: bool,

    client_id: String,
    clean_session: bool,
    keep_alive_ms: u64,
    sleep_ms: u64,
    last_rx_ms: u64,
    will: Option<LastWill>,
    will_msg: Vec<u8>,

    topics: TopicRegistry,
    to_client: RetryTracker<ClientKey, ()>,
    msg_ids: MsgIdAllocator,
    queue: VecDeque<OutboundMessage>,
    dropped: u64,
    delivery: Option<Delivery>,
    /// Client QoS2 publishes the broker has PUBREC'd, awaiting client PUBREL.
    client_qos2: BTreeSet<u16>,

    /// Broker requests keyed by exchange; the context is the client topic ID.
    to_broker: RetryTracker<BrokerKey, u16>,
    transport_up: bool,
    link: Option<LinkPurpose>,
    /// Packets held while the link is down, tagged with the exchange that
    /// tracks them.
    backlog: VecDeque<(Option<BrokerKey>, Vec<u8>)>,
    last_broker_tx_ms: u64,
    /// Broker QoS2 publishes awaiting broker PUBREL.
    broker_qos2: BTreeSet<u16>,
}

impl<D: SessionDriver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .field("transport_up", &self.transport_up)
            .finish()
    }
}

impl<D: SessionDriver> Session<D> {
    /// A session waiting for the client's CONNECT.
    pub fn new(config: Arc<GatewayConfig>, driver: D) -> Self {
        let to_client = RetryTracker::new(config.client_retry());
        let to_broker = RetryTracker::new(config.broker_retry());
        Self {
            config,
            driver,
            clock: TickClock::default(),
            now_ms: 0,
            state: SessionState::Connecting,
            connect_started: false,
            client_id: String::new(),
            clean_session: true,
            keep_alive_ms: 0,
            sleep_ms: 0,
            last_rx_ms: 0,
            will: None,
            will_msg: Vec::new(),
            topics: TopicRegistry::new(),
            to_client,
            msg_ids: MsgIdAllocator::default(),
            queue: VecDeque::new(),
            dropped: 0,
            delivery: None,
            client_qos2: BTreeSet::new(),
            to_broker,
            transport_up: false,
            link: None,
            backlog: VecDeque::new(),
            last_broker_tx_ms: 0,
            broker_qos2: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Empty until the client's CONNECT has been processed.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    /// Messages waiting in the outgoing queue (excluding the one in flight).
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Messages discarded because the outgoing queue was full or no topic ID
    /// was left to register them under.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Broker-bound packets held while the link is down.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// True once the broker accepted the session's CONNECT.
    pub fn broker_link_up(&self) -> bool {
        self.link_ready()
    }

    pub fn will(&self) -> Option<(&LastWill, &[u8])> {
        self.will.as_ref().map(|w| (w, self.will_msg.as_slice()))
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Feed one datagram from the client. Returns the bytes consumed, 0 when
    /// the frame is incomplete.
    pub fn data_from_client(&mut self, data: &[u8]) -> usize {
        self.enter();
        let used = match frame::decode(data) {
            Ok((msg, used)) => {
                log::trace!("client -> gw {:?}", msg.msg_type());
                if self.state != SessionState::Disconnected {
                    self.last_rx_ms = self.now_ms;
                    self.on_client(msg);
                }
                used
            }
            Err(Error::NeedMoreData(_)) => 0,
            Err(e) => {
                log::warn!("session '{}': dropping client frame: {}", self.client_id, e);
                frame::peek_frame(data)
                    .map(|(_, total)| total.min(data.len()))
                    .unwrap_or(data.len())
            }
        };
        self.leave();
        used
    }

    /// Feed bytes from the broker stream. Returns the bytes consumed, 0 when
    /// the packet is incomplete.
    pub fn data_from_broker(&mut self, data: &[u8]) -> usize {
        self.enter();
        let used = match mqtt::decode(data) {
            Ok((packet, used)) => {
                if self.state != SessionState::Disconnected {
                    self.on_broker(packet);
                }
                used
            }
            Err(mqtt::MqttError::NeedMoreData(_)) => 0,
            Err(e) => {
                // A broken stream cannot be resynchronised.
                log::warn!("session '{}': {}", self.client_id, e);
                data.len()
            }
        };
        self.leave();
        used
    }

    /// Broker connection status from the host.
    pub fn broker_connected(&mut self, up: bool) {
        self.enter();
        if self.state != SessionState::Disconnected {
            if up {
                self.on_transport_up();
            } else {
                self.on_transport_down();
            }
        }
        self.leave();
    }

    /// Timer expiry requested through `program_tick`.
    pub fn tick(&mut self) {
        self.enter();
        self.leave();
    }

    /// Queue a message for the client. Returns the message that was dropped
    /// to make room, or the message itself if the session is closed.
    pub fn enqueue(&mut self, msg: OutboundMessage) -> Option<OutboundMessage> {
        if self.state == SessionState::Disconnected {
            return Some(msg);
        }
        self.enter();
        let dropped = self.queue_push(msg);
        self.pump();
        self.leave();
        dropped
    }

    /// Close the session from the host side.
    pub fn terminate(&mut self) {
        self.enter();
        if self.state != SessionState::Disconnected {
            self.send_client(&Message::Disconnect { duration: None });
            if self.link_ready() {
                self.send_broker(&Packet::Disconnect);
            }
            self.close("terminated");
        }
        self.leave();
    }

    fn enter(&mut self) {
        let elapsed = self.clock.elapsed(&mut Timer(&mut self.driver));
        self.now_ms += elapsed;

        for ev in self.to_client.tick(elapsed) {
            match ev {
                TrackerEvent::Retransmit { bytes, .. } => self.driver.send_to_client(&bytes),
                TrackerEvent::TimedOut(op) => self.on_client_timeout(op.key),
            }
        }
        for ev in self.to_broker.tick(elapsed) {
            match ev {
                TrackerEvent::Retransmit { bytes, .. } => self.driver.send_to_broker(&bytes),
                TrackerEvent::TimedOut(op) => self.on_broker_timeout(op.key, op.context),
            }
        }
        self.check_keep_alive();
    }

    fn leave(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        let now = self.now_ms;
        let next = [
            self.to_client.next_timeout(),
            self.to_broker.next_timeout(),
            self.client_deadline().map(|d| d.saturating_sub(now)),
            self.broker_ping_deadline().map(|d| d.saturating_sub(now)),
        ]
        .into_iter()
        .flatten()
        .min();
        self.clock.program(&mut Timer(&mut self.driver), next);
    }

    // -----------------------------------------------------------------------
    // Keep-alive
    // -----------------------------------------------------------------------

    /// Client supervision: 1.5 times the keep-alive or sleep duration.
    fn client_deadline(&self) -> Option<u64> {
        let period = match self.state {
            SessionState::Active | SessionState::Awake => self.keep_alive_ms.max(self.sleep_ms),
            SessionState::Asleep => self.sleep_ms,
            _ => 0,
        };
        (period > 0).then(|| self.last_rx_ms + period * 3 / 2)
    }

    fn broker_ping_deadline(&self) -> Option<u64> {
        let period = u64::from(self.config.broker.keep_alive_secs) * 1000;
        if period == 0 || !self.link_ready() || self.to_broker.is_pending(&BrokerKey::Ping) {
            return None;
        }
        Some(self.last_broker_tx_ms + period)
    }

    fn check_keep_alive(&mut self) {
        if let Some(deadline) = self.client_deadline() {
            if self.now_ms >= deadline {
                log::warn!("session '{}': client keep-alive expired", self.client_id);
                self.close("keep-alive expired");
                return;
            }
        }
        if let Some(deadline) = self.broker_ping_deadline() {
            if self.now_ms >= deadline {
                self.send_broker(&Packet::Pingreq);
                self.track_broker(BrokerKey::Ping, 0);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client side
    // -----------------------------------------------------------------------

    fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Awake)
    }

    fn on_client(&mut self, msg: Message) {
        match msg {
            Message::Connect {
                will,
                clean_session,
                duration,
                client_id,
            } => self.on_connect(will, clean_session, duration, client_id),
            Message::WillTopic { will } => self.on_will_topic(will),
            Message::WillMsg { msg } => self.on_will_msg(msg),
            Message::Register {
                msg_id, topic_name, ..
            } => self.on_register(msg_id, &topic_name),
            Message::Regack { msg_id, rc, .. } => self.on_regack(msg_id, rc),
            Message::Publish {
                qos,
                retain,
                topic,
                msg_id,
                data,
                ..
            } => self.on_publish(qos, retain, topic, msg_id, data),
            Message::Puback {
                topic_id,
                msg_id,
                rc,
            } => self.on_puback(topic_id, msg_id, rc),
            Message::Pubrec { msg_id } => self.on_pubrec(msg_id),
            Message::Pubrel { msg_id } => self.on_pubrel(msg_id),
            Message::Pubcomp { msg_id } => self.on_pubcomp(msg_id),
            Message::Subscribe {
                qos, msg_id, topic, ..
            } => self.on_subscribe(qos, msg_id, topic),
            Message::Unsubscribe { msg_id, topic } => self.on_unsubscribe(msg_id, topic),
            Message::Pingreq { client_id } => self.on_pingreq(client_id),
            Message::Disconnect { duration } => self.on_disconnect(duration),
            Message::WillTopicUpd { will } => {
                if self.is_connected() {
                    if will.is_none() {
                        self.will_msg.clear();
                    }
                    self.will = will;
                    self.relink(LinkPurpose::WillTopicUpdate);
                }
            }
            Message::WillMsgUpd { msg } => {
                if self.is_connected() {
                    self.will_msg = msg;
                    self.relink(LinkPurpose::WillMsgUpdate);
                }
            }
            other => {
                log::debug!(
                    "session '{}': ignoring {:?} from client",
                    self.client_id,
                    other.msg_type()
                );
            }
        }
    }

    fn on_connect(&mut self, will: bool, clean_session: bool, duration: u16, client_id: String) {
        match self.state {
            SessionState::Connecting => {
                if self.connect_started {
                    log::debug!("session '{}': duplicate CONNECT", self.client_id);
                    return;
                }
                self.connect_started = true;
                self.client_id = if client_id.is_empty() {
                    self.config.default_client_id.clone()
                } else {
                    client_id
                };
                self.clean_session = clean_session;
                self.keep_alive_ms = u64::from(duration) * 1000;
                self.topics = match self.config.topic_registry_for(&self.client_id) {
                    Ok(topics) => topics,
                    Err(e) => {
                        log::warn!("session '{}': {}", self.client_id, e);
                        self.reject_connect(ReturnCode::NotSupported);
                        return;
                    }
                };
                if will {
                    self.send_client_tracked(ClientKey::WillTopic, &Message::WillTopicReq);
                } else {
                    self.start_link(LinkPurpose::Session);
                }
            }
            SessionState::Active | SessionState::Asleep | SessionState::Awake => {
                log::info!("session '{}': client reconnected", self.client_id);
                self.keep_alive_ms = u64::from(duration) * 1000;
                self.sleep_ms = 0;
                self.state = SessionState::Active;
                self.send_client(&Message::Connack {
                    rc: ReturnCode::Accepted,
                });
                self.pump();
            }
            SessionState::Disconnected => {}
        }
    }

    fn on_will_topic(&mut self, will: Option<LastWill>) {
        if self.to_client.complete(&ClientKey::WillTopic).is_none() {
            return;
        }
        match will {
            Some(w) => {
                self.will = Some(w);
                self.send_client_tracked(ClientKey::WillMsg, &Message::WillMsgReq);
            }
            None => {
                self.will = None;
                self.start_link(LinkPurpose::Session);
            }
        }
    }

    fn on_will_msg(&mut self, msg: Vec<u8>) {
        if self.to_client.complete(&ClientKey::WillMsg).is_none() {
            return;
        }
        self.will_msg = msg;
        self.start_link(LinkPurpose::Session);
    }

    fn on_register(&mut self, msg_id: u16, name: &str) {
        if !self.is_connected() {
            return;
        }
        let (topic_id, rc) = if name.contains(['+', '#']) {
            (0, ReturnCode::NotSupported)
        } else {
            match self.topics.register_dynamic(name) {
                Ok(id) => (id, ReturnCode::Accepted),
                Err(Error::TableFull) => {
                    log::warn!("session '{}': topic table full", self.client_id);
                    (0, ReturnCode::Congestion)
                }
                Err(_) => (0, ReturnCode::NotSupported),
            }
        };
        self.send_client(&Message::Regack {
            topic_id,
            msg_id,
            rc,
        });
    }

    fn on_publish(&mut self, qos: QoS, retain: bool, topic: TopicRef, msg_id: u16, data: Vec<u8>) {
        if !self.is_connected() {
            log::debug!("session '{}': PUBLISH while not connected", self.client_id);
            return;
        }
        let name = match self.topics.resolve(&topic) {
            Ok(name) => name,
            Err(e) => {
                log::warn!("session '{}': {}", self.client_id, e);
                self.send_client(&Message::Puback {
                    topic_id: topic.ack_id(),
                    msg_id,
                    rc: ReturnCode::InvalidTopicId,
                });
                return;
            }
        };

        match qos {
            QoS::AtMostOnce | QoS::NoSession => {
                self.send_broker(&Packet::Publish(mqtt::Publish {
                    dup: false,
                    qos: 0,
                    retain,
                    topic: name,
                    packet_id: None,
                    payload: data,
                }));
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                if self.client_qos2.contains(&msg_id) {
                    // PUBREC was lost; the broker already has the message.
                    self.send_client(&Message::Pubrec { msg_id });
                    return;
                }
                if self.to_broker.is_pending(&BrokerKey::Publish(msg_id))
                    || self.to_broker.is_pending(&BrokerKey::Pubrel(msg_id))
                {
                    log::debug!("session '{}': absorbing duplicate {}", self.client_id, msg_id);
                    return;
                }
                let key = BrokerKey::Publish(msg_id);
                self.send_broker_for(
                    Some(key),
                    &Packet::Publish(mqtt::Publish {
                        dup: false,
                        qos: qos.level(),
                        retain,
                        topic: name,
                        packet_id: Some(msg_id),
                        payload: data,
                    }),
                );
                self.track_broker(key, topic.ack_id());
            }
        }
    }

    fn on_pubrel(&mut self, msg_id: u16) {
        if self.client_qos2.remove(&msg_id) {
            let key = BrokerKey::Pubrel(msg_id);
            self.send_broker_for(Some(key), &Packet::Pubrel(msg_id));
            self.track_broker(key, 0);
        } else if !self.to_broker.is_pending(&BrokerKey::Pubrel(msg_id)) {
            // Exchange already finished; PUBCOMP was lost.
            self.send_client(&Message::Pubcomp { msg_id });
        }
    }

    fn on_subscribe(&mut self, qos: QoS, msg_id: u16, topic: SubscribeTopic) {
        if !self.is_connected() {
            return;
        }
        if self.to_broker.is_pending(&BrokerKey::Subscribe(msg_id)) {
            return;
        }
        let reject = |rc| Message::Suback {
            qos: QoS::AtMostOnce,
            topic_id: 0,
            msg_id,
            rc,
        };
        let (filter, topic_id) = match topic {
            SubscribeTopic::Name(name) => {
                if name.contains(['+', '#']) || name.len() == 2 {
                    (name, 0)
                } else {
                    match self.topics.register_dynamic(&name) {
                        Ok(id) => (name, id),
                        Err(Error::TableFull) => {
                            self.send_client(&reject(ReturnCode::Congestion));
                            return;
                        }
                        Err(_) => {
                            self.send_client(&reject(ReturnCode::NotSupported));
                            return;
                        }
                    }
                }
            }
            SubscribeTopic::Predefined(id) => match self.topics.resolve(&TopicRef::Predefined(id)) {
                Ok(name) => (name, id),
                Err(_) => {
                    self.send_client(&Message::Suback {
                        qos: QoS::AtMostOnce,
                        topic_id: id,
                        msg_id,
                        rc: ReturnCode::InvalidTopicId,
                    });
                    return;
                }
            },
            SubscribeTopic::Short(raw) => match self.topics.resolve(&TopicRef::Short(raw)) {
                Ok(name) => (name, 0),
                Err(_) => {
                    self.send_client(&reject(ReturnCode::InvalidTopicId));
                    return;
                }
            },
        };
        let key = BrokerKey::Subscribe(msg_id);
        self.send_broker_for(
            Some(key),
            &Packet::Subscribe {
                packet_id: msg_id,
                filters: vec![(filter, qos.level())],
            },
        );
        self.track_broker(key, topic_id);
    }

    fn on_unsubscribe(&mut self, msg_id: u16, topic: SubscribeTopic) {
        if !self.is_connected() || self.to_broker.is_pending(&BrokerKey::Unsubscribe(msg_id)) {
            return;
        }
        let filter = match topic {
            SubscribeTopic::Name(name) => Ok(name),
            SubscribeTopic::Predefined(id) => self.topics.resolve(&TopicRef::Predefined(id)),
            SubscribeTopic::Short(raw) => self.topics.resolve(&TopicRef::Short(raw)),
        };
        match filter {
            Ok(filter) => {
                let key = BrokerKey::Unsubscribe(msg_id);
                self.send_broker_for(
                    Some(key),
                    &Packet::Unsubscribe {
                        packet_id: msg_id,
                        filters: vec![filter],
                    },
                );
                self.track_broker(key, 0);
            }
            // Nothing to remove upstream.
            Err(_) => self.send_client(&Message::Unsuback { msg_id }),
        }
    }

    fn on_pingreq(&mut self, client_id: Option<String>) {
        match self.state {
            SessionState::Asleep => {
                if let Some(id) = client_id {
                    if id != self.client_id {
                        log::debug!("session '{}': PINGREQ from '{}'", self.client_id, id);
                        return;
                    }
                }
                log::info!(
                    "session '{}': awake, {} queued",
                    self.client_id,
                    self.queue.len()
                );
                self.state = SessionState::Awake;
                self.pump();
            }
            SessionState::Active => self.send_client(&Message::Pingresp),
            // PINGRESP follows the flush.
            SessionState::Awake => {}
            _ => log::debug!("session '{}': PINGREQ ignored", self.client_id),
        }
    }

    fn on_disconnect(&mut self, duration: Option<u16>) {
        match (self.state, duration) {
            (SessionState::Active | SessionState::Awake | SessionState::Asleep, Some(secs))
                if secs > 0 =>
            {
                if let Some(d) = self.delivery.take() {
                    self.to_client.cancel(&ClientKey::Delivery);
                    if d.stage != Stage::Release {
                        self.queue.push_front(d.msg);
                    }
                }
                self.sleep_ms = u64::from(secs) * 1000;
                self.state = SessionState::Asleep;
                self.send_client(&Message::Disconnect { duration: None });
                log::info!("session '{}': asleep for {}s", self.client_id, secs);
            }
            (SessionState::Disconnected, _) => {}
            _ => {
                self.send_client(&Message::Disconnect { duration: None });
                if self.link_ready() {
                    self.send_broker(&Packet::Disconnect);
                }
                self.close("client disconnected");
            }
        }
    }

    fn on_client_timeout(&mut self, key: ClientKey) {
        if self.state == SessionState::Disconnected {
            return;
        }
        match key {
            ClientKey::WillTopic | ClientKey::WillMsg => self.close("will exchange timed out"),
            ClientKey::Delivery => {
                log::warn!(
                    "session '{}': client stopped acknowledging deliveries",
                    self.client_id
                );
                self.close("delivery timed out");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delivery to the client
    // -----------------------------------------------------------------------

    fn queue_push(&mut self, msg: OutboundMessage) -> Option<OutboundMessage> {
        let limit = self.config.sleeping_client_msg_limit.max(1);
        let mut dropped = None;
        while self.queue.len() >= limit {
            dropped = self.queue.pop_front();
            self.dropped += 1;
            log::warn!(
                "session '{}': outgoing queue full, dropped oldest ({} total)",
                self.client_id,
                self.dropped
            );
        }
        self.queue.push_back(msg);
        debug_assert!(self.queue.len() <= limit);
        dropped
    }

    /// Start deliveries until one confirmable exchange is in flight.
    fn pump(&mut self) {
        while self.is_connected() && self.delivery.is_none() {
            let Some(msg) = self.queue.pop_front() else {
                break;
            };
            match self.topics.topic_ref_for(&msg.topic) {
                Some(topic) => self.deliver_publish(topic, msg),
                None => self.deliver_register(msg),
            }
        }
        if self.state == SessionState::Awake && self.delivery.is_none() && self.queue.is_empty() {
            self.send_client(&Message::Pingresp);
            self.state = SessionState::Active;
        }
    }

    fn deliver_publish(&mut self, topic: TopicRef, msg: OutboundMessage) {
        debug_assert!(self.delivery.is_none(), "delivery already in flight");
        match msg.qos {
            QoS::AtMostOnce | QoS::NoSession => self.send_client(&Message::Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: msg.retain,
                topic,
                msg_id: 0,
                data: msg.data,
            }),
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let msg_id = self.msg_ids.alloc(|_| false);
                let publish = Message::Publish {
                    dup: false,
                    qos: msg.qos,
                    retain: msg.retain,
                    topic,
                    msg_id,
                    data: msg.data.clone(),
                };
                if self.send_client_tracked(ClientKey::Delivery, &publish) {
                    self.delivery = Some(Delivery {
                        msg_id,
                        stage: Stage::Publish,
                        msg,
                    });
                }
            }
        }
    }

    fn deliver_register(&mut self, msg: OutboundMessage) {
        debug_assert!(self.delivery.is_none(), "delivery already in flight");
        let topic_id = match self.topics.register_dynamic(&msg.topic) {
            Ok(id) => id,
            Err(e) => {
                self.dropped += 1;
                log::warn!(
                    "session '{}': cannot deliver to '{}': {} ({} dropped)",
                    self.client_id,
                    msg.topic,
                    e,
                    self.dropped
                );
                return;
            }
        };
        let msg_id = self.msg_ids.alloc(|_| false);
        let register = Message::Register {
            topic_id,
            msg_id,
            topic_name: msg.topic.clone(),
        };
        if self.send_client_tracked(ClientKey::Delivery, &register) {
            self.delivery = Some(Delivery {
                msg_id,
                stage: Stage::Register { topic_id },
                msg,
            });
        }
    }

    fn delivery_at(&self, msg_id: u16) -> Option<Stage> {
        self.delivery
            .as_ref()
            .filter(|d| d.msg_id == msg_id)
            .map(|d| d.stage)
    }

    fn on_regack(&mut self, msg_id: u16, rc: ReturnCode) {
        let Some(Stage::Register { topic_id }) = self.delivery_at(msg_id) else {
            log::debug!("session '{}': stray REGACK {}", self.client_id, msg_id);
            return;
        };
        self.to_client.complete(&ClientKey::Delivery);
        let Some(delivery) = self.delivery.take() else {
            return;
        };
        if rc.is_accepted() {
            self.deliver_publish(TopicRef::Normal(topic_id), delivery.msg);
        } else {
            log::warn!(
                "session '{}': client refused topic '{}' ({:?})",
                self.client_id,
                delivery.msg.topic,
                rc
            );
            self.topics.remove(topic_id);
        }
        self.pump();
    }

    fn on_puback(&mut self, topic_id: u16, msg_id: u16, rc: ReturnCode) {
        if self.delivery_at(msg_id) != Some(Stage::Publish) {
            log::debug!("session '{}': stray PUBACK {}", self.client_id, msg_id);
            return;
        }
        self.to_client.complete(&ClientKey::Delivery);
        self.delivery = None;
        if rc == ReturnCode::InvalidTopicId {
            // Client lost the mapping; the next delivery registers again.
            self.topics.remove(topic_id);
        }
        if !rc.is_accepted() {
            log::warn!("session '{}': PUBACK {:?}", self.client_id, rc);
        }
        self.pump();
    }

    fn on_pubrec(&mut self, msg_id: u16) {
        if self.delivery_at(msg_id) != Some(Stage::Publish) {
            return;
        }
        let Ok(bytes) = frame::encode(&Message::Pubrel { msg_id }) else {
            return;
        };
        self.driver.send_to_client(&bytes);
        if self
            .to_client
            .restage(&ClientKey::Delivery, bytes, false)
            .is_ok()
        {
            if let Some(d) = self.delivery.as_mut() {
                d.stage = Stage::Release;
            }
        }
    }

    fn on_pubcomp(&mut self, msg_id: u16) {
        if self.delivery_at(msg_id) != Some(Stage::Release) {
            return;
        }
        self.to_client.complete(&ClientKey::Delivery);
        self.delivery = None;
        self.pump();
    }

    fn send_client(&mut self, msg: &Message) {
        match frame::encode(msg) {
            Ok(bytes) => {
                log::trace!("gw -> client {:?}", msg.msg_type());
                self.driver.send_to_client(&bytes);
            }
            Err(e) => log::warn!("session '{}': cannot encode: {}", self.client_id, e),
        }
    }

    fn send_client_tracked(&mut self, key: ClientKey, msg: &Message) -> bool {
        let bytes = match frame::encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("session '{}': cannot encode: {}", self.client_id, e);
                return false;
            }
        };
        self.driver.send_to_client(&bytes);
        match self.to_client.submit(key, bytes, false, ()) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("session '{}': {:?}: {}", self.client_id, key, e);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Broker side
    // -----------------------------------------------------------------------

    fn link_ready(&self) -> bool {
        self.transport_up && self.link.is_none()
    }

    /// Send or, while the link is not ready, hold in the backlog.
    fn send_broker(&mut self, packet: &Packet) {
        self.send_broker_for(None, packet);
    }

    /// As `send_broker`, for a packet whose exchange is tracked under `key`.
    fn send_broker_for(&mut self, key: Option<BrokerKey>, packet: &Packet) {
        let bytes = match mqtt::encode(packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("session '{}': {}", self.client_id, e);
                return;
            }
        };
        if self.link_ready() {
            self.driver.send_to_broker(&bytes);
            self.last_broker_tx_ms = self.now_ms;
            return;
        }
        let limit = self.config.broker_backlog_limit;
        if limit == 0 {
            log::warn!("session '{}': broker link down, dropping", self.client_id);
            return;
        }
        while self.backlog.len() >= limit {
            self.backlog.pop_front();
            log::warn!("session '{}': broker backlog full, dropped oldest", self.client_id);
        }
        self.backlog.push_back((key, bytes));
    }

    fn track_broker(&mut self, key: BrokerKey, topic_id: u16) {
        if let Err(e) = self.to_broker.submit(key, Vec::new(), false, topic_id) {
            log::debug!("session '{}': {:?}: {}", self.client_id, key, e);
        }
    }

    fn start_link(&mut self, purpose: LinkPurpose) {
        self.link = Some(purpose);
        if self.transport_up {
            self.send_broker_connect();
        } else {
            self.driver.broker_reconnect_request();
            self.track_broker(BrokerKey::Link, 0);
        }
    }

    /// Drop the current broker connection and connect again with the
    /// current will.
    fn relink(&mut self, purpose: LinkPurpose) {
        if self.link.is_some() {
            // Setup already under way; answer the newest request.
            self.link = Some(purpose);
            return;
        }
        if self.transport_up {
            if let Ok(bytes) = mqtt::encode(&Packet::Disconnect) {
                self.driver.send_to_broker(&bytes);
            }
            self.transport_up = false;
        }
        self.to_broker.cancel(&BrokerKey::Ping);
        self.start_link(purpose);
    }

    fn send_broker_connect(&mut self) {
        let clean_session = self.link == Some(LinkPurpose::Session) && self.clean_session;
        let auth = self
            .driver
            .auth_info(&self.client_id)
            .or_else(|| self.config.auth_info(&self.client_id))
            .unwrap_or_default();
        let will = self.will.as_ref().map(|w| mqtt::Will {
            topic: w.topic.clone(),
            message: self.will_msg.clone(),
            qos: w.qos.level(),
            retain: w.retain,
        });
        let connect = Packet::Connect(mqtt::Connect {
            client_id: self.client_id.clone(),
            clean_session,
            keep_alive: self.config.broker.keep_alive_secs,
            will,
            username: auth.username,
            password: auth.password,
        });
        match mqtt::encode(&connect) {
            Ok(bytes) => {
                self.driver.send_to_broker(&bytes);
                self.last_broker_tx_ms = self.now_ms;
                self.track_broker(BrokerKey::Connect, 0);
            }
            Err(e) => {
                log::warn!("session '{}': {}", self.client_id, e);
                if let Some(purpose) = self.link.take() {
                    self.link_failed(purpose, ReturnCode::NotSupported);
                }
            }
        }
    }

    fn on_transport_up(&mut self) {
        self.transport_up = true;
        self.to_broker.complete(&BrokerKey::Link);
        if self.link.is_some() && !self.to_broker.is_pending(&BrokerKey::Connect) {
            self.send_broker_connect();
        }
    }

    fn on_transport_down(&mut self) {
        self.transport_up = false;
        let handshake = self.to_broker.cancel(&BrokerKey::Connect).is_some();
        self.to_broker.cancel(&BrokerKey::Ping);
        match self.state {
            SessionState::Connecting => {
                if handshake {
                    if let Some(purpose) = self.link.take() {
                        self.link_failed(purpose, ReturnCode::Congestion);
                    }
                }
            }
            SessionState::Active | SessionState::Asleep | SessionState::Awake => {
                log::warn!("session '{}': broker link lost", self.client_id);
                let purpose = match self.link.take() {
                    Some(p @ (LinkPurpose::WillTopicUpdate | LinkPurpose::WillMsgUpdate)) => p,
                    _ => LinkPurpose::Reconnect,
                };
                self.start_link(purpose);
            }
            SessionState::Disconnected => {}
        }
    }

    fn link_failed(&mut self, purpose: LinkPurpose, rc: ReturnCode) {
        match purpose {
            LinkPurpose::Session => self.reject_connect(rc),
            LinkPurpose::Reconnect => self.close("broker reconnect failed"),
            LinkPurpose::WillTopicUpdate => {
                self.send_client(&Message::WillTopicResp {
                    rc: ReturnCode::Congestion,
                });
                self.close("broker reconnect failed");
            }
            LinkPurpose::WillMsgUpdate => {
                self.send_client(&Message::WillMsgResp {
                    rc: ReturnCode::Congestion,
                });
                self.close("broker reconnect failed");
            }
        }
    }

    fn on_broker(&mut self, packet: Packet) {
        match packet {
            Packet::Connack { code, .. } => self.on_connack(code),
            Packet::Publish(p) => self.on_broker_publish(p),
            Packet::Puback(id) => {
                if let Some(op) = self.to_broker.complete(&BrokerKey::Publish(id)) {
                    self.send_client(&Message::Puback {
                        topic_id: op.context,
                        msg_id: id,
                        rc: ReturnCode::Accepted,
                    });
                }
            }
            Packet::Pubrec(id) => {
                if self.to_broker.complete(&BrokerKey::Publish(id)).is_some() {
                    self.client_qos2.insert(id);
                    self.send_client(&Message::Pubrec { msg_id: id });
                }
            }
            Packet::Pubrel(id) => {
                self.broker_qos2.remove(&id);
                self.send_broker(&Packet::Pubcomp(id));
            }
            Packet::Pubcomp(id) => {
                if self.to_broker.complete(&BrokerKey::Pubrel(id)).is_some() {
                    self.send_client(&Message::Pubcomp { msg_id: id });
                }
            }
            Packet::Suback { packet_id, codes } => {
                let Some(op) = self.to_broker.complete(&BrokerKey::Subscribe(packet_id)) else {
                    return;
                };
                let code = codes.first().copied().unwrap_or(SUBACK_FAILURE);
                let reply = if code == SUBACK_FAILURE || code > 2 {
                    Message::Suback {
                        qos: QoS::AtMostOnce,
                        topic_id: 0,
                        msg_id: packet_id,
                        rc: ReturnCode::NotSupported,
                    }
                } else {
                    Message::Suback {
                        qos: QoS::from_level(code),
                        topic_id: op.context,
                        msg_id: packet_id,
                        rc: ReturnCode::Accepted,
                    }
                };
                self.send_client(&reply);
            }
            Packet::Unsuback(id) => {
                if self.to_broker.complete(&BrokerKey::Unsubscribe(id)).is_some() {
                    self.send_client(&Message::Unsuback { msg_id: id });
                }
            }
            Packet::Pingresp => {
                self.to_broker.complete(&BrokerKey::Ping);
            }
            other => log::debug!("session '{}': unexpected {:?}", self.client_id, other),
        }
    }

    fn on_connack(&mut self, code: ConnackCode) {
        if self.to_broker.complete(&BrokerKey::Connect).is_none() {
            log::debug!("session '{}': unexpected CONNACK", self.client_id);
            return;
        }
        let Some(purpose) = self.link.take() else {
            return;
        };
        if code != ConnackCode::Accepted {
            log::warn!("session '{}': broker refused CONNECT: {:?}", self.client_id, code);
            let rc = if code == ConnackCode::ServerUnavailable {
                ReturnCode::Congestion
            } else {
                ReturnCode::NotSupported
            };
            self.link_failed(purpose, rc);
            return;
        }

        match purpose {
            LinkPurpose::Session => {
                self.state = SessionState::Active;
                log::info!("session '{}': connected", self.client_id);
                self.send_client(&Message::Connack {
                    rc: ReturnCode::Accepted,
                });
                self.driver.client_connected(&self.client_id);
            }
            LinkPurpose::Reconnect => {
                log::info!("session '{}': broker link restored", self.client_id);
            }
            LinkPurpose::WillTopicUpdate => self.send_client(&Message::WillTopicResp {
                rc: ReturnCode::Accepted,
            }),
            LinkPurpose::WillMsgUpdate => self.send_client(&Message::WillMsgResp {
                rc: ReturnCode::Accepted,
            }),
        }

        if !self.backlog.is_empty() {
            log::debug!(
                "session '{}': flushing {} backlogged packets",
                self.client_id,
                self.backlog.len()
            );
        }
        while let Some((_, bytes)) = self.backlog.pop_front() {
            self.driver.send_to_broker(&bytes);
        }
        self.last_broker_tx_ms = self.now_ms;
        self.pump();
    }

    fn on_broker_publish(&mut self, p: mqtt::Publish) {
        match (p.qos, p.packet_id) {
            (1, Some(id)) => self.send_broker(&Packet::Puback(id)),
            (2, Some(id)) => {
                let fresh = self.broker_qos2.insert(id);
                self.send_broker(&Packet::Pubrec(id));
                if !fresh {
                    return;
                }
            }
            _ => {}
        }
        self.queue_push(OutboundMessage {
            topic: p.topic,
            data: p.payload,
            qos: QoS::from_level(p.qos),
            retain: p.retain,
        });
        self.pump();
    }

    fn on_broker_timeout(&mut self, key: BrokerKey, topic_id: u16) {
        if self.state == SessionState::Disconnected {
            return;
        }
        // The client is told the exchange failed, so it must not go out later.
        self.backlog.retain(|(k, _)| *k != Some(key));
        match key {
            BrokerKey::Link | BrokerKey::Connect => {
                log::warn!("session '{}': broker did not answer", self.client_id);
                if let Some(purpose) = self.link.take() {
                    self.link_failed(purpose, ReturnCode::Congestion);
                }
            }
            BrokerKey::Ping => {
                log::warn!("session '{}': broker PINGRESP missing", self.client_id);
                self.on_transport_down();
            }
            BrokerKey::Publish(id) | BrokerKey::Pubrel(id) => {
                self.send_client(&Message::Puback {
                    topic_id,
                    msg_id: id,
                    rc: ReturnCode::Congestion,
                });
            }
            BrokerKey::Subscribe(id) => self.send_client(&Message::Suback {
                qos: QoS::AtMostOnce,
                topic_id,
                msg_id: id,
                rc: ReturnCode::Congestion,
            }),
            BrokerKey::Unsubscribe(id) => {
                log::warn!("session '{}': UNSUBSCRIBE {} timed out", self.client_id, id);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn reject_connect(&mut self, rc: ReturnCode) {
        self.send_client(&Message::Connack { rc });
        self.close("connect rejected");
    }

    fn close(&mut self, reason: &str) {
        if self.state == SessionState::Disconnected {
            return;
        }
        log::info!("session '{}' closed: {}", self.client_id, reason);
        self.state = SessionState::Disconnected;
        self.to_client.clear();
        self.to_broker.clear();
        self.delivery = None;
        self.link = None;
        self.queue.clear();
        self.backlog.clear();
        self.driver.session_terminated(&self.client_id);
    }
}
