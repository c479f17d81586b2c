// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN client operation engine.
//!
//! Drives confirmable exchanges with a gateway over an unreliable transport.
//! Every call runs to completion synchronously; time only advances through
//! the host's `tick()` calls.
//!
//! ```text
//!   app ── connect/publish/subscribe/... ──> Client ── send_data ──> radio
//!   app <── Completion(status, reply) ────── Client <── process_data ── radio
//!                                            Client <── tick ─────── timer
//! ```
//!
//! One operation per [`OpKind`] may be pending. Each pending operation lives
//! in a [`RetryTracker`] keyed by its kind; the message ID used on the wire is
//! kept in the operation context for correlation.

mod config;
mod ops;

pub use config::{ClientConfig, MAX_CLIENT_ID_LEN};
pub use ops::{
    AsyncStatus, ClientHandler, ClientState, Completion, GatewayStatus, InboundMessage,
    NullHandler, OpKind, OpReply,
};

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::driver::{Driver, TickClock};
use crate::error::{Error, Result};
use crate::frame;
use crate::message::{LastWill, Message, QoS, ReturnCode, SubscribeTopic, TopicRef};
use crate::topic::TopicRegistry;
use crate::tracker::{MsgIdAllocator, PendingOperation, RetryTracker, TrackerEvent};

// ---------------------------------------------------------------------------
// Operation context
// ---------------------------------------------------------------------------

/// Where a multi-stage operation currently stands.
enum Stage {
    Connect,
    Disconnect,
    Sleep { duration: u16 },
    CheckMessages,
    KeepAlive,
    SearchGw,
    Register { name: String },
    Subscribe { topic: SubscribeTopic },
    Unsubscribe,
    /// Auto-REGISTER before a PUBLISH to an unknown name.
    PublishRegister {
        name: String,
        qos: QoS,
        retain: bool,
        data: Vec<u8>,
    },
    PublishAck { topic: TopicRef },
    PublishRec { topic: TopicRef },
    PublishComp,
    WillTopicUpd { msg: Option<Vec<u8>> },
    WillMsgUpd,
}

struct OpContext {
    msg_id: u16,
    stage: Stage,
    callback: Option<Completion>,
}

impl OpContext {
    fn new(msg_id: u16, stage: Stage, callback: Option<Completion>) -> Self {
        Self {
            msg_id,
            stage,
            callback,
        }
    }
}

type PendingOp = PendingOperation<OpKind, OpContext>;

fn resolve(op: PendingOp, status: AsyncStatus, reply: OpReply) {
    if let Some(cb) = op.context.callback {
        cb(status, reply);
    }
}

fn is_wildcard(name: &str) -> bool {
    name.contains('+') || name.contains('#')
}

struct KnownGateway {
    gw_addr: Vec<u8>,
    /// Absolute expiry on the client clock, `None` when learned from GWINFO.
    expires_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// MQTT-SN client bound to a host [`Driver`].
pub struct Client<D: Driver, H: ClientHandler = NullHandler> {
    config: ClientConfig,
    driver: D,
    handler: H,
    state: ClientState,
    topics: TopicRegistry,
    ops: RetryTracker<OpKind, OpContext>,
    msg_ids: MsgIdAllocator,
    clock: TickClock,
    now_ms: u64,
    last_tx_ms: u64,
    /// Inbound QoS2 message IDs between PUBREC and PUBREL.
    inbound_qos2: BTreeSet<u16>,
    gateways: BTreeMap<u8, KnownGateway>,
    /// Will offered during the current CONNECT.
    pending_will: Option<(LastWill, Vec<u8>)>,
}

impl<D: Driver> Client<D, NullHandler> {
    /// Client without an event handler.
    pub fn new(config: ClientConfig, driver: D) -> Result<Self> {
        Self::with_handler(config, driver, NullHandler)
    }
}

impl<D: Driver, H: ClientHandler> Client<D, H> {
    pub fn with_handler(config: ClientConfig, driver: D, handler: H) -> Result<Self> {
        config.validate()?;
        let ops = RetryTracker::new(config.retry_policy());
        Ok(Self {
            config,
            driver,
            handler,
            state: ClientState::Disconnected,
            topics: TopicRegistry::new(),
            ops,
            msg_ids: MsgIdAllocator::default(),
            clock: TickClock::default(),
            now_ms: 0,
            last_tx_ms: 0,
            inbound_qos2: BTreeSet::new(),
            gateways: BTreeMap::new(),
            pending_will: None,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn is_pending(&self, kind: OpKind) -> bool {
        self.ops.is_pending(&kind)
    }

    /// Known gateways as `(gw_id, gw_addr)`.
    pub fn gateways(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.gateways.iter().map(|(id, g)| (*id, g.gw_addr.as_slice()))
    }

    /// Seed a predefined topic shared with the gateway configuration.
    pub fn add_predefined_topic(&mut self, name: &str, topic_id: u16) -> Result<()> {
        self.topics.add_predefined(name, topic_id)
    }

    // -- host entry points --------------------------------------------------

    /// Feed received bytes. Returns the number of bytes consumed; 0 means
    /// the frame is incomplete and more data is needed.
    pub fn process_data(&mut self, data: &[u8]) -> usize {
        self.enter();
        let used = match frame::decode(data) {
            Ok((msg, used)) => {
                self.handle(msg);
                used
            }
            Err(Error::NeedMoreData(n)) => {
                log::trace!("partial frame, {} bytes missing", n);
                0
            }
            Err(e) => {
                log::warn!("dropping frame: {}", e);
                frame::peek_frame(data)
                    .map(|(_, total)| total.min(data.len()))
                    .unwrap_or(data.len())
            }
        };
        self.leave();
        used
    }

    /// Timer expiry requested through `program_tick`.
    pub fn tick(&mut self) {
        self.enter();
        self.leave();
    }

    /// Resolve a pending operation as `Canceled`. Bytes already sent are not
    /// retracted.
    pub fn cancel(&mut self, kind: OpKind) -> bool {
        self.enter();
        let found = match self.ops.cancel(&kind) {
            Some(op) => {
                if kind == OpKind::CheckMessages {
                    self.state = ClientState::Asleep;
                }
                resolve(op, AsyncStatus::Canceled, OpReply::None);
                true
            }
            None => false,
        };
        self.leave();
        found
    }

    // -- operations ---------------------------------------------------------

    /// Connect to the current gateway, optionally with a will.
    pub fn connect(
        &mut self,
        will: Option<(LastWill, Vec<u8>)>,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_connect(will, Box::new(on_complete));
        self.leave();
        r
    }

    /// Orderly disconnect.
    pub fn disconnect(
        &mut self,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_simple(
            OpKind::Disconnect,
            Message::Disconnect { duration: None },
            Stage::Disconnect,
            Box::new(on_complete),
        );
        self.leave();
        r
    }

    /// Ask the gateway to buffer messages while the client sleeps.
    pub fn sleep(
        &mut self,
        duration_secs: u16,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = if self.state != ClientState::Connected {
            Err(Error::NotConnected)
        } else if duration_secs == 0 {
            Err(Error::InvalidParameter)
        } else {
            self.start_simple(
                OpKind::Sleep,
                Message::Disconnect {
                    duration: Some(duration_secs),
                },
                Stage::Sleep {
                    duration: duration_secs,
                },
                Box::new(on_complete),
            )
        };
        self.leave();
        r
    }

    /// Wake up briefly and collect messages buffered by the gateway.
    pub fn check_messages(
        &mut self,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = if self.state != ClientState::Asleep {
            Err(Error::InvalidParameter)
        } else {
            let ping = Message::Pingreq {
                client_id: Some(self.config.client_id.clone()),
            };
            let r = self.start_simple(
                OpKind::CheckMessages,
                ping,
                Stage::CheckMessages,
                Box::new(on_complete),
            );
            if r.is_ok() {
                self.state = ClientState::Awake;
            }
            r
        };
        self.leave();
        r
    }

    /// Register a topic name and learn its ID.
    pub fn register(
        &mut self,
        topic: &str,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_register(topic, Box::new(on_complete));
        self.leave();
        r
    }

    /// Publish to a topic name. Unknown names are registered first;
    /// two-character names use the short form.
    pub fn publish(
        &mut self,
        topic: &str,
        data: &[u8],
        qos: QoS,
        retain: bool,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_publish(topic, data, qos, retain, Box::new(on_complete));
        self.leave();
        r
    }

    pub fn subscribe(
        &mut self,
        topic: SubscribeTopic,
        qos: QoS,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_subscribe(topic, qos, Box::new(on_complete));
        self.leave();
        r
    }

    pub fn unsubscribe(
        &mut self,
        topic: SubscribeTopic,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_unsubscribe(topic, Box::new(on_complete));
        self.leave();
        r
    }

    /// Update the will topic and message on the gateway. `None` deletes it.
    pub fn update_will(
        &mut self,
        will: Option<(LastWill, Vec<u8>)>,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = self.start_will_update(will, Box::new(on_complete));
        self.leave();
        r
    }

    /// Broadcast SEARCHGW; completes on the first GWINFO.
    pub fn search_gateway(
        &mut self,
        on_complete: impl FnOnce(AsyncStatus, OpReply) + 'static,
    ) -> Result<()> {
        self.enter();
        let r = if self.ops.is_pending(&OpKind::SearchGw) {
            Err(Error::Busy)
        } else {
            let msg = Message::SearchGw {
                radius: self.config.broadcast_radius,
            };
            let ctx = OpContext::new(0, Stage::SearchGw, Some(Box::new(on_complete)));
            self.track(OpKind::SearchGw, &msg, true, ctx)
        };
        self.leave();
        r
    }

    // -- operation starters -------------------------------------------------

    fn ensure_idle(&self, kind: OpKind) -> Result<()> {
        if self.ops.is_pending(&kind) {
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state != ClientState::Connected {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn next_msg_id(&mut self) -> u16 {
        let ops = &self.ops;
        self.msg_ids
            .alloc(|id| ops.iter().any(|op| op.context.msg_id == id))
    }

    fn start_connect(&mut self, will: Option<(LastWill, Vec<u8>)>, cb: Completion) -> Result<()> {
        self.ensure_idle(OpKind::Connect)?;
        let msg = Message::Connect {
            will: will.is_some(),
            clean_session: self.config.clean_session,
            duration: self.config.keep_alive_secs,
            client_id: self.config.client_id.clone(),
        };
        self.track(OpKind::Connect, &msg, false, OpContext::new(0, Stage::Connect, Some(cb)))?;
        self.pending_will = will;
        Ok(())
    }

    fn start_simple(&mut self, kind: OpKind, msg: Message, stage: Stage, cb: Completion) -> Result<()> {
        self.ensure_idle(kind)?;
        if kind == OpKind::Disconnect && self.state == ClientState::Disconnected {
            return Err(Error::NotConnected);
        }
        self.track(kind, &msg, false, OpContext::new(0, stage, Some(cb)))
    }

    fn start_register(&mut self, topic: &str, cb: Completion) -> Result<()> {
        self.ensure_idle(OpKind::Register)?;
        self.ensure_connected()?;
        if topic.is_empty() || is_wildcard(topic) {
            return Err(Error::InvalidParameter);
        }
        let msg_id = self.next_msg_id();
        let msg = Message::Register {
            topic_id: 0,
            msg_id,
            topic_name: topic.to_string(),
        };
        let ctx = OpContext::new(
            msg_id,
            Stage::Register {
                name: topic.to_string(),
            },
            Some(cb),
        );
        self.track(OpKind::Register, &msg, false, ctx)
    }

    fn start_publish(
        &mut self,
        topic: &str,
        data: &[u8],
        qos: QoS,
        retain: bool,
        cb: Completion,
    ) -> Result<()> {
        self.ensure_idle(OpKind::Publish)?;
        if topic.is_empty() || is_wildcard(topic) {
            return Err(Error::InvalidParameter);
        }
        let known = self.topics.topic_ref_for(topic);

        if qos == QoS::NoSession {
            // QoS -1 needs no connection but only works with IDs the
            // gateway already knows.
            let topic = match known {
                Some(t @ (TopicRef::Predefined(_) | TopicRef::Short(_))) => t,
                _ => return Err(Error::InvalidParameter),
            };
            self.send_publish(topic, 0, qos, retain, data.to_vec())?;
            cb(AsyncStatus::Success, OpReply::None);
            return Ok(());
        }
        self.ensure_connected()?;

        match known {
            Some(t) => self.publish_known(t, qos, retain, data.to_vec(), cb),
            None => {
                let msg_id = self.next_msg_id();
                let msg = Message::Register {
                    topic_id: 0,
                    msg_id,
                    topic_name: topic.to_string(),
                };
                let stage = Stage::PublishRegister {
                    name: topic.to_string(),
                    qos,
                    retain,
                    data: data.to_vec(),
                };
                self.track(OpKind::Publish, &msg, false, OpContext::new(msg_id, stage, Some(cb)))
            }
        }
    }

    /// PUBLISH to a resolved topic; QoS0 completes right away.
    fn publish_known(
        &mut self,
        topic: TopicRef,
        qos: QoS,
        retain: bool,
        data: Vec<u8>,
        cb: Completion,
    ) -> Result<()> {
        if qos == QoS::AtMostOnce {
            self.send_publish(topic, 0, qos, retain, data)?;
            cb(AsyncStatus::Success, OpReply::None);
            return Ok(());
        }
        let msg_id = self.next_msg_id();
        let msg = Message::Publish {
            dup: false,
            qos,
            retain,
            topic,
            msg_id,
            data,
        };
        let stage = if qos == QoS::ExactlyOnce {
            Stage::PublishRec { topic }
        } else {
            Stage::PublishAck { topic }
        };
        self.track(OpKind::Publish, &msg, false, OpContext::new(msg_id, stage, Some(cb)))
    }

    fn send_publish(
        &mut self,
        topic: TopicRef,
        msg_id: u16,
        qos: QoS,
        retain: bool,
        data: Vec<u8>,
    ) -> Result<()> {
        let msg = Message::Publish {
            dup: false,
            qos,
            retain,
            topic,
            msg_id,
            data,
        };
        self.send(&msg, false)
    }

    fn start_subscribe(&mut self, topic: SubscribeTopic, qos: QoS, cb: Completion) -> Result<()> {
        self.ensure_idle(OpKind::Subscribe)?;
        self.ensure_connected()?;
        if matches!(&topic, SubscribeTopic::Name(n) if n.is_empty()) {
            return Err(Error::InvalidParameter);
        }
        let msg_id = self.next_msg_id();
        let msg = Message::Subscribe {
            dup: false,
            qos,
            msg_id,
            topic: topic.clone(),
        };
        let ctx = OpContext::new(msg_id, Stage::Subscribe { topic }, Some(cb));
        self.track(OpKind::Subscribe, &msg, false, ctx)
    }

    fn start_unsubscribe(&mut self, topic: SubscribeTopic, cb: Completion) -> Result<()> {
        self.ensure_idle(OpKind::Unsubscribe)?;
        self.ensure_connected()?;
        let msg_id = self.next_msg_id();
        let msg = Message::Unsubscribe { msg_id, topic };
        let ctx = OpContext::new(msg_id, Stage::Unsubscribe, Some(cb));
        self.track(OpKind::Unsubscribe, &msg, false, ctx)
    }

    fn start_will_update(&mut self, will: Option<(LastWill, Vec<u8>)>, cb: Completion) -> Result<()> {
        self.ensure_idle(OpKind::WillUpdate)?;
        self.ensure_connected()?;
        let (topic, msg) = match will {
            Some((topic, msg)) => (Some(topic), Some(msg)),
            None => (None, None),
        };
        let req = Message::WillTopicUpd { will: topic };
        let ctx = OpContext::new(0, Stage::WillTopicUpd { msg }, Some(cb));
        self.track(OpKind::WillUpdate, &req, false, ctx)
    }

    // -- transmission -------------------------------------------------------

    fn send(&mut self, msg: &Message, broadcast: bool) -> Result<()> {
        let bytes = frame::encode(msg)?;
        self.transmit(&bytes, broadcast);
        Ok(())
    }

    fn transmit(&mut self, bytes: &[u8], broadcast: bool) {
        self.driver.send_data(bytes, broadcast);
        self.last_tx_ms = self.now_ms;
    }

    /// Encode, start tracking, then send.
    fn track(&mut self, kind: OpKind, msg: &Message, broadcast: bool, ctx: OpContext) -> Result<()> {
        let bytes = frame::encode(msg)?;
        self.ops.submit(kind, bytes.clone(), broadcast, ctx)?;
        self.transmit(&bytes, broadcast);
        Ok(())
    }

    /// Move a pending operation to its next request.
    fn restage(&mut self, kind: OpKind, msg: &Message, msg_id: u16, stage: Stage) {
        let bytes = match frame::encode(msg) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("cannot encode next stage of {:?}: {}", kind, e);
                return;
            }
        };
        if let Some(op) = self.ops.get_mut(&kind) {
            op.context.msg_id = msg_id;
            op.context.stage = stage;
        }
        if self.ops.restage(&kind, bytes.clone(), false).is_ok() {
            self.transmit(&bytes, false);
        }
    }

    fn finish(&mut self, kind: OpKind, status: AsyncStatus, reply: OpReply) {
        if let Some(op) = self.ops.complete(&kind) {
            resolve(op, status, reply);
        }
    }

    /// Pending operation of `kind` waiting for `msg_id`.
    fn awaiting(&self, kind: OpKind, msg_id: u16) -> Option<&Stage> {
        self.ops
            .get(&kind)
            .filter(|op| op.context.msg_id == msg_id)
            .map(|op| &op.context.stage)
    }

    // -- time ---------------------------------------------------------------

    fn enter(&mut self) {
        let elapsed = self.clock.elapsed(&mut self.driver);
        self.now_ms += elapsed;
        for ev in self.ops.tick(elapsed) {
            match ev {
                TrackerEvent::Retransmit {
                    bytes, broadcast, ..
                } => self.transmit(&bytes, broadcast),
                TrackerEvent::TimedOut(op) => self.on_timeout(op),
            }
        }
        self.expire_gateways();
        self.keep_alive();
    }

    fn leave(&mut self) {
        let mut next = self.ops.next_timeout();
        let mut consider = |ms: u64| {
            next = Some(next.map_or(ms, |n| n.min(ms)));
        };
        if let Some(ms) = self.keep_alive_due_in() {
            consider(ms);
        }
        for g in self.gateways.values() {
            if let Some(at) = g.expires_ms {
                consider(at.saturating_sub(self.now_ms));
            }
        }
        self.clock.program(&mut self.driver, next);
    }

    fn keep_alive_due_in(&self) -> Option<u64> {
        if self.state != ClientState::Connected || self.config.keep_alive_secs == 0 {
            return None;
        }
        let due = self.last_tx_ms + self.config.keep_alive_secs as u64 * 1000;
        Some(due.saturating_sub(self.now_ms))
    }

    fn keep_alive(&mut self) {
        if self.keep_alive_due_in() != Some(0) || self.ops.is_pending(&OpKind::KeepAlive) {
            return;
        }
        let ctx = OpContext::new(0, Stage::KeepAlive, None);
        if let Err(e) = self.track(
            OpKind::KeepAlive,
            &Message::Pingreq { client_id: None },
            false,
            ctx,
        ) {
            log::warn!("keep-alive PINGREQ failed: {}", e);
        }
    }

    fn expire_gateways(&mut self) {
        let now = self.now_ms;
        let lost: Vec<u8> = self
            .gateways
            .iter()
            .filter(|(_, g)| g.expires_ms.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for gw_id in lost {
            self.gateways.remove(&gw_id);
            log::info!("gateway {} lost", gw_id);
            self.handler.gateway_status(&GatewayStatus::Lost { gw_id });
        }
    }

    fn on_timeout(&mut self, op: PendingOp) {
        match op.key {
            OpKind::KeepAlive => {
                log::warn!("gateway stopped answering keep-alive");
                self.connection_lost();
            }
            OpKind::Connect => self.pending_will = None,
            OpKind::CheckMessages => self.state = ClientState::Asleep,
            OpKind::Disconnect => self.state = ClientState::Disconnected,
            _ => {}
        }
        resolve(op, AsyncStatus::Timeout, OpReply::None);
    }

    fn connection_lost(&mut self) {
        self.state = ClientState::Disconnected;
        self.ops.cancel(&OpKind::KeepAlive);
        self.inbound_qos2.clear();
        self.handler.connection_lost();
    }

    // -- inbound ------------------------------------------------------------

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Advertise { gw_id, duration } => {
                let ttl = duration as u64 * 1500 + self.config.retry_period_ms;
                self.learn_gateway(gw_id, Vec::new(), Some(self.now_ms + ttl));
            }
            Message::GwInfo { gw_id, gw_addr } => {
                self.learn_gateway(gw_id, gw_addr.clone(), None);
                self.finish(
                    OpKind::SearchGw,
                    AsyncStatus::Success,
                    OpReply::Gateway { gw_id, gw_addr },
                );
            }
            Message::SearchGw { .. } => {}
            Message::Connack { rc } => self.on_connack(rc),
            Message::WillTopicReq => self.on_will_request(true),
            Message::WillMsgReq => self.on_will_request(false),
            Message::Register {
                topic_id,
                msg_id,
                topic_name,
            } => {
                let rc = match self.topics.assign(&topic_name, topic_id) {
                    Ok(()) => ReturnCode::Accepted,
                    Err(_) => ReturnCode::NotSupported,
                };
                self.reply(&Message::Regack {
                    topic_id,
                    msg_id,
                    rc,
                });
            }
            Message::Regack {
                topic_id,
                msg_id,
                rc,
            } => self.on_regack(topic_id, msg_id, rc),
            Message::Publish {
                qos,
                retain,
                topic,
                msg_id,
                data,
                ..
            } => self.on_publish(topic, msg_id, qos, retain, data),
            Message::Puback { msg_id, rc, .. } => self.on_puback(msg_id, rc),
            Message::Pubrec { msg_id } => {
                if let Some(Stage::PublishRec { .. }) = self.awaiting(OpKind::Publish, msg_id) {
                    self.restage(
                        OpKind::Publish,
                        &Message::Pubrel { msg_id },
                        msg_id,
                        Stage::PublishComp,
                    );
                }
            }
            Message::Pubrel { msg_id } => {
                self.inbound_qos2.remove(&msg_id);
                self.reply(&Message::Pubcomp { msg_id });
            }
            Message::Pubcomp { msg_id } => {
                if let Some(Stage::PublishComp) = self.awaiting(OpKind::Publish, msg_id) {
                    self.finish(OpKind::Publish, AsyncStatus::Success, OpReply::None);
                }
            }
            Message::Suback {
                qos,
                topic_id,
                msg_id,
                rc,
            } => self.on_suback(qos, topic_id, msg_id, rc),
            Message::Unsuback { msg_id } => {
                if self.awaiting(OpKind::Unsubscribe, msg_id).is_some() {
                    self.finish(OpKind::Unsubscribe, AsyncStatus::Success, OpReply::None);
                }
            }
            Message::Pingreq { .. } => self.reply(&Message::Pingresp),
            Message::Pingresp => {
                if self.ops.complete(&OpKind::KeepAlive).is_none()
                    && self.ops.is_pending(&OpKind::CheckMessages)
                {
                    self.state = ClientState::Asleep;
                    self.finish(OpKind::CheckMessages, AsyncStatus::Success, OpReply::None);
                }
            }
            Message::Disconnect { .. } => self.on_disconnect(),
            Message::WillTopicResp { rc } => self.on_will_topic_resp(rc),
            Message::WillMsgResp { rc } => {
                if let Some(Stage::WillMsgUpd) = self.awaiting(OpKind::WillUpdate, 0) {
                    let status = if rc.is_accepted() {
                        AsyncStatus::Success
                    } else {
                        AsyncStatus::Rejected(rc)
                    };
                    self.finish(OpKind::WillUpdate, status, OpReply::None);
                }
            }
            other => log::debug!("ignoring unexpected {:?}", other.msg_type()),
        }
    }

    fn reply(&mut self, msg: &Message) {
        if let Err(e) = self.send(msg, false) {
            log::warn!("cannot send {:?}: {}", msg.msg_type(), e);
        }
    }

    fn learn_gateway(&mut self, gw_id: u8, gw_addr: Vec<u8>, expires_ms: Option<u64>) {
        let fresh = !self.gateways.contains_key(&gw_id);
        let entry = self.gateways.entry(gw_id).or_insert(KnownGateway {
            gw_addr: Vec::new(),
            expires_ms: None,
        });
        if !gw_addr.is_empty() {
            entry.gw_addr = gw_addr;
        }
        if expires_ms.is_some() {
            entry.expires_ms = expires_ms;
        }
        if fresh {
            log::info!("gateway {} available", gw_id);
            let status = GatewayStatus::Available {
                gw_id,
                gw_addr: entry.gw_addr.clone(),
            };
            self.handler.gateway_status(&status);
        }
    }

    fn on_connack(&mut self, rc: ReturnCode) {
        if !self.ops.is_pending(&OpKind::Connect) {
            log::debug!("CONNACK without pending CONNECT");
            return;
        }
        self.pending_will = None;
        if rc.is_accepted() {
            self.state = ClientState::Connected;
            if self.config.clean_session {
                self.topics.clear_registered();
                self.inbound_qos2.clear();
            }
            log::info!("connected as {}", self.config.client_id);
            self.finish(OpKind::Connect, AsyncStatus::Success, OpReply::None);
        } else {
            log::warn!("CONNECT rejected: {:?}", rc);
            self.finish(OpKind::Connect, AsyncStatus::Rejected(rc), OpReply::None);
        }
    }

    fn on_will_request(&mut self, topic: bool) {
        if !self.ops.is_pending(&OpKind::Connect) {
            return;
        }
        let (will_topic, will_msg) = match &self.pending_will {
            Some((t, m)) => (Some(t.clone()), m.clone()),
            None => (None, Vec::new()),
        };
        let msg = if topic {
            Message::WillTopic { will: will_topic }
        } else {
            Message::WillMsg { msg: will_msg }
        };
        self.restage(OpKind::Connect, &msg, 0, Stage::Connect);
    }

    fn on_regack(&mut self, topic_id: u16, msg_id: u16, rc: ReturnCode) {
        if let Some(Stage::Register { name }) = self.awaiting(OpKind::Register, msg_id) {
            let name = name.clone();
            if rc.is_accepted() && self.topics.assign(&name, topic_id).is_ok() {
                self.finish(
                    OpKind::Register,
                    AsyncStatus::Success,
                    OpReply::Registered { topic_id },
                );
            } else {
                let rc = if rc.is_accepted() { ReturnCode::NotSupported } else { rc };
                self.finish(OpKind::Register, AsyncStatus::Rejected(rc), OpReply::None);
            }
            return;
        }

        let Some(Stage::PublishRegister { .. }) = self.awaiting(OpKind::Publish, msg_id) else {
            log::debug!("REGACK for unknown msg_id {}", msg_id);
            return;
        };
        if !rc.is_accepted() {
            self.finish(OpKind::Publish, AsyncStatus::Rejected(rc), OpReply::None);
            return;
        }
        let Some(op) = self.ops.get_mut(&OpKind::Publish) else {
            return;
        };
        let Stage::PublishRegister {
            name,
            qos,
            retain,
            data,
        } = core::mem::replace(&mut op.context.stage, Stage::PublishComp)
        else {
            return;
        };
        if self.topics.assign(&name, topic_id).is_err() {
            self.finish(
                OpKind::Publish,
                AsyncStatus::Rejected(ReturnCode::NotSupported),
                OpReply::None,
            );
            return;
        }
        let topic = TopicRef::Normal(topic_id);
        if qos == QoS::AtMostOnce {
            if let Err(e) = self.send_publish(topic, 0, qos, retain, data) {
                log::warn!("publish failed: {}", e);
            }
            self.finish(OpKind::Publish, AsyncStatus::Success, OpReply::None);
            return;
        }
        let msg_id = self.next_msg_id();
        let stage = if qos == QoS::ExactlyOnce {
            Stage::PublishRec { topic }
        } else {
            Stage::PublishAck { topic }
        };
        let msg = Message::Publish {
            dup: false,
            qos,
            retain,
            topic,
            msg_id,
            data,
        };
        self.restage(OpKind::Publish, &msg, msg_id, stage);
    }

    fn on_puback(&mut self, msg_id: u16, rc: ReturnCode) {
        let topic = match self.awaiting(OpKind::Publish, msg_id) {
            Some(Stage::PublishAck { topic }) | Some(Stage::PublishRec { topic }) => *topic,
            _ => {
                log::debug!("PUBACK for unknown msg_id {}", msg_id);
                return;
            }
        };
        if rc.is_accepted() {
            self.finish(OpKind::Publish, AsyncStatus::Success, OpReply::None);
            return;
        }
        if rc == ReturnCode::InvalidTopicId {
            // Gateway forgot the registration; re-register on next publish.
            if let TopicRef::Normal(id) = topic {
                self.topics.remove(id);
            }
        }
        self.finish(OpKind::Publish, AsyncStatus::Rejected(rc), OpReply::None);
    }

    fn on_suback(&mut self, qos: QoS, topic_id: u16, msg_id: u16, rc: ReturnCode) {
        let Some(Stage::Subscribe { topic }) = self.awaiting(OpKind::Subscribe, msg_id) else {
            log::debug!("SUBACK for unknown msg_id {}", msg_id);
            return;
        };
        if !rc.is_accepted() {
            self.finish(OpKind::Subscribe, AsyncStatus::Rejected(rc), OpReply::None);
            return;
        }
        if let SubscribeTopic::Name(name) = topic {
            if topic_id != 0 && !is_wildcard(name) {
                let name = name.clone();
                if let Err(e) = self.topics.assign(&name, topic_id) {
                    log::warn!("SUBACK topic {} for '{}' not stored: {}", topic_id, name, e);
                }
            }
        }
        self.finish(
            OpKind::Subscribe,
            AsyncStatus::Success,
            OpReply::Subscribed { topic_id, qos },
        );
    }

    fn on_publish(&mut self, topic: TopicRef, msg_id: u16, qos: QoS, retain: bool, data: Vec<u8>) {
        let name = match self.topics.resolve(&topic) {
            Ok(name) => name,
            Err(_) => {
                log::warn!("PUBLISH on unknown topic {:?}", topic);
                if matches!(qos, QoS::AtLeastOnce | QoS::ExactlyOnce) {
                    self.reply(&Message::Puback {
                        topic_id: topic.ack_id(),
                        msg_id,
                        rc: ReturnCode::InvalidTopicId,
                    });
                }
                return;
            }
        };

        let deliver = match qos {
            QoS::ExactlyOnce => self.inbound_qos2.insert(msg_id),
            _ => true,
        };
        if deliver {
            let inbound = InboundMessage {
                topic: name,
                data,
                qos,
                retain,
            };
            self.handler.message_received(&inbound);
        }
        match qos {
            QoS::AtLeastOnce => self.reply(&Message::Puback {
                topic_id: topic.ack_id(),
                msg_id,
                rc: ReturnCode::Accepted,
            }),
            QoS::ExactlyOnce => self.reply(&Message::Pubrec { msg_id }),
            _ => {}
        }
    }

    fn on_disconnect(&mut self) {
        if self.ops.is_pending(&OpKind::Sleep) {
            if let Some(Stage::Sleep { duration }) =
                self.ops.get(&OpKind::Sleep).map(|op| &op.context.stage)
            {
                log::info!("sleeping for {} s", duration);
            }
            self.state = ClientState::Asleep;
            self.ops.cancel(&OpKind::KeepAlive);
            self.finish(OpKind::Sleep, AsyncStatus::Success, OpReply::None);
        } else if self.ops.is_pending(&OpKind::Disconnect) {
            self.state = ClientState::Disconnected;
            self.ops.cancel(&OpKind::KeepAlive);
            self.finish(OpKind::Disconnect, AsyncStatus::Success, OpReply::None);
        } else if self.state != ClientState::Disconnected {
            log::warn!("gateway closed the connection");
            self.connection_lost();
        }
    }

    fn on_will_topic_resp(&mut self, rc: ReturnCode) {
        let Some(Stage::WillTopicUpd { msg }) = self.awaiting(OpKind::WillUpdate, 0) else {
            return;
        };
        if !rc.is_accepted() {
            self.finish(OpKind::WillUpdate, AsyncStatus::Rejected(rc), OpReply::None);
            return;
        }
        match msg.clone() {
            Some(msg) => self.restage(
                OpKind::WillUpdate,
                &Message::WillMsgUpd { msg },
                0,
                Stage::WillMsgUpd,
            ),
            None => self.finish(OpKind::WillUpdate, AsyncStatus::Success, OpReply::None),
        }
    }
}
