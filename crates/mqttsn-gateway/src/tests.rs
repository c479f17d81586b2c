// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Gateway session and front-end scenarios.
//
// Sessions are driven by a recording driver: frames toward the client and
// the broker are captured, and the single-shot timer is fired by hand.

use std::sync::Arc;

use mqttsn::{frame, Driver, LastWill, Message, QoS, ReturnCode, SubscribeTopic, TopicRef};

use crate::config::{GatewayConfig, TopicIdRange};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::mqtt::{self, ConnackCode, Packet};
use crate::session::*;

#[derive(Default)]
struct Rig {
    to_client: Vec<Vec<u8>>,
    to_broker: Vec<Vec<u8>>,
    programmed: Option<u64>,
    remaining: u64,
    reconnects: usize,
    connected: Vec<String>,
    terminated: Vec<String>,
}

impl SessionDriver for Rig {
    fn send_to_client(&mut self, data: &[u8]) {
        self.to_client.push(data.to_vec());
    }

    fn send_to_broker(&mut self, data: &[u8]) {
        self.to_broker.push(data.to_vec());
    }

    fn program_tick(&mut self, ms: u64) {
        self.programmed = Some(ms);
        self.remaining = ms;
    }

    fn cancel_tick(&mut self) -> u64 {
        self.programmed = None;
        std::mem::take(&mut self.remaining)
    }

    fn broker_reconnect_request(&mut self) {
        self.reconnects += 1;
    }

    fn client_connected(&mut self, client_id: &str) {
        self.connected.push(client_id.to_string());
    }

    fn session_terminated(&mut self, client_id: &str) {
        self.terminated.push(client_id.to_string());
    }
}

#[derive(Debug, Default)]
struct Broadcast {
    sent: Vec<(Vec<u8>, bool)>,
    ticks: Vec<u64>,
}

impl Driver for Broadcast {
    fn send_data(&mut self, data: &[u8], broadcast: bool) {
        self.sent.push((data.to_vec(), broadcast));
    }

    fn program_tick(&mut self, ms: u64) {
        self.ticks.push(ms);
    }

    fn cancel_tick(&mut self) -> u64 {
        0
    }
}

type TestSession = Session<Rig>;

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default().with_retry(1000, 2);
    config.broker_timeout_ms = 5000;
    config.broker.keep_alive_secs = 0;
    config.sleeping_client_msg_limit = 3;
    config.broker_backlog_limit = 2;
    config
}

fn sn(msg: Message) -> Vec<u8> {
    frame::encode(&msg).unwrap()
}

fn pkt(packet: Packet) -> Vec<u8> {
    mqtt::encode(&packet).unwrap()
}

fn connect_msg(client_id: &str, will: bool, duration: u16) -> Message {
    Message::Connect {
        will,
        clean_session: true,
        duration,
        client_id: client_id.to_string(),
    }
}

/// Drain and decode everything sent to the client.
fn client_rx(s: &mut TestSession) -> Vec<Message> {
    std::mem::take(&mut s.driver_mut().to_client)
        .iter()
        .map(|b| frame::decode(b).unwrap().0)
        .collect()
}

/// Drain and decode everything sent to the broker.
fn broker_rx(s: &mut TestSession) -> Vec<Packet> {
    std::mem::take(&mut s.driver_mut().to_broker)
        .iter()
        .map(|b| mqtt::decode(b).unwrap().0)
        .collect()
}

/// Let the programmed timer run out.
fn fire(s: &mut TestSession) {
    s.driver_mut().remaining = 0;
    s.tick();
}

fn session_with(config: GatewayConfig) -> TestSession {
    Session::new(Arc::new(config), Rig::default())
}

fn connected_with(config: GatewayConfig, duration: u16) -> TestSession {
    let mut s = session_with(config);
    s.data_from_client(&sn(connect_msg("dev-1", false, duration)));
    s.broker_connected(true);
    s.data_from_broker(&pkt(Packet::Connack {
        session_present: false,
        code: ConnackCode::Accepted,
    }));
    assert_eq!(s.state(), SessionState::Active);
    client_rx(&mut s);
    broker_rx(&mut s);
    s
}

fn connected() -> TestSession {
    connected_with(config(), 0)
}

fn broker_publish(s: &mut TestSession, topic: &str, qos: u8, id: Option<u16>, data: &[u8]) {
    s.data_from_broker(&pkt(Packet::Publish(mqtt::Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.to_string(),
        packet_id: id,
        payload: data.to_vec(),
    })));
}

fn client_publish(s: &mut TestSession, qos: QoS, topic: TopicRef, msg_id: u16, data: &[u8]) {
    s.data_from_client(&sn(Message::Publish {
        dup: false,
        qos,
        retain: false,
        topic,
        msg_id,
        data: data.to_vec(),
    }));
}

fn register(s: &mut TestSession, name: &str, msg_id: u16) -> u16 {
    s.data_from_client(&sn(Message::Register {
        topic_id: 0,
        msg_id,
        topic_name: name.to_string(),
    }));
    match client_rx(s).as_slice() {
        [Message::Regack {
            topic_id,
            rc: ReturnCode::Accepted,
            ..
        }] => *topic_id,
        other => panic!("unexpected {:?}", other),
    }
}

// -----------------------------------------------------------------------
// 1. Connect bridge
// -----------------------------------------------------------------------
#[test]
fn test_connect_bridges_to_broker() {
    let mut s = session_with(config());
    s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
    assert_eq!(s.state(), SessionState::Connecting);
    assert_eq!(s.driver().reconnects, 1);
    assert!(broker_rx(&mut s).is_empty());

    s.broker_connected(true);
    match broker_rx(&mut s).as_slice() {
        [Packet::Connect(c)] => {
            assert_eq!(c.client_id, "dev-1");
            assert!(c.clean_session);
            assert!(c.will.is_none());
            assert!(c.username.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }

    s.data_from_broker(&pkt(Packet::Connack {
        session_present: false,
        code: ConnackCode::Accepted,
    }));
    assert_eq!(s.state(), SessionState::Active);
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Connack {
            rc: ReturnCode::Accepted
        }]
    );
    assert_eq!(s.driver().connected, vec!["dev-1".to_string()]);
}

#[test]
fn test_connect_with_will_exchange() {
    let mut s = session_with(config());
    s.data_from_client(&sn(connect_msg("dev-1", true, 0)));
    assert_eq!(client_rx(&mut s), vec![Message::WillTopicReq]);

    s.data_from_client(&sn(Message::WillTopic {
        will: Some(LastWill {
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: "dev/status".into(),
        }),
    }));
    assert_eq!(client_rx(&mut s), vec![Message::WillMsgReq]);
    assert_eq!(s.driver().reconnects, 0);

    s.data_from_client(&sn(Message::WillMsg {
        msg: b"gone".to_vec(),
    }));
    assert_eq!(s.driver().reconnects, 1);
    s.broker_connected(true);
    match broker_rx(&mut s).as_slice() {
        [Packet::Connect(c)] => {
            let will = c.will.as_ref().unwrap();
            assert_eq!(will.topic, "dev/status");
            assert_eq!(will.message, b"gone");
            assert_eq!(will.qos, 1);
            assert!(will.retain);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_will_exchange_timeout_closes() {
    let mut s = session_with(config());
    s.data_from_client(&sn(connect_msg("dev-1", true, 0)));
    assert_eq!(s.driver().programmed, Some(1000));
    fire(&mut s);
    fire(&mut s);
    assert_eq!(s.state(), SessionState::Connecting);
    fire(&mut s);
    assert_eq!(s.state(), SessionState::Disconnected);
    assert_eq!(client_rx(&mut s), vec![Message::WillTopicReq; 3]);
    assert_eq!(s.driver().programmed, None);
}

#[test]
fn test_empty_client_id_uses_default() {
    let mut s = session_with(config());
    s.data_from_client(&sn(connect_msg("", false, 0)));
    assert_eq!(s.client_id(), "mqttsn-gw-client");
}

#[test]
fn test_auth_from_config() {
    let mut s = session_with(config().with_auth("dev-1", "user", "pw"));
    s.broker_connected(true);
    s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
    // Link already up: no reconnect request.
    assert_eq!(s.driver().reconnects, 0);
    match broker_rx(&mut s).as_slice() {
        [Packet::Connect(c)] => {
            assert_eq!(c.username.as_deref(), Some("user"));
            assert_eq!(c.password.as_deref(), Some(&b"pw"[..]));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_broker_rejection_maps_return_code() {
    for (code, rc) in [
        (ConnackCode::ServerUnavailable, ReturnCode::Congestion),
        (ConnackCode::BadCredentials, ReturnCode::NotSupported),
    ] {
        let mut s = session_with(config());
        s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
        s.broker_connected(true);
        s.data_from_broker(&pkt(Packet::Connack {
            session_present: false,
            code,
        }));
        assert_eq!(client_rx(&mut s), vec![Message::Connack { rc }]);
        assert_eq!(s.state(), SessionState::Disconnected);
        assert_eq!(s.driver().terminated, vec!["dev-1".to_string()]);
    }
}

#[test]
fn test_broker_timeout_rejects_with_congestion() {
    let mut s = session_with(config());
    s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
    s.broker_connected(true);
    assert_eq!(s.driver().programmed, Some(5000));
    fire(&mut s);
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Connack {
            rc: ReturnCode::Congestion
        }]
    );
    assert_eq!(s.state(), SessionState::Disconnected);
}

#[test]
fn test_duplicate_connect_ignored_while_connecting() {
    let mut s = session_with(config());
    s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
    s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
    assert_eq!(s.driver().reconnects, 1);
}

// -----------------------------------------------------------------------
// 2. Register and publish toward the broker
// -----------------------------------------------------------------------
#[test]
fn test_register_allocates_topic_id() {
    let mut s = connected();
    assert_eq!(register(&mut s, "plant/temp", 1), 1);
    assert_eq!(register(&mut s, "plant/hum", 2), 2);
    // Same name, same ID.
    assert_eq!(register(&mut s, "plant/temp", 3), 1);
}

#[test]
fn test_register_table_full_is_congestion() {
    let mut cfg = config();
    cfg.topic_id_range = TopicIdRange { min: 1, max: 1 };
    let mut s = connected_with(cfg, 0);
    assert_eq!(register(&mut s, "a/b", 1), 1);
    s.data_from_client(&sn(Message::Register {
        topic_id: 0,
        msg_id: 2,
        topic_name: "c/d".into(),
    }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Regack {
            topic_id: 0,
            msg_id: 2,
            rc: ReturnCode::Congestion
        }]
    );
    assert_eq!(s.state(), SessionState::Active);
}

#[test]
fn test_publish_qos0_forwards() {
    let mut s = connected();
    let id = register(&mut s, "plant/temp", 1);
    client_publish(&mut s, QoS::AtMostOnce, TopicRef::Normal(id), 0, b"21.5");
    match broker_rx(&mut s).as_slice() {
        [Packet::Publish(p)] => {
            assert_eq!(p.topic, "plant/temp");
            assert_eq!(p.qos, 0);
            assert_eq!(p.packet_id, None);
            assert_eq!(p.payload, b"21.5");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(client_rx(&mut s).is_empty());
}

#[test]
fn test_publish_unknown_topic_gets_invalid_topic_id() {
    let mut s = connected();
    client_publish(&mut s, QoS::AtLeastOnce, TopicRef::Normal(77), 5, b"x");
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Puback {
            topic_id: 77,
            msg_id: 5,
            rc: ReturnCode::InvalidTopicId
        }]
    );
    assert!(broker_rx(&mut s).is_empty());
    assert_eq!(s.state(), SessionState::Active);
}

#[test]
fn test_publish_qos1_bridged() {
    let mut s = connected();
    let id = register(&mut s, "plant/temp", 1);
    client_publish(&mut s, QoS::AtLeastOnce, TopicRef::Normal(id), 7, b"v");
    match broker_rx(&mut s).as_slice() {
        [Packet::Publish(p)] => {
            assert_eq!(p.qos, 1);
            assert_eq!(p.packet_id, Some(7));
        }
        other => panic!("unexpected {:?}", other),
    }

    // Client retransmission while the broker has not answered.
    client_publish(&mut s, QoS::AtLeastOnce, TopicRef::Normal(id), 7, b"v");
    assert!(broker_rx(&mut s).is_empty());

    s.data_from_broker(&pkt(Packet::Puback(7)));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Puback {
            topic_id: id,
            msg_id: 7,
            rc: ReturnCode::Accepted
        }]
    );
}

#[test]
fn test_publish_qos1_broker_timeout_congestion() {
    let mut s = connected();
    let id = register(&mut s, "plant/temp", 1);
    client_publish(&mut s, QoS::AtLeastOnce, TopicRef::Normal(id), 7, b"v");
    assert_eq!(s.driver().programmed, Some(5000));
    fire(&mut s);
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Puback {
            topic_id: id,
            msg_id: 7,
            rc: ReturnCode::Congestion
        }]
    );
    assert_eq!(s.state(), SessionState::Active);
}

#[test]
fn test_publish_qos2_bridged() {
    let mut s = connected();
    let id = register(&mut s, "plant/temp", 1);
    client_publish(&mut s, QoS::ExactlyOnce, TopicRef::Normal(id), 9, b"v");
    match broker_rx(&mut s).as_slice() {
        [Packet::Publish(p)] => assert_eq!((p.qos, p.packet_id), (2, Some(9))),
        other => panic!("unexpected {:?}", other),
    }

    s.data_from_broker(&pkt(Packet::Pubrec(9)));
    assert_eq!(client_rx(&mut s), vec![Message::Pubrec { msg_id: 9 }]);

    // Lost PUBREC: the duplicate is answered without reaching the broker.
    client_publish(&mut s, QoS::ExactlyOnce, TopicRef::Normal(id), 9, b"v");
    assert_eq!(client_rx(&mut s), vec![Message::Pubrec { msg_id: 9 }]);
    assert!(broker_rx(&mut s).is_empty());

    s.data_from_client(&sn(Message::Pubrel { msg_id: 9 }));
    assert_eq!(broker_rx(&mut s), vec![Packet::Pubrel(9)]);
    s.data_from_broker(&pkt(Packet::Pubcomp(9)));
    assert_eq!(client_rx(&mut s), vec![Message::Pubcomp { msg_id: 9 }]);

    // Late PUBREL after completion.
    s.data_from_client(&sn(Message::Pubrel { msg_id: 9 }));
    assert_eq!(client_rx(&mut s), vec![Message::Pubcomp { msg_id: 9 }]);
    assert!(broker_rx(&mut s).is_empty());
}

#[test]
fn test_publish_predefined_and_short_topics() {
    let mut s = connected_with(config().with_predefined_topic(100, "plant/alarm"), 0);
    client_publish(&mut s, QoS::AtMostOnce, TopicRef::Predefined(100), 0, b"1");
    client_publish(&mut s, QoS::AtMostOnce, TopicRef::Short(*b"ab"), 0, b"2");
    let topics: Vec<String> = broker_rx(&mut s)
        .into_iter()
        .map(|p| match p {
            Packet::Publish(p) => p.topic,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(topics, vec!["plant/alarm".to_string(), "ab".to_string()]);
}

// -----------------------------------------------------------------------
// 3. Subscribe / unsubscribe
// -----------------------------------------------------------------------
fn subscribe(s: &mut TestSession, topic: SubscribeTopic, msg_id: u16) {
    s.data_from_client(&sn(Message::Subscribe {
        dup: false,
        qos: QoS::AtLeastOnce,
        msg_id,
        topic,
    }));
}

#[test]
fn test_subscribe_by_name_returns_topic_id() {
    let mut s = connected();
    subscribe(&mut s, SubscribeTopic::Name("cmd/pump".into()), 3);
    assert_eq!(
        broker_rx(&mut s),
        vec![Packet::Subscribe {
            packet_id: 3,
            filters: vec![("cmd/pump".into(), 1)]
        }]
    );
    s.data_from_broker(&pkt(Packet::Suback {
        packet_id: 3,
        codes: vec![1],
    }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Suback {
            qos: QoS::AtLeastOnce,
            topic_id: 1,
            msg_id: 3,
            rc: ReturnCode::Accepted
        }]
    );
}

#[test]
fn test_subscribe_wildcard_has_no_topic_id() {
    let mut s = connected();
    subscribe(&mut s, SubscribeTopic::Name("cmd/#".into()), 4);
    broker_rx(&mut s);
    s.data_from_broker(&pkt(Packet::Suback {
        packet_id: 4,
        codes: vec![0],
    }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Suback {
            qos: QoS::AtMostOnce,
            topic_id: 0,
            msg_id: 4,
            rc: ReturnCode::Accepted
        }]
    );
    assert!(s.topics().lookup_by_name("cmd/#").is_none());
}

#[test]
fn test_subscribe_unknown_predefined_rejected() {
    let mut s = connected();
    subscribe(&mut s, SubscribeTopic::Predefined(9), 5);
    assert!(broker_rx(&mut s).is_empty());
    match client_rx(&mut s).as_slice() {
        [Message::Suback { msg_id: 5, rc, .. }] => assert_eq!(*rc, ReturnCode::InvalidTopicId),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_subscribe_broker_failure_not_supported() {
    let mut s = connected();
    subscribe(&mut s, SubscribeTopic::Name("cmd/pump".into()), 3);
    s.data_from_broker(&pkt(Packet::Suback {
        packet_id: 3,
        codes: vec![mqtt::SUBACK_FAILURE],
    }));
    match client_rx(&mut s).as_slice() {
        [Message::Suback { rc, .. }] => assert_eq!(*rc, ReturnCode::NotSupported),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_subscribe_timeout_congestion() {
    let mut s = connected();
    subscribe(&mut s, SubscribeTopic::Name("cmd/pump".into()), 3);
    fire(&mut s);
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Suback {
            qos: QoS::AtMostOnce,
            topic_id: 1,
            msg_id: 3,
            rc: ReturnCode::Congestion
        }]
    );
}

#[test]
fn test_unsubscribe_bridged() {
    let mut s = connected();
    s.data_from_client(&sn(Message::Unsubscribe {
        msg_id: 4,
        topic: SubscribeTopic::Name("cmd/pump".into()),
    }));
    assert_eq!(
        broker_rx(&mut s),
        vec![Packet::Unsubscribe {
            packet_id: 4,
            filters: vec!["cmd/pump".into()]
        }]
    );
    s.data_from_broker(&pkt(Packet::Unsuback(4)));
    assert_eq!(client_rx(&mut s), vec![Message::Unsuback { msg_id: 4 }]);
}

// -----------------------------------------------------------------------
// 4. Delivery from the broker
// -----------------------------------------------------------------------
#[test]
fn test_broker_publish_registers_before_publish() {
    let mut s = connected();
    broker_publish(&mut s, "cmd/pump", 1, Some(11), b"on");
    assert_eq!(broker_rx(&mut s), vec![Packet::Puback(11)]);
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Register {
            topic_id: 1,
            msg_id: 1,
            topic_name: "cmd/pump".into()
        }]
    );

    s.data_from_client(&sn(Message::Regack {
        topic_id: 1,
        msg_id: 1,
        rc: ReturnCode::Accepted,
    }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: TopicRef::Normal(1),
            msg_id: 2,
            data: b"on".to_vec()
        }]
    );
    s.data_from_client(&sn(Message::Puback {
        topic_id: 1,
        msg_id: 2,
        rc: ReturnCode::Accepted,
    }));

    // Known now: straight to PUBLISH.
    broker_publish(&mut s, "cmd/pump", 0, None, b"off");
    match client_rx(&mut s).as_slice() {
        [Message::Publish { topic, qos, .. }] => {
            assert_eq!(*topic, TopicRef::Normal(1));
            assert_eq!(*qos, QoS::AtMostOnce);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_short_and_predefined_delivery() {
    let mut s = connected_with(config().with_predefined_topic(100, "plant/alarm"), 0);
    broker_publish(&mut s, "ab", 0, None, b"1");
    broker_publish(&mut s, "plant/alarm", 0, None, b"2");
    let topics: Vec<TopicRef> = client_rx(&mut s)
        .into_iter()
        .map(|m| match m {
            Message::Publish { topic, .. } => topic,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        topics,
        vec![TopicRef::Short(*b"ab"), TopicRef::Predefined(100)]
    );
}

#[test]
fn test_broker_qos2_delivery() {
    let mut s = connected();
    broker_publish(&mut s, "ab", 2, Some(12), b"x");
    assert_eq!(broker_rx(&mut s), vec![Packet::Pubrec(12)]);
    match client_rx(&mut s).as_slice() {
        [Message::Publish { qos, msg_id, .. }] => {
            assert_eq!(*qos, QoS::ExactlyOnce);
            assert_eq!(*msg_id, 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    // Broker retransmits before PUBREL: acknowledged again, not re-queued.
    broker_publish(&mut s, "ab", 2, Some(12), b"x");
    assert_eq!(broker_rx(&mut s), vec![Packet::Pubrec(12)]);
    assert_eq!(s.queued(), 0);
    assert!(client_rx(&mut s).is_empty());

    s.data_from_client(&sn(Message::Pubrec { msg_id: 1 }));
    assert_eq!(client_rx(&mut s), vec![Message::Pubrel { msg_id: 1 }]);
    s.data_from_client(&sn(Message::Pubcomp { msg_id: 1 }));

    s.data_from_broker(&pkt(Packet::Pubrel(12)));
    assert_eq!(broker_rx(&mut s), vec![Packet::Pubcomp(12)]);
}

#[test]
fn test_one_delivery_in_flight() {
    let mut s = connected();
    broker_publish(&mut s, "ab", 1, Some(1), b"first");
    broker_publish(&mut s, "ab", 1, Some(2), b"second");
    assert_eq!(client_rx(&mut s).len(), 1);
    assert_eq!(s.queued(), 1);

    s.data_from_client(&sn(Message::Puback {
        topic_id: u16::from_be_bytes(*b"ab"),
        msg_id: 1,
        rc: ReturnCode::Accepted,
    }));
    match client_rx(&mut s).as_slice() {
        [Message::Publish { data, msg_id, .. }] => {
            assert_eq!(data, b"second");
            assert_eq!(*msg_id, 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_delivery_timeout_terminates() {
    let mut s = connected();
    broker_publish(&mut s, "ab", 1, Some(1), b"x");
    fire(&mut s);
    fire(&mut s);
    fire(&mut s);
    assert_eq!(s.state(), SessionState::Disconnected);
    let sent = client_rx(&mut s);
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|m| *m == sent[0]));
    assert_eq!(s.driver().terminated, vec!["dev-1".to_string()]);
}

#[test]
fn test_puback_invalid_topic_forgets_mapping() {
    let mut s = connected();
    broker_publish(&mut s, "cmd/pump", 1, Some(1), b"x");
    s.data_from_client(&sn(Message::Regack {
        topic_id: 1,
        msg_id: 1,
        rc: ReturnCode::Accepted,
    }));
    s.data_from_client(&sn(Message::Puback {
        topic_id: 1,
        msg_id: 2,
        rc: ReturnCode::InvalidTopicId,
    }));
    assert!(s.topics().lookup_by_name("cmd/pump").is_none());
}

#[test]
fn test_delivery_without_topic_id_counts_as_dropped() {
    let mut cfg = config();
    cfg.topic_id_range = TopicIdRange { min: 1, max: 1 };
    let mut s = connected_with(cfg, 0);
    assert_eq!(register(&mut s, "a/b", 1), 1);

    broker_publish(&mut s, "c/d", 0, None, b"x");
    assert!(client_rx(&mut s).is_empty());
    assert_eq!(s.queued(), 0);
    assert_eq!(s.dropped_count(), 1);
    assert_eq!(s.state(), SessionState::Active);
}

// -----------------------------------------------------------------------
// 5. Sleeping clients
// -----------------------------------------------------------------------
fn sleep(s: &mut TestSession, secs: u16) {
    s.data_from_client(&sn(Message::Disconnect {
        duration: Some(secs),
    }));
    assert_eq!(
        client_rx(s),
        vec![Message::Disconnect { duration: None }]
    );
    assert_eq!(s.state(), SessionState::Asleep);
}

#[test]
fn test_sleep_queue_and_flush_on_checkin() {
    let mut s = connected();
    sleep(&mut s, 60);

    for i in 0..5u8 {
        broker_publish(&mut s, "ab", 0, None, &[i]);
    }
    assert!(client_rx(&mut s).is_empty());
    assert_eq!(s.queued(), 3);
    assert_eq!(s.dropped_count(), 2);

    s.data_from_client(&sn(Message::Pingreq {
        client_id: Some("dev-1".into()),
    }));
    let rx = client_rx(&mut s);
    let payloads: Vec<Vec<u8>> = rx
        .iter()
        .filter_map(|m| match m {
            Message::Publish { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(payloads, vec![vec![2], vec![3], vec![4]]);
    assert_eq!(rx.last(), Some(&Message::Pingresp));
    assert_eq!(s.state(), SessionState::Active);
}

#[test]
fn test_sleep_flush_waits_for_acks() {
    let mut s = connected();
    sleep(&mut s, 60);
    broker_publish(&mut s, "ab", 1, Some(1), b"a");
    broker_publish(&mut s, "ab", 1, Some(2), b"b");
    broker_rx(&mut s);

    s.data_from_client(&sn(Message::Pingreq { client_id: None }));
    assert_eq!(s.state(), SessionState::Awake);
    assert_eq!(client_rx(&mut s).len(), 1);

    let ab = u16::from_be_bytes(*b"ab");
    s.data_from_client(&sn(Message::Puback {
        topic_id: ab,
        msg_id: 1,
        rc: ReturnCode::Accepted,
    }));
    assert_eq!(client_rx(&mut s).len(), 1);
    assert_eq!(s.state(), SessionState::Awake);

    s.data_from_client(&sn(Message::Puback {
        topic_id: ab,
        msg_id: 2,
        rc: ReturnCode::Accepted,
    }));
    assert_eq!(client_rx(&mut s), vec![Message::Pingresp]);
    assert_eq!(s.state(), SessionState::Active);
}

#[test]
fn test_pingreq_from_other_client_ignored() {
    let mut s = connected();
    sleep(&mut s, 60);
    s.data_from_client(&sn(Message::Pingreq {
        client_id: Some("other".into()),
    }));
    assert_eq!(s.state(), SessionState::Asleep);
    assert!(client_rx(&mut s).is_empty());
}

#[test]
fn test_enqueue_reports_dropped() {
    let mut s = connected();
    sleep(&mut s, 60);
    let msg = |b: u8| OutboundMessage {
        topic: "ab".into(),
        data: vec![b],
        qos: QoS::AtMostOnce,
        retain: false,
    };
    assert_eq!(s.enqueue(msg(1)), None);
    assert_eq!(s.enqueue(msg(2)), None);
    assert_eq!(s.enqueue(msg(3)), None);
    assert_eq!(s.enqueue(msg(4)), Some(msg(1)));
    assert_eq!(s.dropped_count(), 1);
}

#[test]
fn test_connect_while_asleep_wakes() {
    let mut s = connected();
    sleep(&mut s, 60);
    broker_publish(&mut s, "ab", 0, None, b"q");
    s.data_from_client(&sn(connect_msg("dev-1", false, 0)));
    assert_eq!(s.state(), SessionState::Active);
    let rx = client_rx(&mut s);
    assert_eq!(
        rx[0],
        Message::Connack {
            rc: ReturnCode::Accepted
        }
    );
    assert!(matches!(&rx[1], Message::Publish { data, .. } if data == b"q"));
}

#[test]
fn test_missing_checkin_expires_sleeping_client() {
    let mut s = connected();
    sleep(&mut s, 10);
    assert_eq!(s.driver().programmed, Some(15_000));
    fire(&mut s);
    assert_eq!(s.state(), SessionState::Disconnected);
}

#[test]
fn test_sleep_again_while_asleep_extends() {
    let mut s = connected();
    sleep(&mut s, 10);
    broker_publish(&mut s, "ab", 0, None, b"q");
    sleep(&mut s, 20);
    assert_eq!(s.driver().programmed, Some(30_000));
    assert_eq!(s.queued(), 1);
    assert!(broker_rx(&mut s).is_empty());
}

// -----------------------------------------------------------------------
// 6. Keep-alive and disconnect
// -----------------------------------------------------------------------
#[test]
fn test_client_disconnect_closes_both_sides() {
    let mut s = connected();
    s.data_from_client(&sn(Message::Disconnect { duration: None }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Disconnect { duration: None }]
    );
    assert_eq!(broker_rx(&mut s), vec![Packet::Disconnect]);
    assert_eq!(s.state(), SessionState::Disconnected);
    assert_eq!(s.driver().terminated, vec!["dev-1".to_string()]);
}

#[test]
fn test_keep_alive_expiry() {
    let mut s = connected_with(config(), 10);
    assert_eq!(s.driver().programmed, Some(15_000));
    fire(&mut s);
    assert_eq!(s.state(), SessionState::Disconnected);
}

#[test]
fn test_client_traffic_defers_keep_alive() {
    let mut s = connected_with(config(), 10);
    s.driver_mut().remaining = 5_000;
    s.data_from_client(&sn(Message::Pingreq { client_id: None }));
    assert_eq!(client_rx(&mut s), vec![Message::Pingresp]);
    assert_eq!(s.driver().programmed, Some(15_000));
}

#[test]
fn test_broker_keep_alive_ping() {
    let mut cfg = config();
    cfg.broker.keep_alive_secs = 30;
    let mut s = connected_with(cfg, 0);
    assert_eq!(s.driver().programmed, Some(30_000));
    fire(&mut s);
    assert_eq!(broker_rx(&mut s), vec![Packet::Pingreq]);
    assert_eq!(s.driver().programmed, Some(5000));
    s.data_from_broker(&pkt(Packet::Pingresp));
    assert_eq!(s.driver().programmed, Some(30_000));
}

#[test]
fn test_terminate_notifies() {
    let mut s = connected();
    s.terminate();
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Disconnect { duration: None }]
    );
    assert_eq!(broker_rx(&mut s), vec![Packet::Disconnect]);
    assert_eq!(s.state(), SessionState::Disconnected);
    // Closed sessions ignore further input.
    s.data_from_client(&sn(Message::Pingreq { client_id: None }));
    assert!(client_rx(&mut s).is_empty());
}

// -----------------------------------------------------------------------
// 7. Broker link loss
// -----------------------------------------------------------------------
#[test]
fn test_broker_reconnect_flushes_backlog() {
    let mut s = connected();
    let id = register(&mut s, "plant/temp", 1);

    s.broker_connected(false);
    assert_eq!(s.driver().reconnects, 2);
    assert_eq!(s.state(), SessionState::Active);

    for b in [b"1", b"2", b"3"] {
        client_publish(&mut s, QoS::AtMostOnce, TopicRef::Normal(id), 0, b);
    }
    assert_eq!(s.backlog_len(), 2);
    assert!(broker_rx(&mut s).is_empty());

    s.broker_connected(true);
    match broker_rx(&mut s).as_slice() {
        [Packet::Connect(c)] => assert!(!c.clean_session),
        other => panic!("unexpected {:?}", other),
    }
    s.data_from_broker(&pkt(Packet::Connack {
        session_present: true,
        code: ConnackCode::Accepted,
    }));
    let payloads: Vec<Vec<u8>> = broker_rx(&mut s)
        .into_iter()
        .map(|p| match p {
            Packet::Publish(p) => p.payload,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(payloads, vec![b"2".to_vec(), b"3".to_vec()]);
    assert!(client_rx(&mut s).is_empty());
    assert!(s.broker_link_up());
}

#[test]
fn test_reconnect_timeout_terminates() {
    let mut s = connected();
    s.broker_connected(false);
    assert_eq!(s.driver().programmed, Some(5000));
    fire(&mut s);
    assert_eq!(s.state(), SessionState::Disconnected);
}

#[test]
fn test_publish_timeout_during_outage_is_not_flushed() {
    let mut s = connected();
    let id = register(&mut s, "plant/temp", 1);

    s.broker_connected(false);
    client_publish(&mut s, QoS::AtLeastOnce, TopicRef::Normal(id), 7, b"x");
    assert_eq!(s.backlog_len(), 1);

    // Link comes back 3 s into the 5 s publish deadline.
    s.driver_mut().remaining = 2000;
    s.broker_connected(true);
    assert!(matches!(broker_rx(&mut s).as_slice(), [Packet::Connect(_)]));
    assert_eq!(s.driver().programmed, Some(2000));

    fire(&mut s);
    assert_eq!(
        client_rx(&mut s),
        vec![Message::Puback {
            topic_id: id,
            msg_id: 7,
            rc: ReturnCode::Congestion
        }]
    );
    assert_eq!(s.backlog_len(), 0);

    s.data_from_broker(&pkt(Packet::Connack {
        session_present: true,
        code: ConnackCode::Accepted,
    }));
    assert!(broker_rx(&mut s).is_empty());
    assert!(client_rx(&mut s).is_empty());
    assert!(s.broker_link_up());
}

// -----------------------------------------------------------------------
// 8. Will updates
// -----------------------------------------------------------------------
#[test]
fn test_will_topic_update_relinks() {
    let mut s = connected();
    s.data_from_client(&sn(Message::WillTopicUpd {
        will: Some(LastWill {
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "dev/lwt".into(),
        }),
    }));
    assert_eq!(broker_rx(&mut s), vec![Packet::Disconnect]);
    assert_eq!(s.driver().reconnects, 2);

    s.broker_connected(true);
    match broker_rx(&mut s).as_slice() {
        [Packet::Connect(c)] => {
            assert!(!c.clean_session);
            assert_eq!(c.will.as_ref().unwrap().topic, "dev/lwt");
        }
        other => panic!("unexpected {:?}", other),
    }
    s.data_from_broker(&pkt(Packet::Connack {
        session_present: true,
        code: ConnackCode::Accepted,
    }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::WillTopicResp {
            rc: ReturnCode::Accepted
        }]
    );
    assert_eq!(s.will().unwrap().0.topic, "dev/lwt");
}

#[test]
fn test_will_msg_update_failure_congestion() {
    let mut s = connected();
    s.data_from_client(&sn(Message::WillMsgUpd {
        msg: b"bye".to_vec(),
    }));
    s.broker_connected(true);
    broker_rx(&mut s);
    s.data_from_broker(&pkt(Packet::Connack {
        session_present: false,
        code: ConnackCode::NotAuthorized,
    }));
    assert_eq!(
        client_rx(&mut s),
        vec![Message::WillMsgResp {
            rc: ReturnCode::Congestion
        }]
    );
    assert_eq!(s.state(), SessionState::Disconnected);
}

// -----------------------------------------------------------------------
// 9. Gateway front end
// -----------------------------------------------------------------------
type TestGateway = Gateway<u32, Broadcast, Rig>;

fn gateway(config: GatewayConfig) -> TestGateway {
    Gateway::new(config, Broadcast::default(), |_: &u32| Rig::default()).unwrap()
}

#[test]
fn test_gateway_advertises() {
    let mut gw = gateway(config().with_gateway_id(3).with_advertise_period(60));
    gw.start().unwrap();
    let b = gw.advertiser().driver();
    assert_eq!(b.sent, vec![(vec![0x05, 0x00, 0x03, 0x00, 0x3C], true)]);
    assert_eq!(b.ticks, vec![60_000]);
}

#[test]
fn test_gateway_answers_searchgw() {
    let mut gw = gateway(config().with_gateway_id(7));
    let used = gw.data_from_client(&1, &sn(Message::SearchGw { radius: 1 }));
    assert_eq!(used, 3);
    let (bytes, broadcast) = &gw.advertiser().driver().sent[0];
    assert!(*broadcast);
    assert_eq!(
        frame::decode(bytes).unwrap().0,
        Message::GwInfo {
            gw_id: 7,
            gw_addr: vec![]
        }
    );
    assert_eq!(gw.session_count(), 0);
}

#[test]
fn test_gateway_creates_session_on_connect() {
    let mut gw = gateway(config());
    gw.data_from_client(&1, &sn(Message::Pingreq { client_id: None }));
    assert_eq!(gw.session_count(), 0);

    gw.data_from_client(&1, &sn(connect_msg("dev-1", false, 0)));
    assert_eq!(gw.session_count(), 1);
    assert_eq!(gw.session(&1).unwrap().state(), SessionState::Connecting);

    gw.broker_connected(&1, true);
    gw.data_from_broker(
        &1,
        &pkt(Packet::Connack {
            session_present: false,
            code: ConnackCode::Accepted,
        }),
    );
    assert_eq!(gw.session(&1).unwrap().state(), SessionState::Active);
}

#[test]
fn test_gateway_client_id_takeover() {
    let mut gw = gateway(config());
    gw.data_from_client(&1, &sn(connect_msg("dev-1", false, 0)));
    gw.data_from_client(&2, &sn(connect_msg("dev-1", false, 0)));
    assert_eq!(gw.session_count(), 1);
    assert!(gw.session(&1).is_none());
    assert_eq!(gw.session(&2).unwrap().client_id(), "dev-1");
}

#[test]
fn test_gateway_reaps_closed_sessions() {
    let mut gw = gateway(config());
    gw.data_from_client(&1, &sn(connect_msg("dev-1", false, 0)));
    gw.broker_connected(&1, true);
    gw.data_from_broker(
        &1,
        &pkt(Packet::Connack {
            session_present: false,
            code: ConnackCode::NotAuthorized,
        }),
    );
    assert_eq!(gw.session_count(), 0);
}

#[test]
fn test_gateway_rejects_invalid_config() {
    let cfg = config().with_retry(0, 3);
    let r = Gateway::<u32, Broadcast, Rig>::new(cfg, Broadcast::default(), |_: &u32| {
        Rig::default()
    });
    assert!(matches!(r, Err(GatewayError::Config(_))));
}

#[test]
fn test_gateway_enqueue_without_session() {
    let mut gw = gateway(config());
    let msg = OutboundMessage {
        topic: "ab".into(),
        data: vec![],
        qos: QoS::AtMostOnce,
        retain: false,
    };
    assert!(matches!(
        gw.enqueue(&9, msg),
        Err(GatewayError::SessionClosed)
    ));
}
