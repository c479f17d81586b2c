// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN v1.2 gateway bridging sensor networks to an MQTT 3.1.1 broker.
//!
//! # Architecture
//!
//! ```text
//! MQTT-SN client (MCU)            Gateway (this crate)              MQTT broker
//!        |                              |                                |
//!        |--- SEARCHGW (bcast) ------->|                                |
//!        |<-- GWINFO (bcast) ----------|                                |
//!        |--- CONNECT ---------------->|--- CONNECT ------------------->|
//!        |<-- CONNACK -----------------|<-- CONNACK --------------------|
//!        |--- REGISTER("a/b") -------->|                                |
//!        |<-- REGACK(id) --------------|                                |
//!        |--- PUBLISH(id, QoS1) ------>|--- PUBLISH("a/b", QoS1) ----->|
//!        |<-- PUBACK ------------------|<-- PUBACK --------------------|
//! ```
//!
//! Each client gets a [`Session`] with its own broker connection. The host
//! owns the sockets and timers and drives everything through
//! [`SessionDriver`] and [`mqttsn::Driver`]; nothing here blocks or spawns.
//!
//! # Sleeping clients
//!
//! A client that disconnects with a duration is asleep: broker publishes for
//! it are queued (bounded, oldest dropped first) and flushed when it checks
//! in with PINGREQ.

pub mod advertiser;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mqtt;
pub mod session;

pub use advertiser::Advertiser;
pub use config::{
    AuthEntry, AuthInfo, BrokerConfig, ConfigError, GatewayConfig, PredefinedTopic, TopicIdRange,
};
pub use error::{GatewayError, Result};
pub use gateway::{DriverFactory, Gateway};
pub use mqtt::{ConnackCode, MqttError, Packet};
pub use session::{OutboundMessage, Session, SessionDriver, SessionState};

#[cfg(test)]
mod tests;
