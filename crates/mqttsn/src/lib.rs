// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN v1.2 for constrained devices.
//!
//! `no_std` + `alloc` core shared by sensor firmware and the gateway:
//!
//! - [`frame`]: length-prefixed wire codec (short and extended forms)
//! - [`message`]: typed model of every MQTT-SN message
//! - [`topic`]: topic ID registry (predefined, registered, short names)
//! - [`tracker`]: retransmission and acknowledgment bookkeeping
//! - [`client`]: tick-driven client operation engine
//!
//! # Host integration
//!
//! ```text
//! radio RX ──> Client::process_data ─┐
//! timer    ──> Client::tick ─────────┼─> Driver::send_data / program_tick
//! app      ──> connect/publish/... ──┘
//! ```
//!
//! Nothing here spawns threads or reads clocks; the host implements
//! [`Driver`] and calls back in.
//!
//! # Example
//!
//! ```ignore
//! use mqttsn::{Client, ClientConfig, NullDriver, QoS};
//!
//! let mut client = Client::new(ClientConfig::new("sensor-01"), NullDriver)?;
//! client.connect(None, |status, _| log::info!("connect: {:?}", status))?;
//! // ... feed radio frames with process_data(), timer expiries with tick()
//! client.publish("sensors/temp", b"21.5", QoS::AtLeastOnce, false, |_, _| {})?;
//! ```

#![cfg_attr(not(any(feature = "std", test)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod client;
pub mod driver;
pub mod error;
pub mod frame;
pub mod message;
pub mod topic;
pub mod tracker;

pub use client::{
    AsyncStatus, Client, ClientConfig, ClientHandler, ClientState, GatewayStatus, InboundMessage,
    NullHandler, OpKind, OpReply,
};
pub use driver::{Driver, NullDriver, TickClock};
pub use error::{Error, Result};
pub use frame::{decode, encode, peek_frame};
pub use message::{
    Flags, LastWill, Message, MsgType, QoS, ReturnCode, SubscribeTopic, TopicIdType, TopicRef,
};
pub use topic::{TopicClass, TopicEntry, TopicRegistry};
pub use tracker::{MsgIdAllocator, PendingOperation, RetryPolicy, RetryTracker, TrackerEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
