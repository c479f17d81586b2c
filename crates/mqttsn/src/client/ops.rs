// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Operation kinds, outcomes and host-facing event types.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::message::{QoS, ReturnCode};

/// Kind of client operation. At most one of each kind is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    Connect,
    Disconnect,
    Register,
    Publish,
    Subscribe,
    Unsubscribe,
    Sleep,
    CheckMessages,
    WillUpdate,
    SearchGw,
    /// Internal PINGREQ keep-alive.
    KeepAlive,
}

/// Final outcome of an asynchronous operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    Success,
    Timeout,
    Canceled,
    /// The gateway answered with a negative return code.
    Rejected(ReturnCode),
}

/// Reply fields decoded for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReply {
    None,
    Registered { topic_id: u16 },
    Subscribed { topic_id: u16, qos: QoS },
    Gateway { gw_id: u8, gw_addr: Vec<u8> },
}

/// Completion callback of an operation.
pub type Completion = Box<dyn FnOnce(AsyncStatus, OpReply)>;

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    Asleep,
    /// Checking in for buffered messages while asleep.
    Awake,
}

/// Application message delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Gateway discovery report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Available { gw_id: u8, gw_addr: Vec<u8> },
    /// No ADVERTISE within 1.5 advertise periods.
    Lost { gw_id: u8 },
}

/// Receives unsolicited client events.
pub trait ClientHandler {
    fn message_received(&mut self, _msg: &InboundMessage) {}

    fn gateway_status(&mut self, _status: &GatewayStatus) {}

    /// Keep-alive exhausted or the gateway sent DISCONNECT.
    fn connection_lost(&mut self) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default)]
pub struct NullHandler;

impl ClientHandler for NullHandler {}
