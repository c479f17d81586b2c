// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway errors.

use thiserror::Error;

use crate::config::ConfigError;
use crate::mqtt::MqttError;

/// Errors surfaced by the gateway API.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT-SN: {0}")]
    Protocol(#[from] mqttsn::Error),

    #[error("MQTT: {0}")]
    Mqtt(#[from] MqttError),

    #[error("advertise period is zero")]
    AdvertiseDisabled,

    #[error("session terminated")]
    SessionClosed,
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
