// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Client configuration.

use alloc::string::{String, ToString};

use crate::error::{Error, Result};
use crate::tracker::RetryPolicy;

/// Longest client identifier MQTT-SN allows.
pub const MAX_CLIENT_ID_LEN: usize = 23;

/// Configuration for a [`Client`](super::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Client identifier sent in CONNECT (1..=23 bytes).
    pub client_id: String,
    /// Keep-alive duration in seconds. 0 disables PINGREQ keep-alive.
    pub keep_alive_secs: u16,
    /// Request a clean session on CONNECT.
    pub clean_session: bool,
    /// Time between retransmissions of an unacknowledged request.
    pub retry_period_ms: u64,
    /// Retransmissions before an operation times out.
    pub retry_count: u32,
    /// Radius byte of SEARCHGW.
    pub broadcast_radius: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: "mqttsn-client".to_string(),
            keep_alive_secs: 60,
            clean_session: true,
            retry_period_ms: 10_000,
            retry_count: 3,
            broadcast_radius: 1,
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn with_retry(mut self, period_ms: u64, count: u32) -> Self {
        self.retry_period_ms = period_ms;
        self.retry_count = count;
        self
    }

    pub fn with_radius(mut self, radius: u8) -> Self {
        self.broadcast_radius = radius;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::InvalidParameter);
        }
        if self.retry_period_ms == 0 {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            period_ms: self.retry_period_ms,
            count: self.retry_count,
        }
    }
}
