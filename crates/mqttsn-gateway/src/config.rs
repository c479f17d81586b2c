// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration.
//!
//! Built programmatically or loaded from TOML:
//!
//! ```toml
//! gateway_id = 3
//! advertise_period_secs = 60
//!
//! [broker]
//! host = "mqtt.local"
//! port = 1883
//!
//! [[predefined_topics]]
//! id = 100
//! name = "plant/alarm"
//!
//! [[auth]]
//! client_id = "pump-7"
//! username = "pump"
//! password = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use mqttsn::tracker::RetryPolicy;
use mqttsn::TopicRegistry;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Topic with an ID fixed ahead of time on both client and gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedTopic {
    pub id: u16,
    pub name: String,
    /// Restrict the mapping to one client. `None` applies to every client.
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Broker credentials for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Credentials handed to the broker CONNECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Dynamic topic ID allocation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicIdRange {
    pub min: u16,
    pub max: u16,
}

impl Default for TopicIdRange {
    fn default() -> Self {
        Self {
            min: 1,
            max: 0xFFFE,
        }
    }
}

/// Upstream MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    /// Keep-alive negotiated with the broker, seconds. 0 disables it.
    #[serde(default = "default_broker_keep_alive")]
    pub keep_alive_secs: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive_secs: default_broker_keep_alive(),
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway ID carried in ADVERTISE and GWINFO.
    #[serde(default = "default_gateway_id")]
    pub gateway_id: u8,

    /// ADVERTISE period in seconds.
    #[serde(default = "default_advertise_period")]
    pub advertise_period_secs: u16,

    /// Retransmission period toward clients.
    #[serde(default = "default_retry_period")]
    pub retry_period_ms: u64,

    /// Retransmissions toward clients before giving up.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Time allowed for a broker answer (CONNACK, PUBACK, SUBACK...).
    #[serde(default = "default_broker_timeout")]
    pub broker_timeout_ms: u64,

    /// Substituted for clients that connect with an empty client ID.
    #[serde(default = "default_client_id")]
    pub default_client_id: String,

    #[serde(default)]
    pub predefined_topics: Vec<PredefinedTopic>,

    #[serde(default)]
    pub auth: Vec<AuthEntry>,

    #[serde(default)]
    pub topic_id_range: TopicIdRange,

    /// Messages buffered for a sleeping client before the oldest is dropped.
    #[serde(default = "default_sleeping_limit")]
    pub sleeping_client_msg_limit: usize,

    /// Broker-bound packets held while the broker link is down.
    #[serde(default = "default_backlog_limit")]
    pub broker_backlog_limit: usize,

    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_gateway_id() -> u8 {
    1
}

fn default_advertise_period() -> u16 {
    900
}

fn default_retry_period() -> u64 {
    10_000
}

fn default_retry_count() -> u32 {
    3
}

fn default_broker_timeout() -> u64 {
    30_000
}

fn default_client_id() -> String {
    "mqttsn-gw-client".to_string()
}

fn default_sleeping_limit() -> usize {
    32
}

fn default_backlog_limit() -> usize {
    64
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_broker_keep_alive() -> u16 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: default_gateway_id(),
            advertise_period_secs: default_advertise_period(),
            retry_period_ms: default_retry_period(),
            retry_count: default_retry_count(),
            broker_timeout_ms: default_broker_timeout(),
            default_client_id: default_client_id(),
            predefined_topics: Vec::new(),
            auth: Vec::new(),
            topic_id_range: TopicIdRange::default(),
            sleeping_client_msg_limit: default_sleeping_limit(),
            broker_backlog_limit: default_backlog_limit(),
            broker: BrokerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_period_ms == 0 {
            return Err(ConfigError::Invalid("retry_period_ms must be > 0".into()));
        }
        if self.broker_timeout_ms == 0 {
            return Err(ConfigError::Invalid("broker_timeout_ms must be > 0".into()));
        }
        if self.sleeping_client_msg_limit == 0 {
            return Err(ConfigError::Invalid(
                "sleeping_client_msg_limit must be > 0".into(),
            ));
        }
        if self.default_client_id.is_empty()
            || self.default_client_id.len() > mqttsn::client::MAX_CLIENT_ID_LEN
        {
            return Err(ConfigError::Invalid(
                "default_client_id must be 1..=23 bytes".into(),
            ));
        }
        let range = self.topic_id_range;
        if range.min == 0 || range.max == 0xFFFF || range.min > range.max {
            return Err(ConfigError::Invalid(format!(
                "topic_id_range {}..={} is empty or uses reserved IDs",
                range.min, range.max
            )));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        // Per-client entries may reuse an ID across clients, never within one.
        let mut seen = std::collections::HashSet::new();
        for t in &self.predefined_topics {
            if t.id == 0 || t.id == 0xFFFF {
                return Err(ConfigError::Invalid(format!(
                    "predefined topic '{}' uses reserved id {}",
                    t.name, t.id
                )));
            }
            if t.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "predefined topic {} has no name",
                    t.id
                )));
            }
            if !seen.insert((t.client_id.clone(), t.id)) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate predefined topic id {}",
                    t.id
                )));
            }
        }
        Ok(())
    }

    /// Set the gateway ID.
    pub fn with_gateway_id(mut self, id: u8) -> Self {
        self.gateway_id = id;
        self
    }

    /// Set the ADVERTISE period.
    pub fn with_advertise_period(mut self, secs: u16) -> Self {
        self.advertise_period_secs = secs;
        self
    }

    /// Set the client retransmission policy.
    pub fn with_retry(mut self, period_ms: u64, count: u32) -> Self {
        self.retry_period_ms = period_ms;
        self.retry_count = count;
        self
    }

    /// Add a predefined topic for every client.
    pub fn with_predefined_topic(mut self, id: u16, name: &str) -> Self {
        self.predefined_topics.push(PredefinedTopic {
            id,
            name: name.to_string(),
            client_id: None,
        });
        self
    }

    /// Add broker credentials for a client.
    pub fn with_auth(mut self, client_id: &str, username: &str, password: &str) -> Self {
        self.auth.push(AuthEntry {
            client_id: client_id.to_string(),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        });
        self
    }

    pub(crate) fn client_retry(&self) -> RetryPolicy {
        RetryPolicy {
            period_ms: self.retry_period_ms,
            count: self.retry_count,
        }
    }

    /// Broker exchanges are not retransmitted over TCP; they only time out.
    pub(crate) fn broker_retry(&self) -> RetryPolicy {
        RetryPolicy {
            period_ms: self.broker_timeout_ms,
            count: 0,
        }
    }

    /// Credentials configured for `client_id`.
    pub fn auth_info(&self, client_id: &str) -> Option<AuthInfo> {
        self.auth
            .iter()
            .find(|a| a.client_id == client_id)
            .map(|a| AuthInfo {
                username: a.username.clone(),
                password: a.password.as_ref().map(|p| p.as_bytes().to_vec()),
            })
    }

    /// Topic registry seeded with the predefined topics visible to
    /// `client_id` (global entries plus the client's own).
    pub fn topic_registry_for(&self, client_id: &str) -> Result<TopicRegistry, ConfigError> {
        let mut reg = TopicRegistry::new();
        reg.alloc_range(self.topic_id_range.min, self.topic_id_range.max)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let visible = self
            .predefined_topics
            .iter()
            .filter(|t| t.client_id.as_deref().map_or(true, |c| c == client_id));
        for t in visible {
            reg.add_predefined(&t.name, t.id).map_err(|e| {
                ConfigError::Invalid(format!("predefined topic {} '{}': {}", t.id, t.name, e))
            })?;
        }
        Ok(reg)
    }
}
