// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the MQTT-SN core

use core::fmt;

/// Result type for MQTT-SN operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for MQTT-SN operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Frame is incomplete; the value is the exact number of missing bytes
    NeedMoreData(usize),

    /// Frame failed to parse
    Malformed(&'static str),

    /// Encoded frame would exceed 65535 bytes
    FrameTooLong,

    /// Topic ID range exhausted
    TableFull,

    /// Topic ID is not known to the registry
    InvalidTopicId(u16),

    /// A pending operation already uses this key
    KeyInUse,

    /// An operation of the same kind is already pending
    Busy,

    /// Operation needs an established connection
    NotConnected,

    /// Invalid parameter
    InvalidParameter,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NeedMoreData(n) => write!(f, "Need {} more bytes", n),
            Error::Malformed(what) => write!(f, "Malformed frame: {}", what),
            Error::FrameTooLong => write!(f, "Frame exceeds 65535 bytes"),
            Error::TableFull => write!(f, "Topic table full"),
            Error::InvalidTopicId(id) => write!(f, "Unknown topic id {}", id),
            Error::KeyInUse => write!(f, "Operation key already pending"),
            Error::Busy => write!(f, "Operation already in progress"),
            Error::NotConnected => write!(f, "Not connected"),
            Error::InvalidParameter => write!(f, "Invalid parameter"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
