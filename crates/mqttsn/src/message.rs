// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN v1.2 message model
//!
//! One variant per message kind, carrying only the fields the protocol
//! defines for it. Byte layout lives in [`crate::frame`].

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Message type codes
// ---------------------------------------------------------------------------

/// Message type byte (MQTT-SN v1.2 section 5.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MsgType {
    Advertise = 0x00,
    SearchGw = 0x01,
    GwInfo = 0x02,
    Connect = 0x04,
    Connack = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0A,
    Regack = 0x0B,
    Publish = 0x0C,
    Puback = 0x0D,
    Pubcomp = 0x0E,
    Pubrec = 0x0F,
    Pubrel = 0x10,
    Subscribe = 0x12,
    Suback = 0x13,
    Unsubscribe = 0x14,
    Unsuback = 0x15,
    Pingreq = 0x16,
    Pingresp = 0x17,
    Disconnect = 0x18,
    WillTopicUpd = 0x1A,
    WillTopicResp = 0x1B,
    WillMsgUpd = 0x1C,
    WillMsgResp = 0x1D,
}

impl MsgType {
    /// Decode a type byte. Unknown and unsupported codes yield `None`.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Advertise,
            0x01 => Self::SearchGw,
            0x02 => Self::GwInfo,
            0x04 => Self::Connect,
            0x05 => Self::Connack,
            0x06 => Self::WillTopicReq,
            0x07 => Self::WillTopic,
            0x08 => Self::WillMsgReq,
            0x09 => Self::WillMsg,
            0x0A => Self::Register,
            0x0B => Self::Regack,
            0x0C => Self::Publish,
            0x0D => Self::Puback,
            0x0E => Self::Pubcomp,
            0x0F => Self::Pubrec,
            0x10 => Self::Pubrel,
            0x12 => Self::Subscribe,
            0x13 => Self::Suback,
            0x14 => Self::Unsubscribe,
            0x15 => Self::Unsuback,
            0x16 => Self::Pingreq,
            0x17 => Self::Pingresp,
            0x18 => Self::Disconnect,
            0x1A => Self::WillTopicUpd,
            0x1B => Self::WillTopicResp,
            0x1C => Self::WillMsgUpd,
            0x1D => Self::WillMsgResp,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Quality of service level. `NoSession` is MQTT-SN's QoS -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
    NoSession,
}

impl QoS {
    /// Numeric level as used by MQTT (0..=2). `NoSession` maps to 0.
    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce | QoS::NoSession => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    /// Build from an MQTT level, clamping anything above 2.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn bits(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0b00,
            QoS::AtLeastOnce => 0b01,
            QoS::ExactlyOnce => 0b10,
            QoS::NoSession => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => QoS::AtMostOnce,
            0b01 => QoS::AtLeastOnce,
            0b10 => QoS::ExactlyOnce,
            _ => QoS::NoSession,
        }
    }
}

/// How the topic field of PUBLISH/SUBSCRIBE/UNSUBSCRIBE is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicIdType {
    /// Registered topic ID (PUBLISH) or topic name (SUBSCRIBE).
    #[default]
    Normal,
    Predefined,
    Short,
}

impl TopicIdType {
    fn bits(self) -> u8 {
        match self {
            TopicIdType::Normal => 0b00,
            TopicIdType::Predefined => 0b01,
            TopicIdType::Short => 0b10,
        }
    }
}

/// The shared flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: TopicIdType,
}

impl Flags {
    pub const DUP: u8 = 0x80;
    pub const RETAIN: u8 = 0x10;
    pub const WILL: u8 = 0x08;
    pub const CLEAN_SESSION: u8 = 0x04;

    pub fn to_byte(self) -> u8 {
        let mut b = (self.qos.bits() << 5) | self.topic_id_type.bits();
        if self.dup {
            b |= Self::DUP;
        }
        if self.retain {
            b |= Self::RETAIN;
        }
        if self.will {
            b |= Self::WILL;
        }
        if self.clean_session {
            b |= Self::CLEAN_SESSION;
        }
        b
    }

    /// Parse a flags byte. TopicIdType `0b11` is reserved and rejected.
    pub fn from_byte(b: u8) -> Result<Self> {
        let topic_id_type = match b & 0b11 {
            0b00 => TopicIdType::Normal,
            0b01 => TopicIdType::Predefined,
            0b10 => TopicIdType::Short,
            _ => return Err(Error::Malformed("reserved topic id type")),
        };
        Ok(Self {
            dup: b & Self::DUP != 0,
            qos: QoS::from_bits(b >> 5),
            retain: b & Self::RETAIN != 0,
            will: b & Self::WILL != 0,
            clean_session: b & Self::CLEAN_SESSION != 0,
            topic_id_type,
        })
    }
}

// ---------------------------------------------------------------------------
// Return codes and topic references
// ---------------------------------------------------------------------------

/// Return code carried by acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0x00,
    Congestion = 0x01,
    InvalidTopicId = 0x02,
    NotSupported = 0x03,
}

impl ReturnCode {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(Self::Accepted),
            0x01 => Ok(Self::Congestion),
            0x02 => Ok(Self::InvalidTopicId),
            0x03 => Ok(Self::NotSupported),
            _ => Err(Error::Malformed("unknown return code")),
        }
    }

    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

/// Topic reference inside a PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicRef {
    /// ID obtained through REGISTER/REGACK or SUBACK.
    Normal(u16),
    Predefined(u16),
    /// Two-character topic name carried inline.
    Short([u8; 2]),
}

impl TopicRef {
    pub fn id_type(&self) -> TopicIdType {
        match self {
            TopicRef::Normal(_) => TopicIdType::Normal,
            TopicRef::Predefined(_) => TopicIdType::Predefined,
            TopicRef::Short(_) => TopicIdType::Short,
        }
    }

    /// The two wire bytes of the topic field.
    pub fn raw(&self) -> u16 {
        match self {
            TopicRef::Normal(id) | TopicRef::Predefined(id) => *id,
            TopicRef::Short(s) => u16::from_be_bytes(*s),
        }
    }

    /// Value for the topic-id field of PUBACK.
    pub fn ack_id(&self) -> u16 {
        self.raw()
    }
}

/// Topic field of SUBSCRIBE/UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscribeTopic {
    /// Full topic name, may contain wildcards.
    Name(String),
    Predefined(u16),
    Short([u8; 2]),
}

impl SubscribeTopic {
    pub fn id_type(&self) -> TopicIdType {
        match self {
            SubscribeTopic::Name(_) => TopicIdType::Normal,
            SubscribeTopic::Predefined(_) => TopicIdType::Predefined,
            SubscribeTopic::Short(_) => TopicIdType::Short,
        }
    }
}

/// Will topic with its delivery flags. An absent `LastWill` in
/// WILLTOPIC/WILLTOPICUPD is the empty frame that deletes the will.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A decoded MQTT-SN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Advertise {
        gw_id: u8,
        duration: u16,
    },
    SearchGw {
        radius: u8,
    },
    GwInfo {
        gw_id: u8,
        /// Empty when sent by a gateway, filled in when relayed by a client.
        gw_addr: Vec<u8>,
    },
    Connect {
        will: bool,
        clean_session: bool,
        duration: u16,
        client_id: String,
    },
    Connack {
        rc: ReturnCode,
    },
    WillTopicReq,
    WillTopic {
        will: Option<LastWill>,
    },
    WillMsgReq,
    WillMsg {
        msg: Vec<u8>,
    },
    Register {
        topic_id: u16,
        msg_id: u16,
        topic_name: String,
    },
    Regack {
        topic_id: u16,
        msg_id: u16,
        rc: ReturnCode,
    },
    Publish {
        dup: bool,
        qos: QoS,
        retain: bool,
        topic: TopicRef,
        msg_id: u16,
        data: Vec<u8>,
    },
    Puback {
        topic_id: u16,
        msg_id: u16,
        rc: ReturnCode,
    },
    Pubrec {
        msg_id: u16,
    },
    Pubrel {
        msg_id: u16,
    },
    Pubcomp {
        msg_id: u16,
    },
    Subscribe {
        dup: bool,
        qos: QoS,
        msg_id: u16,
        topic: SubscribeTopic,
    },
    Suback {
        qos: QoS,
        topic_id: u16,
        msg_id: u16,
        rc: ReturnCode,
    },
    Unsubscribe {
        msg_id: u16,
        topic: SubscribeTopic,
    },
    Unsuback {
        msg_id: u16,
    },
    Pingreq {
        client_id: Option<String>,
    },
    Pingresp,
    Disconnect {
        /// Present when the client goes to sleep.
        duration: Option<u16>,
    },
    WillTopicUpd {
        will: Option<LastWill>,
    },
    WillTopicResp {
        rc: ReturnCode,
    },
    WillMsgUpd {
        msg: Vec<u8>,
    },
    WillMsgResp {
        rc: ReturnCode,
    },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Advertise { .. } => MsgType::Advertise,
            Message::SearchGw { .. } => MsgType::SearchGw,
            Message::GwInfo { .. } => MsgType::GwInfo,
            Message::Connect { .. } => MsgType::Connect,
            Message::Connack { .. } => MsgType::Connack,
            Message::WillTopicReq => MsgType::WillTopicReq,
            Message::WillTopic { .. } => MsgType::WillTopic,
            Message::WillMsgReq => MsgType::WillMsgReq,
            Message::WillMsg { .. } => MsgType::WillMsg,
            Message::Register { .. } => MsgType::Register,
            Message::Regack { .. } => MsgType::Regack,
            Message::Publish { .. } => MsgType::Publish,
            Message::Puback { .. } => MsgType::Puback,
            Message::Pubrec { .. } => MsgType::Pubrec,
            Message::Pubrel { .. } => MsgType::Pubrel,
            Message::Pubcomp { .. } => MsgType::Pubcomp,
            Message::Subscribe { .. } => MsgType::Subscribe,
            Message::Suback { .. } => MsgType::Suback,
            Message::Unsubscribe { .. } => MsgType::Unsubscribe,
            Message::Unsuback { .. } => MsgType::Unsuback,
            Message::Pingreq { .. } => MsgType::Pingreq,
            Message::Pingresp => MsgType::Pingresp,
            Message::Disconnect { .. } => MsgType::Disconnect,
            Message::WillTopicUpd { .. } => MsgType::WillTopicUpd,
            Message::WillTopicResp { .. } => MsgType::WillTopicResp,
            Message::WillMsgUpd { .. } => MsgType::WillMsgUpd,
            Message::WillMsgResp { .. } => MsgType::WillMsgResp,
        }
    }

    /// Message ID for the kinds that carry one.
    pub fn msg_id(&self) -> Option<u16> {
        match self {
            Message::Register { msg_id, .. }
            | Message::Regack { msg_id, .. }
            | Message::Publish { msg_id, .. }
            | Message::Puback { msg_id, .. }
            | Message::Pubrec { msg_id }
            | Message::Pubrel { msg_id }
            | Message::Pubcomp { msg_id }
            | Message::Subscribe { msg_id, .. }
            | Message::Suback { msg_id, .. }
            | Message::Unsubscribe { msg_id, .. }
            | Message::Unsuback { msg_id } => Some(*msg_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_byte_layout() {
        let f = Flags {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: true,
            will: false,
            clean_session: true,
            topic_id_type: TopicIdType::Short,
        };
        assert_eq!(f.to_byte(), 0x80 | 0x40 | 0x10 | 0x04 | 0x02);
        assert_eq!(Flags::from_byte(f.to_byte()).unwrap(), f);
    }

    #[test]
    fn test_qos_minus_one_bits() {
        let f = Flags::from_byte(0x60).unwrap();
        assert_eq!(f.qos, QoS::NoSession);
        assert_eq!(f.qos.level(), 0);
    }

    #[test]
    fn test_reserved_topic_type_rejected() {
        assert!(matches!(Flags::from_byte(0x03), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_return_code_range() {
        assert_eq!(ReturnCode::from_u8(2).unwrap(), ReturnCode::InvalidTopicId);
        assert!(ReturnCode::from_u8(4).is_err());
    }

    #[test]
    fn test_msg_type_codes() {
        assert_eq!(MsgType::from_u8(0x0C), Some(MsgType::Publish));
        assert_eq!(MsgType::from_u8(0x03), None);
        assert_eq!(MsgType::from_u8(0x11), None);
        assert_eq!(MsgType::from_u8(0xFE), None);
        assert_eq!(MsgType::WillMsgResp as u8, 0x1D);
    }

    #[test]
    fn test_msg_id_accessor() {
        let m = Message::Pubrel { msg_id: 9 };
        assert_eq!(m.msg_id(), Some(9));
        assert_eq!(Message::Pingresp.msg_id(), None);
        assert_eq!(m.msg_type(), MsgType::Pubrel);
    }

    #[test]
    fn test_short_topic_raw() {
        let t = TopicRef::Short(*b"ab");
        assert_eq!(t.raw(), 0x6162);
        assert_eq!(t.id_type(), TopicIdType::Short);
    }
}
