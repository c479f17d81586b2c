// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN frame codec
//!
//! ```text
//! short:     | len (1) | type (1) | body ... |        len = total <= 254
//! extended:  | 0x00 | len (2, BE) | type (1) | body |  len = total <= 65535
//! ```
//!
//! Decoding never consumes a partial frame: a short buffer yields
//! [`Error::NeedMoreData`] with the exact number of missing bytes so a stream
//! transport can wait for them.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::message::{
    Flags, LastWill, Message, MsgType, ReturnCode, SubscribeTopic, TopicIdType, TopicRef,
};

/// Largest total frame length that uses the one-byte prefix.
pub const SHORT_FRAME_MAX: usize = 254;

/// Largest total frame length the extended prefix can express.
pub const FRAME_MAX: usize = 0xFFFF;

const EXTENDED_MARKER: u8 = 0x00;
const PROTOCOL_ID: u8 = 0x01;

// ---------------------------------------------------------------------------
// Length prefix
// ---------------------------------------------------------------------------

/// Inspect the length prefix without consuming anything.
///
/// Returns `(prefix_len, total_len)`. `total_len` covers the prefix, the type
/// byte and the body.
pub fn peek_frame(buf: &[u8]) -> Result<(usize, usize)> {
    let first = *buf.first().ok_or(Error::NeedMoreData(1))?;
    if first == EXTENDED_MARKER {
        if buf.len() < 3 {
            return Err(Error::NeedMoreData(3 - buf.len()));
        }
        let total = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if total < 4 {
            return Err(Error::Malformed("extended length shorter than header"));
        }
        Ok((3, total))
    } else {
        // 255 is outside the short range on encode but tolerated on decode.
        let total = first as usize;
        if total < 2 {
            return Err(Error::Malformed("length shorter than header"));
        }
        Ok((1, total))
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns the message and the number of bytes consumed. Bytes after the
/// frame are left for the next call.
pub fn decode(buf: &[u8]) -> Result<(Message, usize)> {
    let (prefix, total) = peek_frame(buf)?;
    if buf.len() < total {
        return Err(Error::NeedMoreData(total - buf.len()));
    }
    let msg_type = buf[prefix];
    let msg_type = MsgType::from_u8(msg_type).ok_or(Error::Malformed("unknown message type"))?;
    let mut r = Reader::new(&buf[prefix + 1..total]);
    let msg = decode_body(msg_type, &mut r)?;
    r.finish()?;
    log::trace!("decoded {:?} ({} bytes)", msg_type, total);
    Ok((msg, total))
}

/// Encode a message into a complete frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    // An empty ID has no wire form distinct from a bare PINGREQ.
    if matches!(msg, Message::Pingreq { client_id: Some(id) } if id.is_empty()) {
        return Err(Error::InvalidParameter);
    }
    let mut body = Vec::with_capacity(16);
    body.push(msg.msg_type() as u8);
    encode_body(msg, &mut body);

    let short_total = body.len() + 1;
    if short_total <= SHORT_FRAME_MAX {
        let mut out = Vec::with_capacity(short_total);
        out.push(short_total as u8);
        out.extend_from_slice(&body);
        return Ok(out);
    }

    let total = body.len() + 3;
    if total > FRAME_MAX {
        return Err(Error::FrameTooLong);
    }
    let mut out = Vec::with_capacity(total);
    out.push(EXTENDED_MARKER);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Body reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(Error::Malformed("body shorter than declared layout"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn pair(&mut self) -> Result<[u8; 2]> {
        Ok([self.u8()?, self.u8()?])
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.rest();
        core::str::from_utf8(raw)
            .map(String::from)
            .map_err(|_| Error::Malformed("string is not utf-8"))
    }

    fn flags(&mut self) -> Result<Flags> {
        Flags::from_byte(self.u8()?)
    }

    fn return_code(&mut self) -> Result<ReturnCode> {
        ReturnCode::from_u8(self.u8()?)
    }

    /// Declared length and parsed layout must agree exactly.
    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::Malformed("trailing bytes after body"));
        }
        Ok(())
    }
}

fn decode_body(msg_type: MsgType, r: &mut Reader<'_>) -> Result<Message> {
    let msg = match msg_type {
        MsgType::Advertise => Message::Advertise {
            gw_id: r.u8()?,
            duration: r.u16()?,
        },
        MsgType::SearchGw => Message::SearchGw { radius: r.u8()? },
        MsgType::GwInfo => Message::GwInfo {
            gw_id: r.u8()?,
            gw_addr: r.rest().to_vec(),
        },
        MsgType::Connect => {
            let flags = r.flags()?;
            if r.u8()? != PROTOCOL_ID {
                return Err(Error::Malformed("unsupported protocol id"));
            }
            Message::Connect {
                will: flags.will,
                clean_session: flags.clean_session,
                duration: r.u16()?,
                client_id: r.string()?,
            }
        }
        MsgType::Connack => Message::Connack {
            rc: r.return_code()?,
        },
        MsgType::WillTopicReq => Message::WillTopicReq,
        MsgType::WillTopic => Message::WillTopic {
            will: read_will(r)?,
        },
        MsgType::WillMsgReq => Message::WillMsgReq,
        MsgType::WillMsg => Message::WillMsg {
            msg: r.rest().to_vec(),
        },
        MsgType::Register => Message::Register {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            topic_name: r.string()?,
        },
        MsgType::Regack => Message::Regack {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            rc: r.return_code()?,
        },
        MsgType::Publish => {
            let flags = r.flags()?;
            let raw = r.pair()?;
            let topic = match flags.topic_id_type {
                TopicIdType::Normal => TopicRef::Normal(u16::from_be_bytes(raw)),
                TopicIdType::Predefined => TopicRef::Predefined(u16::from_be_bytes(raw)),
                TopicIdType::Short => TopicRef::Short(raw),
            };
            Message::Publish {
                dup: flags.dup,
                qos: flags.qos,
                retain: flags.retain,
                topic,
                msg_id: r.u16()?,
                data: r.rest().to_vec(),
            }
        }
        MsgType::Puback => Message::Puback {
            topic_id: r.u16()?,
            msg_id: r.u16()?,
            rc: r.return_code()?,
        },
        MsgType::Pubrec => Message::Pubrec { msg_id: r.u16()? },
        MsgType::Pubrel => Message::Pubrel { msg_id: r.u16()? },
        MsgType::Pubcomp => Message::Pubcomp { msg_id: r.u16()? },
        MsgType::Subscribe => {
            let flags = r.flags()?;
            let msg_id = r.u16()?;
            Message::Subscribe {
                dup: flags.dup,
                qos: flags.qos,
                msg_id,
                topic: read_subscribe_topic(flags.topic_id_type, r)?,
            }
        }
        MsgType::Suback => {
            let flags = r.flags()?;
            Message::Suback {
                qos: flags.qos,
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                rc: r.return_code()?,
            }
        }
        MsgType::Unsubscribe => {
            let flags = r.flags()?;
            let msg_id = r.u16()?;
            Message::Unsubscribe {
                msg_id,
                topic: read_subscribe_topic(flags.topic_id_type, r)?,
            }
        }
        MsgType::Unsuback => Message::Unsuback { msg_id: r.u16()? },
        MsgType::Pingreq => Message::Pingreq {
            client_id: if r.remaining() == 0 {
                None
            } else {
                Some(r.string()?)
            },
        },
        MsgType::Pingresp => Message::Pingresp,
        MsgType::Disconnect => Message::Disconnect {
            duration: if r.remaining() == 0 {
                None
            } else {
                Some(r.u16()?)
            },
        },
        MsgType::WillTopicUpd => Message::WillTopicUpd {
            will: read_will(r)?,
        },
        MsgType::WillTopicResp => Message::WillTopicResp {
            rc: r.return_code()?,
        },
        MsgType::WillMsgUpd => Message::WillMsgUpd {
            msg: r.rest().to_vec(),
        },
        MsgType::WillMsgResp => Message::WillMsgResp {
            rc: r.return_code()?,
        },
    };
    Ok(msg)
}

fn read_will(r: &mut Reader<'_>) -> Result<Option<LastWill>> {
    if r.remaining() == 0 {
        return Ok(None);
    }
    let flags = r.flags()?;
    Ok(Some(LastWill {
        qos: flags.qos,
        retain: flags.retain,
        topic: r.string()?,
    }))
}

fn read_subscribe_topic(kind: TopicIdType, r: &mut Reader<'_>) -> Result<SubscribeTopic> {
    Ok(match kind {
        TopicIdType::Normal => SubscribeTopic::Name(r.string()?),
        TopicIdType::Predefined => SubscribeTopic::Predefined(r.u16()?),
        TopicIdType::Short => SubscribeTopic::Short(r.pair()?),
    })
}

// ---------------------------------------------------------------------------
// Body writer
// ---------------------------------------------------------------------------

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn encode_body(msg: &Message, out: &mut Vec<u8>) {
    match msg {
        Message::Advertise { gw_id, duration } => {
            out.push(*gw_id);
            put_u16(out, *duration);
        }
        Message::SearchGw { radius } => out.push(*radius),
        Message::GwInfo { gw_id, gw_addr } => {
            out.push(*gw_id);
            out.extend_from_slice(gw_addr);
        }
        Message::Connect {
            will,
            clean_session,
            duration,
            client_id,
        } => {
            let flags = Flags {
                will: *will,
                clean_session: *clean_session,
                ..Flags::default()
            };
            out.push(flags.to_byte());
            out.push(PROTOCOL_ID);
            put_u16(out, *duration);
            out.extend_from_slice(client_id.as_bytes());
        }
        Message::Connack { rc }
        | Message::WillTopicResp { rc }
        | Message::WillMsgResp { rc } => out.push(*rc as u8),
        Message::WillTopicReq | Message::WillMsgReq | Message::Pingresp => {}
        Message::WillTopic { will } | Message::WillTopicUpd { will } => {
            if let Some(w) = will {
                let flags = Flags {
                    qos: w.qos,
                    retain: w.retain,
                    ..Flags::default()
                };
                out.push(flags.to_byte());
                out.extend_from_slice(w.topic.as_bytes());
            }
        }
        Message::WillMsg { msg } | Message::WillMsgUpd { msg } => out.extend_from_slice(msg),
        Message::Register {
            topic_id,
            msg_id,
            topic_name,
        } => {
            put_u16(out, *topic_id);
            put_u16(out, *msg_id);
            out.extend_from_slice(topic_name.as_bytes());
        }
        Message::Regack {
            topic_id,
            msg_id,
            rc,
        }
        | Message::Puback {
            topic_id,
            msg_id,
            rc,
        } => {
            put_u16(out, *topic_id);
            put_u16(out, *msg_id);
            out.push(*rc as u8);
        }
        Message::Publish {
            dup,
            qos,
            retain,
            topic,
            msg_id,
            data,
        } => {
            let flags = Flags {
                dup: *dup,
                qos: *qos,
                retain: *retain,
                topic_id_type: topic.id_type(),
                ..Flags::default()
            };
            out.push(flags.to_byte());
            put_u16(out, topic.raw());
            put_u16(out, *msg_id);
            out.extend_from_slice(data);
        }
        Message::Pubrec { msg_id }
        | Message::Pubrel { msg_id }
        | Message::Pubcomp { msg_id }
        | Message::Unsuback { msg_id } => put_u16(out, *msg_id),
        Message::Subscribe {
            dup,
            qos,
            msg_id,
            topic,
        } => {
            let flags = Flags {
                dup: *dup,
                qos: *qos,
                topic_id_type: topic.id_type(),
                ..Flags::default()
            };
            out.push(flags.to_byte());
            put_u16(out, *msg_id);
            write_subscribe_topic(topic, out);
        }
        Message::Suback {
            qos,
            topic_id,
            msg_id,
            rc,
        } => {
            let flags = Flags {
                qos: *qos,
                ..Flags::default()
            };
            out.push(flags.to_byte());
            put_u16(out, *topic_id);
            put_u16(out, *msg_id);
            out.push(*rc as u8);
        }
        Message::Unsubscribe { msg_id, topic } => {
            let flags = Flags {
                topic_id_type: topic.id_type(),
                ..Flags::default()
            };
            out.push(flags.to_byte());
            put_u16(out, *msg_id);
            write_subscribe_topic(topic, out);
        }
        Message::Pingreq { client_id } => {
            if let Some(id) = client_id {
                out.extend_from_slice(id.as_bytes());
            }
        }
        Message::Disconnect { duration } => {
            if let Some(d) = duration {
                put_u16(out, *d);
            }
        }
    }
}

fn write_subscribe_topic(topic: &SubscribeTopic, out: &mut Vec<u8>) {
    match topic {
        SubscribeTopic::Name(name) => out.extend_from_slice(name.as_bytes()),
        SubscribeTopic::Predefined(id) => put_u16(out, *id),
        SubscribeTopic::Short(s) => out.extend_from_slice(s),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
