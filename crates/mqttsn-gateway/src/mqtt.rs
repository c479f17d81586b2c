// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 packet codec for the broker side of a session.
//!
//! Only what the bridge exchanges with a broker is modelled. Packets are
//! framed with the fixed header (type nibble + flags) followed by the
//! variable-length "remaining length" (1..=4 bytes, 7 bits each).

use thiserror::Error;

/// Largest value the remaining-length varint can carry.
pub const MAX_REMAINING_LEN: usize = 268_435_455;

/// Codec errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MqttError {
    /// Packet incomplete; at least this many more bytes are needed.
    #[error("need {0} more bytes")]
    NeedMoreData(usize),

    #[error("malformed MQTT packet: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, MqttError>;

/// CONNACK return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocol = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ConnackCode {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocol),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadCredentials),
            5 => Ok(Self::NotAuthorized),
            _ => Err(MqttError::Malformed("connack code")),
        }
    }
}

/// SUBACK failure code.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Will carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos > 0`.
    pub packet_id: Option<u16>,
    pub payload: Vec<u8>,
}

/// MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack {
        session_present: bool,
        code: ConnackCode,
    },
    Publish(Publish),
    Puback(u16),
    Pubrec(u16),
    Pubrel(u16),
    Pubcomp(u16),
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, u8)>,
    },
    Suback {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    Unsuback(u16),
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    fn type_nibble(&self) -> u8 {
        match self {
            Packet::Connect(_) => 1,
            Packet::Connack { .. } => 2,
            Packet::Publish(_) => 3,
            Packet::Puback(_) => 4,
            Packet::Pubrec(_) => 5,
            Packet::Pubrel(_) => 6,
            Packet::Pubcomp(_) => 7,
            Packet::Subscribe { .. } => 8,
            Packet::Suback { .. } => 9,
            Packet::Unsubscribe { .. } => 10,
            Packet::Unsuback(_) => 11,
            Packet::Pingreq => 12,
            Packet::Pingresp => 13,
            Packet::Disconnect => 14,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bin(out, s.as_bytes());
}

fn put_bin(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u16).to_be_bytes());
    out.extend_from_slice(b);
}

fn put_varint(out: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Encode one packet.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut flags = 0u8;

    match packet {
        Packet::Connect(c) => {
            put_str(&mut body, "MQTT");
            body.push(4);
            let mut cf = 0u8;
            if c.clean_session {
                cf |= 0x02;
            }
            if let Some(w) = &c.will {
                if w.qos > 2 {
                    return Err(MqttError::Malformed("will qos"));
                }
                cf |= 0x04 | (w.qos << 3);
                if w.retain {
                    cf |= 0x20;
                }
            }
            if c.password.is_some() {
                cf |= 0x40;
            }
            if c.username.is_some() {
                cf |= 0x80;
            }
            body.push(cf);
            body.extend_from_slice(&c.keep_alive.to_be_bytes());
            put_str(&mut body, &c.client_id);
            if let Some(w) = &c.will {
                put_str(&mut body, &w.topic);
                put_bin(&mut body, &w.message);
            }
            if let Some(u) = &c.username {
                put_str(&mut body, u);
            }
            if let Some(p) = &c.password {
                put_bin(&mut body, p);
            }
        }
        Packet::Connack {
            session_present,
            code,
        } => {
            body.push(u8::from(*session_present));
            body.push(*code as u8);
        }
        Packet::Publish(p) => {
            if p.qos > 2 || (p.qos > 0) != p.packet_id.is_some() {
                return Err(MqttError::Malformed("publish qos/packet id"));
            }
            flags = (u8::from(p.dup) << 3) | (p.qos << 1) | u8::from(p.retain);
            put_str(&mut body, &p.topic);
            if let Some(id) = p.packet_id {
                body.extend_from_slice(&id.to_be_bytes());
            }
            body.extend_from_slice(&p.payload);
        }
        Packet::Puback(id) | Packet::Pubrec(id) | Packet::Pubcomp(id) | Packet::Unsuback(id) => {
            body.extend_from_slice(&id.to_be_bytes());
        }
        Packet::Pubrel(id) => {
            flags = 0x02;
            body.extend_from_slice(&id.to_be_bytes());
        }
        Packet::Subscribe { packet_id, filters } => {
            flags = 0x02;
            body.extend_from_slice(&packet_id.to_be_bytes());
            for (filter, qos) in filters {
                put_str(&mut body, filter);
                body.push(*qos);
            }
        }
        Packet::Suback { packet_id, codes } => {
            body.extend_from_slice(&packet_id.to_be_bytes());
            body.extend_from_slice(codes);
        }
        Packet::Unsubscribe { packet_id, filters } => {
            flags = 0x02;
            body.extend_from_slice(&packet_id.to_be_bytes());
            for filter in filters {
                put_str(&mut body, filter);
            }
        }
        Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => {}
    }

    if body.len() > MAX_REMAINING_LEN {
        return Err(MqttError::Malformed("packet too long"));
    }
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push((packet.type_nibble() << 4) | flags);
    put_varint(&mut out, body.len());
    out.extend_from_slice(&body);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
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
            .ok_or(MqttError::Malformed("truncated body"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn bin(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        if self.remaining() < len {
            return Err(MqttError::Malformed("truncated field"));
        }
        let b = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(b)
    }

    fn string(&mut self) -> Result<String> {
        let b = self.bin()?;
        String::from_utf8(b.to_vec()).map_err(|_| MqttError::Malformed("utf-8"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let b = &self.buf[self.pos..];
        self.pos = self.buf.len();
        b
    }

    fn finish(&self) -> Result<()> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(MqttError::Malformed("trailing bytes"))
        }
    }
}

/// Decode one packet from the front of `buf`, returning it and the number
/// of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Packet, usize)> {
    let Some(&first) = buf.first() else {
        return Err(MqttError::NeedMoreData(2));
    };

    let mut len = 0usize;
    let mut shift = 0;
    let mut header = 1;
    loop {
        let Some(&b) = buf.get(header) else {
            return Err(MqttError::NeedMoreData(1));
        };
        header += 1;
        len |= ((b & 0x7F) as usize) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if header > 4 {
            return Err(MqttError::Malformed("remaining length"));
        }
    }

    let total = header + len;
    if buf.len() < total {
        return Err(MqttError::NeedMoreData(total - buf.len()));
    }

    let kind = first >> 4;
    let flags = first & 0x0F;
    let mut r = Reader::new(&buf[header..total]);

    let packet = match kind {
        1 => {
            if r.string()? != "MQTT" || r.u8()? != 4 {
                return Err(MqttError::Malformed("protocol"));
            }
            let cf = r.u8()?;
            if cf & 0x01 != 0 {
                return Err(MqttError::Malformed("connect flags"));
            }
            let keep_alive = r.u16()?;
            let client_id = r.string()?;
            let will = if cf & 0x04 != 0 {
                let qos = (cf >> 3) & 0x03;
                if qos > 2 {
                    return Err(MqttError::Malformed("will qos"));
                }
                Some(Will {
                    topic: r.string()?,
                    message: r.bin()?.to_vec(),
                    qos,
                    retain: cf & 0x20 != 0,
                })
            } else {
                None
            };
            let username = if cf & 0x80 != 0 {
                Some(r.string()?)
            } else {
                None
            };
            let password = if cf & 0x40 != 0 {
                Some(r.bin()?.to_vec())
            } else {
                None
            };
            Packet::Connect(Connect {
                client_id,
                clean_session: cf & 0x02 != 0,
                keep_alive,
                will,
                username,
                password,
            })
        }
        2 => Packet::Connack {
            session_present: r.u8()? & 0x01 != 0,
            code: ConnackCode::from_u8(r.u8()?)?,
        },
        3 => {
            let qos = (flags >> 1) & 0x03;
            if qos > 2 {
                return Err(MqttError::Malformed("publish qos"));
            }
            let topic = r.string()?;
            let packet_id = if qos > 0 { Some(r.u16()?) } else { None };
            Packet::Publish(Publish {
                dup: flags & 0x08 != 0,
                qos,
                retain: flags & 0x01 != 0,
                topic,
                packet_id,
                payload: r.rest().to_vec(),
            })
        }
        4 => Packet::Puback(r.u16()?),
        5 => Packet::Pubrec(r.u16()?),
        6 => Packet::Pubrel(r.u16()?),
        7 => Packet::Pubcomp(r.u16()?),
        8 => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while r.remaining() > 0 {
                let filter = r.string()?;
                filters.push((filter, r.u8()?));
            }
            if filters.is_empty() {
                return Err(MqttError::Malformed("empty subscribe"));
            }
            Packet::Subscribe { packet_id, filters }
        }
        9 => Packet::Suback {
            packet_id: r.u16()?,
            codes: r.rest().to_vec(),
        },
        10 => {
            let packet_id = r.u16()?;
            let mut filters = Vec::new();
            while r.remaining() > 0 {
                filters.push(r.string()?);
            }
            Packet::Unsubscribe { packet_id, filters }
        }
        11 => Packet::Unsuback(r.u16()?),
        12 => Packet::Pingreq,
        13 => Packet::Pingresp,
        14 => Packet::Disconnect,
        _ => return Err(MqttError::Malformed("packet type")),
    };
    r.finish()?;
    Ok((packet, total))
}
