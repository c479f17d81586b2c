// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic registry
//!
//! Maps 16-bit topic IDs to topic names for one session. Three classes:
//! predefined (seeded from configuration, never reassigned), registered
//! (allocated on demand from a configurable range) and short names (two
//! characters carried inline, never stored).

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};

use crate::error::{Error, Result};
use crate::message::TopicRef;

/// Reserved: "no topic" in REGISTER/SUBACK.
pub const TOPIC_ID_NONE: u16 = 0x0000;
/// Reserved.
pub const TOPIC_ID_RESERVED: u16 = 0xFFFF;

/// Origin of a topic ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    Predefined,
    Registered,
    ShortName,
}

/// One topic mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEntry {
    pub topic_id: u16,
    pub name: String,
    pub class: TopicClass,
}

/// Per-session topic table.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    by_id: BTreeMap<u16, TopicEntry>,
    by_name: BTreeMap<String, u16>,
    range_min: u16,
    range_max: u16,
    /// Next candidate for dynamic allocation.
    cursor: u16,
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRegistry {
    /// Empty registry allocating from the full `1..=0xFFFE` range.
    pub fn new() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_name: BTreeMap::new(),
            range_min: 1,
            range_max: TOPIC_ID_RESERVED - 1,
            cursor: 1,
        }
    }

    /// Restrict dynamic allocation to `min..=max`.
    pub fn alloc_range(&mut self, min: u16, max: u16) -> Result<()> {
        if min == TOPIC_ID_NONE || max == TOPIC_ID_RESERVED || min > max {
            return Err(Error::InvalidParameter);
        }
        self.range_min = min;
        self.range_max = max;
        self.cursor = min;
        Ok(())
    }

    /// Seed a predefined topic. Re-adding the identical mapping is a no-op.
    pub fn add_predefined(&mut self, name: &str, topic_id: u16) -> Result<()> {
        if topic_id == TOPIC_ID_NONE || topic_id == TOPIC_ID_RESERVED || name.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if let Some(existing) = self.by_id.get(&topic_id) {
            return if existing.name == name && existing.class == TopicClass::Predefined {
                Ok(())
            } else {
                Err(Error::InvalidParameter)
            };
        }
        if self.by_name.contains_key(name) {
            return Err(Error::InvalidParameter);
        }
        self.insert(topic_id, name, TopicClass::Predefined);
        Ok(())
    }

    /// Return the ID for `name`, allocating one if it is unknown.
    ///
    /// Allocation walks the range upwards from the last assigned ID, wrapping
    /// once, and skips every ID already in use.
    pub fn register_dynamic(&mut self, name: &str) -> Result<u16> {
        if name.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }

        let span = (self.range_max - self.range_min) as u32 + 1;
        let mut candidate = self.cursor;
        for _ in 0..span {
            if !self.by_id.contains_key(&candidate) {
                self.insert(candidate, name, TopicClass::Registered);
                self.cursor = self.step(candidate);
                log::debug!("registered topic '{}' as {}", name, candidate);
                return Ok(candidate);
            }
            candidate = self.step(candidate);
        }
        Err(Error::TableFull)
    }

    fn step(&self, id: u16) -> u16 {
        if id >= self.range_max {
            self.range_min
        } else {
            id + 1
        }
    }

    fn insert(&mut self, topic_id: u16, name: &str, class: TopicClass) {
        self.by_name.insert(name.to_string(), topic_id);
        self.by_id.insert(
            topic_id,
            TopicEntry {
                topic_id,
                name: name.to_string(),
                class,
            },
        );
    }

    /// Record an ID chosen by the peer (REGISTER from a gateway, SUBACK).
    ///
    /// A stale registered mapping for either the name or the ID is replaced.
    /// Predefined IDs cannot be overridden.
    pub fn assign(&mut self, name: &str, topic_id: u16) -> Result<()> {
        if topic_id == TOPIC_ID_NONE || topic_id == TOPIC_ID_RESERVED || name.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if let Some(existing) = self.by_id.get(&topic_id) {
            if existing.class == TopicClass::Predefined {
                return if existing.name == name {
                    Ok(())
                } else {
                    Err(Error::InvalidParameter)
                };
            }
        }
        if let Some(old) = self.by_name.get(name).copied() {
            if self.by_id.get(&old).map(|e| e.class) == Some(TopicClass::Predefined) {
                return Err(Error::InvalidParameter);
            }
            self.by_id.remove(&old);
        }
        if let Some(stale) = self.by_id.remove(&topic_id) {
            self.by_name.remove(&stale.name);
        }
        self.insert(topic_id, name, TopicClass::Registered);
        Ok(())
    }

    pub fn lookup_by_id(&self, topic_id: u16) -> Option<&TopicEntry> {
        self.by_id.get(&topic_id)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&TopicEntry> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    /// Resolve the topic field of a PUBLISH to a topic name.
    pub fn resolve(&self, topic: &TopicRef) -> Result<String> {
        let (id, class) = match topic {
            TopicRef::Short(raw) => {
                return core::str::from_utf8(raw)
                    .map(String::from)
                    .map_err(|_| Error::InvalidTopicId(topic.raw()));
            }
            TopicRef::Normal(id) => (*id, TopicClass::Registered),
            TopicRef::Predefined(id) => (*id, TopicClass::Predefined),
        };
        match self.by_id.get(&id) {
            Some(e) if e.class == class => Ok(e.name.clone()),
            _ => Err(Error::InvalidTopicId(id)),
        }
    }

    /// Pick the PUBLISH topic field for `name` without allocating.
    ///
    /// Two-byte names always use the short form.
    pub fn topic_ref_for(&self, name: &str) -> Option<TopicRef> {
        if let Ok(raw) = <[u8; 2]>::try_from(name.as_bytes()) {
            return Some(TopicRef::Short(raw));
        }
        self.lookup_by_name(name).map(|e| match e.class {
            TopicClass::Predefined => TopicRef::Predefined(e.topic_id),
            _ => TopicRef::Normal(e.topic_id),
        })
    }

    /// Drop a registered mapping. Predefined entries are never removed.
    pub fn remove(&mut self, topic_id: u16) -> Option<TopicEntry> {
        match self.by_id.get(&topic_id) {
            Some(e) if e.class == TopicClass::Registered => {}
            _ => return None,
        }
        let entry = self.by_id.remove(&topic_id)?;
        self.by_name.remove(&entry.name);
        Some(entry)
    }

    /// Drop every registered mapping, keeping predefined ones.
    pub fn clear_registered(&mut self) {
        self.by_id.retain(|_, e| e.class != TopicClass::Registered);
        let by_id = &self.by_id;
        self.by_name.retain(|_, id| by_id.contains_key(id));
        self.cursor = self.range_min;
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicEntry> {
        self.by_id.values()
    }
}
