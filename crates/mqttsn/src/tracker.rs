// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retry/ack tracker for confirmable exchanges.
//!
//! Each in-flight request is stored with its encoded bytes. When its deadline
//! passes the tracker hands the identical bytes back for retransmission until
//! the retry budget runs out, then reports the operation as timed out.
//!
//! ```text
//! submit ──> [pending] ──ack──> complete()  -> removed
//!               │
//!            deadline
//!               ├─ retries_left > 0 -> Retransmit, deadline += period
//!               └─ retries_left = 0 -> TimedOut,   removed
//! ```
//!
//! The tracker owns its clock: `tick(elapsed_ms)` advances it and every
//! deadline is relative to that clock. Keys are message IDs or any other
//! `Ord + Copy` correlation value; at most one operation exists per key.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::error::{Error, Result};

/// One confirmable request awaiting its acknowledgment.
#[derive(Debug)]
pub struct PendingOperation<K, C> {
    pub key: K,
    /// Encoded frame, resent verbatim.
    pub request: Vec<u8>,
    pub broadcast: bool,
    pub retries_left: u32,
    pub deadline_ms: u64,
    /// Owner data carried to completion (callback, original message, ...).
    pub context: C,
}

/// Result of advancing the tracker clock.
#[derive(Debug)]
pub enum TrackerEvent<K, C> {
    /// Deadline passed with retries left: send these bytes again.
    Retransmit {
        key: K,
        bytes: Vec<u8>,
        broadcast: bool,
    },
    /// Retry budget exhausted. The operation has been removed.
    TimedOut(PendingOperation<K, C>),
}

/// Retransmission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub period_ms: u64,
    pub count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            period_ms: 10_000,
            count: 3,
        }
    }
}

/// Tracker of in-flight confirmable operations.
#[derive(Debug)]
pub struct RetryTracker<K: Ord + Copy, C> {
    ops: BTreeMap<K, PendingOperation<K, C>>,
    policy: RetryPolicy,
    now_ms: u64,
}

impl<K: Ord + Copy + core::fmt::Debug, C> RetryTracker<K, C> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            ops: BTreeMap::new(),
            policy,
            now_ms: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Applies to operations submitted afterwards.
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Current tracker clock in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Start tracking a request that has just been sent.
    pub fn submit(&mut self, key: K, request: Vec<u8>, broadcast: bool, context: C) -> Result<()> {
        if self.ops.contains_key(&key) {
            return Err(Error::KeyInUse);
        }
        self.ops.insert(
            key,
            PendingOperation {
                key,
                request,
                broadcast,
                retries_left: self.policy.count,
                deadline_ms: self.now_ms + self.policy.period_ms,
                context,
            },
        );
        Ok(())
    }

    /// Replace the request of a pending operation with the next stage of the
    /// exchange (e.g. PUBLISH -> PUBREL). Retry budget and deadline restart.
    pub fn restage(&mut self, key: &K, request: Vec<u8>, broadcast: bool) -> Result<()> {
        let policy = self.policy;
        let now = self.now_ms;
        let op = self.ops.get_mut(key).ok_or(Error::InvalidParameter)?;
        op.request = request;
        op.broadcast = broadcast;
        op.retries_left = policy.count;
        op.deadline_ms = now + policy.period_ms;
        Ok(())
    }

    /// Matching acknowledgment arrived: stop tracking and hand the operation
    /// back. The key is reusable immediately.
    pub fn complete(&mut self, key: &K) -> Option<PendingOperation<K, C>> {
        self.ops.remove(key)
    }

    /// Abandon an operation without acknowledgment.
    pub fn cancel(&mut self, key: &K) -> Option<PendingOperation<K, C>> {
        let op = self.ops.remove(key);
        if op.is_some() {
            log::debug!("canceled pending operation {:?}", key);
        }
        op
    }

    pub fn get(&self, key: &K) -> Option<&PendingOperation<K, C>> {
        self.ops.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut PendingOperation<K, C>> {
        self.ops.get_mut(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.ops.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.ops.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation<K, C>> {
        self.ops.values()
    }

    /// Advance the clock and process every expired deadline, earliest first.
    pub fn tick(&mut self, elapsed_ms: u64) -> Vec<TrackerEvent<K, C>> {
        self.now_ms = self.now_ms.saturating_add(elapsed_ms);
        let now = self.now_ms;

        let mut due: Vec<(u64, K)> = self
            .ops
            .values()
            .filter(|op| op.deadline_ms <= now)
            .map(|op| (op.deadline_ms, op.key))
            .collect();
        due.sort();

        let mut events = Vec::with_capacity(due.len());
        for (_, key) in due {
            let Some(op) = self.ops.get_mut(&key) else {
                continue;
            };
            if op.retries_left > 0 {
                op.retries_left -= 1;
                op.deadline_ms = now + self.policy.period_ms;
                log::debug!(
                    "retransmitting {:?} ({} retries left)",
                    key,
                    op.retries_left
                );
                events.push(TrackerEvent::Retransmit {
                    key,
                    bytes: op.request.clone(),
                    broadcast: op.broadcast,
                });
            } else if let Some(op) = self.ops.remove(&key) {
                log::warn!("operation {:?} timed out", key);
                events.push(TrackerEvent::TimedOut(op));
            }
        }
        events
    }

    /// Milliseconds until the earliest deadline, or `None` when idle.
    pub fn next_timeout(&self) -> Option<u64> {
        self.ops
            .values()
            .map(|op| op.deadline_ms.saturating_sub(self.now_ms))
            .min()
    }

    /// Drop every pending operation (session teardown) and return them.
    pub fn clear(&mut self) -> Vec<PendingOperation<K, C>> {
        core::mem::take(&mut self.ops).into_values().collect()
    }
}

// ---------------------------------------------------------------------------
// Message ID allocation
// ---------------------------------------------------------------------------

/// Hands out non-zero message IDs in sequence, skipping any still in use.
#[derive(Debug, Clone)]
pub struct MsgIdAllocator {
    next: u16,
}

impl Default for MsgIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl MsgIdAllocator {
    /// Next ID for which `in_use` is false. Falls back to the plain sequence
    /// value if every ID is taken.
    pub fn alloc(&mut self, in_use: impl Fn(u16) -> bool) -> u16 {
        let first = self.bump();
        let mut id = first;
        loop {
            if !in_use(id) {
                return id;
            }
            id = self.bump();
            if id == first {
                return first;
            }
        }
    }

    fn bump(&mut self) -> u16 {
        let id = self.next;
        self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
        id
    }
}
