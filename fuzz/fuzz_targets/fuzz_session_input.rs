// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use mqttsn_gateway::{GatewayConfig, Session, SessionDriver};

struct Sink;

impl SessionDriver for Sink {
    fn send_to_client(&mut self, _data: &[u8]) {}
    fn send_to_broker(&mut self, _data: &[u8]) {}
    fn program_tick(&mut self, _ms: u64) {}
    fn cancel_tick(&mut self) -> u64 {
        0
    }
    fn broker_reconnect_request(&mut self) {}
}

fuzz_target!(|data: &[u8]| {
    // Chunks prefixed by a direction byte: even = client, odd = broker,
    // 0xFF = link up, 0xFE = timer.
    let mut session = Session::new(Arc::new(GatewayConfig::default()), Sink);
    let mut rest = data;
    while let Some((&tag, tail)) = rest.split_first() {
        let (len, tail) = match tail.split_first() {
            Some((&len, tail)) => (usize::from(len).min(tail.len()), tail),
            None => break,
        };
        let (chunk, tail) = tail.split_at(len);
        match tag {
            0xFF => session.broker_connected(true),
            0xFE => session.tick(),
            t if t % 2 == 0 => {
                session.data_from_client(chunk);
            }
            _ => {
                session.data_from_broker(chunk);
            }
        }
        rest = tail;
    }
});
