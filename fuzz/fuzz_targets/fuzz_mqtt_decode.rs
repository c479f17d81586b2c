// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use libfuzzer_sys::fuzz_target;
use mqttsn_gateway::mqtt::{decode, encode};

fuzz_target!(|data: &[u8]| {
    // Walk a broker stream packet by packet
    let mut rest = data;
    while let Ok((packet, used)) = decode(rest) {
        assert!(used > 0 && used <= rest.len());
        let _ = encode(&packet);
        rest = &rest[used..];
    }
});
