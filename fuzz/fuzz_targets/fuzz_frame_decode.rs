// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use libfuzzer_sys::fuzz_target;
use mqttsn::{decode, encode, peek_frame};

fuzz_target!(|data: &[u8]| {
    // Length prefix alone
    let _ = peek_frame(data);

    // Full decode; anything accepted must encode again
    if let Ok((msg, used)) = decode(data) {
        assert!(used <= data.len());
        let _ = encode(&msg);
    }
});
