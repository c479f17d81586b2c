// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host integration boundary
//!
//! The protocol engines never own a socket or a timer. The hosting firmware
//! or process implements [`Driver`] and feeds received bytes and timer
//! expirations back through `process_data`/`tick`.

/// Transport and timer hooks supplied by the host.
pub trait Driver {
    /// Send one encoded frame. `broadcast` selects the broadcast address
    /// (ADVERTISE, SEARCHGW, GWINFO) instead of the current peer.
    fn send_data(&mut self, data: &[u8], broadcast: bool);

    /// Request a single `tick()` call after `ms` milliseconds, replacing any
    /// earlier request.
    fn program_tick(&mut self, ms: u64);

    /// Cancel the pending tick request and return the milliseconds that were
    /// still left on it (0 if it already fired or none was programmed).
    fn cancel_tick(&mut self) -> u64;
}

/// Driver that discards everything. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct NullDriver;

impl Driver for NullDriver {
    fn send_data(&mut self, _data: &[u8], _broadcast: bool) {}

    fn program_tick(&mut self, _ms: u64) {}

    fn cancel_tick(&mut self) -> u64 {
        0
    }
}

/// Converts the program/cancel timer pair into elapsed time.
///
/// On entry `elapsed()` cancels the outstanding request and reports how much
/// of it ran; on exit `program()` arms the next deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickClock {
    programmed_ms: u64,
}

impl TickClock {
    pub fn elapsed<D: Driver + ?Sized>(&mut self, driver: &mut D) -> u64 {
        if self.programmed_ms == 0 {
            return 0;
        }
        let remaining = driver.cancel_tick().min(self.programmed_ms);
        let elapsed = self.programmed_ms - remaining;
        self.programmed_ms = 0;
        elapsed
    }

    pub fn program<D: Driver + ?Sized>(&mut self, driver: &mut D, ms: Option<u64>) {
        if let Some(ms) = ms {
            // A zero request would never count as elapsed time.
            let ms = ms.max(1);
            self.programmed_ms = ms;
            driver.program_tick(ms);
        }
    }
}
