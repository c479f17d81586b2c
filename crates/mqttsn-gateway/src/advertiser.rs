// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic ADVERTISE broadcaster.

use mqttsn::{frame, Driver, Message};

use crate::error::{GatewayError, Result};

/// Announces the gateway every `period_secs` seconds.
#[derive(Debug)]
pub struct Advertiser<D: Driver> {
    gateway_id: u8,
    period_secs: u16,
    running: bool,
    driver: D,
}

impl<D: Driver> Advertiser<D> {
    pub fn new(gateway_id: u8, period_secs: u16, driver: D) -> Self {
        Self {
            gateway_id,
            period_secs,
            running: false,
            driver,
        }
    }

    /// Send the first ADVERTISE and arm the period timer.
    pub fn start(&mut self) -> Result<()> {
        if self.period_secs == 0 {
            return Err(GatewayError::AdvertiseDisabled);
        }
        self.running = true;
        log::info!(
            "advertising gateway {} every {}s",
            self.gateway_id,
            self.period_secs
        );
        self.advertise()
    }

    /// Timer expiry. No-op while stopped.
    pub fn tick(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.advertise()
    }

    /// Stop advertising. An already programmed tick still arrives and is
    /// ignored.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn gateway_id(&self) -> u8 {
        self.gateway_id
    }

    pub fn period_secs(&self) -> u16 {
        self.period_secs
    }

    /// Takes effect on the next ADVERTISE.
    pub fn set_period(&mut self, secs: u16) {
        self.period_secs = secs;
    }

    /// Takes effect on the next ADVERTISE.
    pub fn set_gateway_id(&mut self, id: u8) {
        self.gateway_id = id;
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn advertise(&mut self) -> Result<()> {
        if self.period_secs == 0 {
            // Period cleared while running.
            self.running = false;
            return Err(GatewayError::AdvertiseDisabled);
        }
        let bytes = frame::encode(&Message::Advertise {
            gw_id: self.gateway_id,
            duration: self.period_secs,
        })?;
        log::trace!("ADVERTISE {:02x?}", bytes);
        self.driver.send_data(&bytes, true);
        self.driver.program_tick(u64::from(self.period_secs) * 1000);
        Ok(())
    }
}
