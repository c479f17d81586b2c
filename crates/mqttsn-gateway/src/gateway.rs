// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway front end: discovery, session table and dispatch by client
//! address.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mqttsn::{frame, Driver, Error, Message};

use crate::advertiser::Advertiser;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::session::{OutboundMessage, Session, SessionDriver, SessionState};

/// Builds the per-session driver for a newly connecting client address.
pub type DriverFactory<A, D> = Box<dyn FnMut(&A) -> D>;

/// MQTT-SN gateway.
///
/// `A` is the transport address of a client, `P` the broadcast/advertise
/// driver and `D` the per-session driver.
pub struct Gateway<A, P, D>
where
    A: Ord + Clone + fmt::Debug,
    P: Driver,
    D: SessionDriver,
{
    config: Arc<GatewayConfig>,
    advertiser: Advertiser<P>,
    sessions: BTreeMap<A, Session<D>>,
    factory: DriverFactory<A, D>,
}

impl<A, P, D> Gateway<A, P, D>
where
    A: Ord + Clone + fmt::Debug,
    P: Driver,
    D: SessionDriver,
{
    pub fn new(
        config: GatewayConfig,
        broadcast: P,
        factory: impl FnMut(&A) -> D + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let advertiser = Advertiser::new(config.gateway_id, config.advertise_period_secs, broadcast);
        Ok(Self {
            config: Arc::new(config),
            advertiser,
            sessions: BTreeMap::new(),
            factory: Box::new(factory),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Start advertising.
    pub fn start(&mut self) -> Result<()> {
        log::info!(
            "MQTT-SN gateway {} starting (broker {}:{})",
            self.config.gateway_id,
            self.config.broker.host,
            self.config.broker.port
        );
        self.advertiser.start()
    }

    /// Stop advertising and close every session.
    pub fn stop(&mut self) {
        self.advertiser.stop();
        for session in self.sessions.values_mut() {
            session.terminate();
        }
        self.sessions.clear();
    }

    /// Timer expiry of the broadcast driver.
    pub fn advertise_tick(&mut self) -> Result<()> {
        self.advertiser.tick()
    }

    pub fn advertiser(&self) -> &Advertiser<P> {
        &self.advertiser
    }

    pub fn advertiser_mut(&mut self) -> &mut Advertiser<P> {
        &mut self.advertiser
    }

    /// Datagram from a client address. Returns the bytes consumed.
    pub fn data_from_client(&mut self, addr: &A, data: &[u8]) -> usize {
        let (msg, used) = match frame::decode(data) {
            Ok(decoded) => decoded,
            Err(Error::NeedMoreData(_)) => return 0,
            Err(e) => {
                log::warn!("dropping frame from {:?}: {}", addr, e);
                return frame::peek_frame(data)
                    .map(|(_, total)| total.min(data.len()))
                    .unwrap_or(data.len());
            }
        };

        match msg {
            Message::SearchGw { radius } => {
                log::debug!("SEARCHGW from {:?} (radius {})", addr, radius);
                self.answer_search();
                used
            }
            Message::Advertise { .. } | Message::GwInfo { .. } => used,
            msg => {
                if let Some(session) = self.sessions.get_mut(addr) {
                    let used = session.data_from_client(data);
                    self.reap();
                    return used;
                }
                let Message::Connect { client_id, .. } = &msg else {
                    log::debug!("no session for {:?}, dropping {:?}", addr, msg.msg_type());
                    return used;
                };
                self.take_over(client_id, addr);
                let driver = (self.factory)(addr);
                let mut session = Session::new(Arc::clone(&self.config), driver);
                let used = session.data_from_client(data);
                log::debug!("new session for {:?}", addr);
                self.sessions.insert(addr.clone(), session);
                self.reap();
                used
            }
        }
    }

    /// Bytes from the broker connection of `addr`'s session.
    pub fn data_from_broker(&mut self, addr: &A, data: &[u8]) -> usize {
        let used = match self.sessions.get_mut(addr) {
            Some(session) => session.data_from_broker(data),
            None => data.len(),
        };
        self.reap();
        used
    }

    /// Broker link status for `addr`'s session.
    pub fn broker_connected(&mut self, addr: &A, up: bool) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.broker_connected(up);
        }
        self.reap();
    }

    /// Timer expiry of `addr`'s session driver.
    pub fn session_tick(&mut self, addr: &A) {
        if let Some(session) = self.sessions.get_mut(addr) {
            session.tick();
        }
        self.reap();
    }

    /// Queue a message for the client at `addr`.
    pub fn enqueue(&mut self, addr: &A, msg: OutboundMessage) -> Result<Option<OutboundMessage>> {
        let session = self
            .sessions
            .get_mut(addr)
            .ok_or(GatewayError::SessionClosed)?;
        Ok(session.enqueue(msg))
    }

    /// Close the session at `addr`.
    pub fn terminate(&mut self, addr: &A) {
        if let Some(mut session) = self.sessions.remove(addr) {
            session.terminate();
        }
    }

    pub fn session(&self, addr: &A) -> Option<&Session<D>> {
        self.sessions.get(addr)
    }

    pub fn session_mut(&mut self, addr: &A) -> Option<&mut Session<D>> {
        self.sessions.get_mut(addr)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&A, &Session<D>)> {
        self.sessions.iter()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn answer_search(&mut self) {
        let gwinfo = Message::GwInfo {
            gw_id: self.advertiser.gateway_id(),
            gw_addr: Vec::new(),
        };
        match frame::encode(&gwinfo) {
            Ok(bytes) => self.advertiser.driver_mut().send_data(&bytes, true),
            Err(e) => log::warn!("cannot encode GWINFO: {}", e),
        }
    }

    /// A client ID lives in one session only; a CONNECT from a new address
    /// closes the old one.
    fn take_over(&mut self, client_id: &str, addr: &A) {
        if client_id.is_empty() {
            return;
        }
        let stale: Vec<A> = self
            .sessions
            .iter()
            .filter(|(a, s)| *a != addr && s.client_id() == client_id)
            .map(|(a, _)| a.clone())
            .collect();
        for old in stale {
            if let Some(mut session) = self.sessions.remove(&old) {
                log::info!("client '{}' moved from {:?} to {:?}", client_id, old, addr);
                session.terminate();
            }
        }
    }

    fn reap(&mut self) {
        self.sessions
            .retain(|_, s| s.state() != SessionState::Disconnected);
    }
}

impl<A, P, D> fmt::Debug for Gateway<A, P, D>
where
    A: Ord + Clone + fmt::Debug,
    P: Driver + fmt::Debug,
    D: SessionDriver,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("gateway_id", &self.config.gateway_id)
            .field("advertiser", &self.advertiser)
            .field("sessions", &self.sessions)
            .finish()
    }
}
