//! Device registry
//!
//! Owns every open token session, keyed by serial number. Before each agent
//! operation [`DeviceRegistry::ensure`] probes the sessions it holds, drops
//! the ones that stopped answering and discovers tokens according to the
//! configured [`DeviceSelector`].
//!
//! The registry is not internally synchronized: the agent keeps it behind a
//! single lock so only one operation touches hardware at a time.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use pivot_core::{Error, Result};

use crate::config::{DeviceSelector, ReleasePolicy};
use crate::device::{CardInfo, DeviceSession, TokenBackend};

/// An open session and the identity read when it was opened
pub struct TokenSession {
    serial: u32,
    reader: String,
    device: Box<dyn DeviceSession>,
}

impl TokenSession {
    /// Serial number, read once when the session was opened
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn model(&self) -> &str {
        self.device.model()
    }

    pub fn device(&mut self) -> &mut dyn DeviceSession {
        self.device.as_mut()
    }

    fn close(self) {
        let serial = self.serial;
        if let Err(e) = self.device.close() {
            warn!(serial, "Failed to close token session: {}", e);
        }
    }
}

/// Live token sessions plus the policy used to find new ones
pub struct DeviceRegistry {
    backend: Box<dyn TokenBackend>,
    selector: DeviceSelector,
    release: ReleasePolicy,
    sessions: BTreeMap<u32, TokenSession>,
}

impl DeviceRegistry {
    pub fn new(
        backend: Box<dyn TokenBackend>,
        selector: DeviceSelector,
        release: ReleasePolicy,
    ) -> Self {
        Self {
            backend,
            selector,
            release,
            sessions: BTreeMap::new(),
        }
    }

    pub fn selector(&self) -> DeviceSelector {
        self.selector
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Make sure at least one healthy session matching the selector is open
    pub fn ensure(&mut self) -> Result<()> {
        self.drop_unhealthy();

        let wants_more = match self.selector {
            DeviceSelector::All => true,
            DeviceSelector::First | DeviceSelector::Serial(_) => self.sessions.is_empty(),
        };
        if wants_more {
            self.discover()?;
        }

        if self.sessions.is_empty() {
            return Err(Error::DeviceUnavailable(match self.selector {
                DeviceSelector::Serial(serial) => {
                    format!("no PIV token with serial number {} detected", serial)
                }
                _ => "no PIV token detected".to_string(),
            }));
        }
        Ok(())
    }

    fn drop_unhealthy(&mut self) {
        let mut lost = Vec::new();
        for (serial, session) in self.sessions.iter_mut() {
            if let Err(e) = session.device.probe() {
                info!(serial = *serial, "Token stopped answering, reconnecting: {}", e);
                lost.push(*serial);
            }
        }
        for serial in lost {
            if let Some(session) = self.sessions.remove(&serial) {
                session.close();
            }
        }
    }

    fn discover(&mut self) -> Result<()> {
        let cards = self
            .backend
            .cards()
            .map_err(|e| Error::DeviceUnavailable(format!("could not list readers: {}", e)))?;

        for card in cards {
            if self.sessions.values().any(|s| s.reader == card.reader) {
                continue;
            }
            let Some(session) = self.open(&card) else {
                continue;
            };

            if let DeviceSelector::Serial(wanted) = self.selector {
                if session.serial != wanted {
                    debug!(serial = session.serial, "Skipping token with other serial");
                    session.close();
                    continue;
                }
            }

            info!(
                serial = session.serial,
                reader = %session.reader,
                "Connected to {}",
                session.device.model()
            );
            self.sessions.insert(session.serial, session);

            if self.selector != DeviceSelector::All {
                break;
            }
        }
        Ok(())
    }

    /// Open `card` and read its serial, skipping anything that is not a token
    fn open(&mut self, card: &CardInfo) -> Option<TokenSession> {
        let mut device = match self.backend.open(card) {
            Ok(device) => device,
            Err(e) => {
                debug!(reader = %card.reader, "Skipping reader: {}", e);
                return None;
            }
        };

        // Queried exactly once: asking again later can drop the PIN cache
        match device.serial() {
            Ok(serial) => Some(TokenSession {
                serial,
                reader: card.reader.clone(),
                device,
            }),
            Err(e) => {
                debug!(reader = %card.reader, "Skipping token without serial: {}", e);
                if let Err(e) = device.close() {
                    debug!(reader = %card.reader, "Failed to close skipped reader: {}", e);
                }
                None
            }
        }
    }

    /// Live sessions in serial order
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut TokenSession> {
        self.sessions.values_mut()
    }

    pub fn session_mut(&mut self, serial: u32) -> Option<&mut TokenSession> {
        self.sessions.get_mut(&serial)
    }

    /// Close every session; safe to call with nothing open
    pub fn close(&mut self) {
        for (serial, session) in std::mem::take(&mut self.sessions) {
            info!(serial, "Closing token session");
            session.close();
        }
    }

    /// Close sessions that need not stay open between operations
    pub fn release_idle(&mut self) {
        let releasable: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, session)| match self.release {
                ReleasePolicy::Always => true,
                ReleasePolicy::Auto => session.device.pin_cache_survives_close(),
                ReleasePolicy::Never => false,
            })
            .map(|(serial, _)| *serial)
            .collect();

        for serial in releasable {
            if let Some(session) = self.sessions.remove(&serial) {
                debug!(serial, "Releasing token between operations");
                session.close();
            }
        }
    }
}
