//! Signers bound to one slot of one open token
//!
//! A signer lives for a single agent request: it is built from the session
//! that is about to use it and discarded with the request.

use std::sync::Arc;
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, Signature};
use tracing::{debug, info};

use pivot_core::{
    encode_signature, signing_input, DeviceError, Error, KeyAlgorithm, PinBroker, PinPolicy,
    Result, Slot,
};

use crate::device::DeviceSession;
use crate::watchdog::ArmedWatchdog;

/// Private key handle for one slot
pub struct Signer {
    serial: u32,
    slot: Slot,
    key: KeyData,
    algorithm: KeyAlgorithm,
    pin_policy: PinPolicy,
    broker: Arc<dyn PinBroker>,
}

impl Signer {
    /// Read `slot`'s public key and check it can be used over SSH
    pub fn build(
        device: &mut dyn DeviceSession,
        serial: u32,
        slot: Slot,
        pin_policy: PinPolicy,
        broker: Arc<dyn PinBroker>,
    ) -> Result<Self> {
        let key = device.public_key(slot).map_err(|e| match e {
            DeviceError::UnsupportedKey(algorithm) => Error::UnsupportedKeyType { slot, algorithm },
            other => device_error(serial, "could not get public key", other),
        })?;

        let algorithm =
            KeyAlgorithm::from_key_data(&key).ok_or_else(|| Error::UnsupportedKeyType {
                slot,
                algorithm: key.algorithm().to_string(),
            })?;

        Ok(Self {
            serial,
            slot,
            key,
            algorithm,
            pin_policy,
            broker,
        })
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn public_key(&self) -> &KeyData {
        &self.key
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Sign `data` with `algorithm` on `device`
    ///
    /// `watchdog` is paused while a PIN prompt is open. A wrong PIN is
    /// returned to the caller, never retried.
    pub fn sign(
        &self,
        device: &mut dyn DeviceSession,
        watchdog: &mut ArmedWatchdog,
        data: &[u8],
        algorithm: Algorithm,
    ) -> Result<Signature> {
        let input = signing_input(&self.algorithm, &algorithm, data)?;

        if self.pin_policy.prompts_up_front() {
            self.unlock(device, watchdog)?;
        }

        let raw = match device.sign_raw(self.slot, self.algorithm, &input) {
            Err(DeviceError::PinRequired) if self.pin_policy.prompts_on_demand() => {
                debug!(serial = self.serial, slot = %self.slot, "Token asked for the PIN");
                self.unlock(device, watchdog)?;
                device.sign_raw(self.slot, self.algorithm, &input)
            }
            other => other,
        }
        .map_err(|e| device_error(self.serial, "failed to sign", e))?;

        encode_signature(&self.algorithm, algorithm, &raw)
    }

    fn unlock(&self, device: &mut dyn DeviceSession, watchdog: &mut ArmedWatchdog) -> Result<()> {
        // Some tokens refuse the retry query while the PIN cache is warm
        let retries = device.pin_retries().unwrap_or_else(|e| {
            debug!(serial = self.serial, "Could not read PIN retries: {}", e);
            0
        });

        let pin = {
            let _paused = watchdog.pause();
            self.broker.prompt(self.serial, retries)?
        };

        device
            .verify_pin(&pin)
            .map_err(|e| device_error(self.serial, "failed to verify PIN", e))?;
        info!(serial = self.serial, slot = %self.slot, "PIN verified");
        Ok(())
    }
}

/// Wrap a hardware failure, treating transport failures as a lost token
pub(crate) fn device_error(serial: u32, context: &str, error: DeviceError) -> Error {
    match error {
        DeviceError::Transport(reason) => Error::DeviceLost { serial, reason },
        other => Error::device(context, other),
    }
}
