//! Hardware token abstraction
//!
//! A [`TokenBackend`] enumerates readers and opens them. Every opened token
//! is a [`DeviceSession`] holding the exclusive transaction; dropping or
//! closing it releases the token for other applications.
//!
//! All calls block on the hardware and are only made while the registry
//! lock is held.

use ssh_key::public::KeyData;

use pivot_core::{DeviceError, KeyAlgorithm, Pin, Slot};

#[cfg(any(test, feature = "fake-device"))]
pub mod fake;

#[cfg(feature = "yubikey")]
pub mod yubikey;

/// RSA modulus lengths in bytes (RSA-1024 and RSA-2048) tokens sign with
pub const RSA_MODULUS_LENS: [usize; 2] = [128, 256];

/// Refuse RSA keys the token cannot sign with before they become signers
pub fn check_rsa_modulus(modulus_len: usize) -> Result<(), DeviceError> {
    if RSA_MODULUS_LENS.contains(&modulus_len) {
        Ok(())
    } else {
        Err(DeviceError::UnsupportedKey(format!(
            "RSA-{}",
            modulus_len * 8
        )))
    }
}

/// An attached reader that may hold a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    /// Reader name as reported by the platform
    pub reader: String,
}

/// Source of token sessions
pub trait TokenBackend: Send {
    /// List attached readers
    fn cards(&mut self) -> Result<Vec<CardInfo>, DeviceError>;

    /// Open an exclusive session with the token in `card`
    fn open(&mut self, card: &CardInfo) -> Result<Box<dyn DeviceSession>, DeviceError>;
}

/// One open exclusive transaction with a token
pub trait DeviceSession: Send {
    /// Reader the session was opened on
    fn reader(&self) -> &str;

    /// Product name used in key comments
    fn model(&self) -> &str;

    /// Query the serial number
    ///
    /// On some firmware this switches applications and drops the PIN cache,
    /// so callers query it once per session and keep the answer.
    fn serial(&mut self) -> Result<u32, DeviceError>;

    /// Side-effect-free health check
    ///
    /// Must not touch the PIN state and must succeed whether or not the PIN
    /// has been verified.
    fn probe(&mut self) -> Result<(), DeviceError>;

    /// Public key held in `slot`
    ///
    /// Keys the token cannot sign with are reported as
    /// [`DeviceError::UnsupportedKey`].
    fn public_key(&mut self, slot: Slot) -> Result<KeyData, DeviceError>;

    /// Remaining PIN attempts
    fn pin_retries(&mut self) -> Result<u8, DeviceError>;

    /// Verify the PIN, unlocking the session's PIN cache
    fn verify_pin(&mut self, pin: &Pin) -> Result<(), DeviceError>;

    /// Sign prepared input with the key in `slot`
    ///
    /// ECDSA input is a digest and the answer is DER; RSA input is a full
    /// PKCS#1 v1.5 block and the answer is the raw signature.
    fn sign_raw(
        &mut self,
        slot: Slot,
        algorithm: KeyAlgorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, DeviceError>;

    /// Whether the token keeps a verified PIN after the session closes
    fn pin_cache_survives_close(&self) -> bool {
        false
    }

    /// Release the exclusive transaction
    fn close(self: Box<Self>) -> Result<(), DeviceError>;
}
