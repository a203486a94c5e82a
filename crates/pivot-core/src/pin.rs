//! PIN values and the PIN broker interface

use std::fmt;
use zeroize::Zeroizing;

use crate::error::PinError;

/// Maximum PIV PIN length in bytes
pub const MAX_PIN_LEN: usize = 8;

/// A PIN, wiped from memory on drop
#[derive(Clone)]
pub struct Pin(Zeroizing<String>);

impl Pin {
    /// Validate a PIN: 1 to 8 bytes
    pub fn new(value: impl Into<String>) -> Result<Self, PinError> {
        let value = Zeroizing::new(value.into());
        if value.is_empty() {
            return Err(PinError::Invalid("PIN is empty".to_string()));
        }
        if value.len() > MAX_PIN_LEN {
            return Err(PinError::Invalid(format!(
                "PIN is longer than {} bytes",
                MAX_PIN_LEN
            )));
        }
        Ok(Self(value))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

/// Source of PINs, typically an interactive prompt
///
/// Called with the token's serial number and the number of PIN attempts the
/// token has left. Implementations own every UI and caching concern.
pub trait PinBroker: Send + Sync {
    fn prompt(&self, serial: u32, retries: u8) -> Result<Pin, PinError>;
}
