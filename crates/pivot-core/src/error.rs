//! Error types for the Pivot agent

use std::fmt;
use thiserror::Error;

use crate::slot::Slot;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by agent operations
#[derive(Debug, Error)]
pub enum Error {
    /// No matching token could be found or opened
    #[error("could not reach device: {0}")]
    DeviceUnavailable(String),

    /// A token that was in use stopped answering
    #[error("device #{serial} was lost: {reason}")]
    DeviceLost { serial: u32, reason: String },

    /// A slot holds a key this agent cannot expose over SSH
    #[error("slot {slot} holds an unsupported key type: {algorithm}")]
    UnsupportedKeyType { slot: Slot, algorithm: String },

    /// Every configured slot failed to produce a signer
    #[error("no valid signer available: {0}")]
    NoValidSigner(SlotFailures),

    /// The requested public key is not held by any current signer
    #[error("no private keys match the requested public key")]
    NoMatchingKey,

    /// The negotiated signature algorithm cannot be encoded
    #[error("signature algorithm {0} is not supported, request rsa-sha2-256 or rsa-sha2-512")]
    UnsupportedAlgorithm(String),

    /// Mutating requests are rejected
    #[error("operation unsupported")]
    OperationUnsupported,

    /// Protocol extensions are rejected
    #[error("extension unsupported")]
    ExtensionUnsupported,

    /// Hardware failure, passed through with context
    #[error("{context}: {source}")]
    Device {
        context: String,
        #[source]
        source: DeviceError,
    },

    /// PIN prompt failure
    #[error("PIN prompt failed: {0}")]
    Pin(#[from] PinError),

    /// Signature could not be prepared or encoded
    #[error("signature encoding failed: {0}")]
    Encoding(String),

    /// Worker task failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a hardware error with context
    pub fn device(context: impl Into<String>, source: DeviceError) -> Self {
        Error::Device {
            context: context.into(),
            source,
        }
    }
}

/// Failures reported by a token, never reinterpreted by the agent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The slot has no certificate or key
    #[error("slot is empty")]
    SlotEmpty,

    /// The token refuses to sign until the PIN is verified
    #[error("PIN verification required")]
    PinRequired,

    /// The PIN was rejected
    #[error("wrong PIN ({retries} tries remaining)")]
    WrongPin { retries: u8 },

    /// Too many wrong PINs
    #[error("PIN is blocked")]
    PinLocked,

    /// The slot's key cannot be represented as an SSH key
    #[error("unsupported key algorithm: {0}")]
    UnsupportedKey(String),

    /// The token answered with data that could not be parsed
    #[error("malformed token data: {0}")]
    Malformed(String),

    /// Reader, card or PC/SC failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors from the PIN broker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("PIN entry cancelled")]
    Cancelled,

    #[error("invalid PIN: {0}")]
    Invalid(String),

    #[error("PIN prompt unavailable: {0}")]
    Unavailable(String),
}

/// Slot catalog validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unknown slot: {0}")]
    UnknownSlot(String),

    #[error("slot {0} is configured more than once")]
    DuplicateSlot(Slot),

    #[error("at least one slot must be configured")]
    Empty,
}

/// Why one slot of one token could not produce a signer
#[derive(Debug)]
pub struct SlotFailure {
    pub serial: u32,
    pub slot: Slot,
    pub error: Error,
}

/// Per-slot causes carried by [`Error::NoValidSigner`]
#[derive(Debug, Default)]
pub struct SlotFailures(pub Vec<SlotFailure>);

impl SlotFailures {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlotFailure> {
        self.0.iter()
    }
}

impl fmt::Display for SlotFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no slots attempted");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(
                f,
                "#{} slot {}: {}",
                failure.serial, failure.slot, failure.error
            )?;
        }
        Ok(())
    }
}
