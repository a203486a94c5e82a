//! Pivot Core - Shared types for the PIV-backed SSH agent
//!
//! This crate provides the hardware-independent building blocks of the agent:
//! the slot catalog, PIN handling contracts, key algorithm classification and
//! negotiation, signature encoding, and the error taxonomy.

pub mod error;
pub mod key;
pub mod pin;
pub mod signature;
pub mod slot;

pub use error::{CatalogError, DeviceError, Error, PinError, Result, SlotFailure, SlotFailures};
pub use key::{key_blob, key_comment, KeyAlgorithm, KeyRecord, SignatureFlags};
pub use pin::{Pin, PinBroker, MAX_PIN_LEN};
pub use signature::{encode_signature, ensure_encodable, signing_input};
pub use slot::{PinPolicy, Slot, SlotCatalog, SlotConfig};

/// Message shown while a signature waits for the user to touch the token
pub const TOUCH_PROMPT: &str = "Waiting for touch on your PIV token...";
