//! PIV key slots and the slot catalog
//!
//! The catalog is loaded once from configuration and never mutated. It decides
//! which hardware slots the agent exposes and how each slot's PIN is handled.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CatalogError;

/// One of the fixed PIV key locations an agent can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Slot {
    /// 9a: PIV authentication
    Authentication,
    /// 9c: digital signature
    Signature,
    /// 9d: key management
    KeyManagement,
    /// 9e: card authentication
    CardAuthentication,
}

impl Slot {
    /// Every slot, in the order tokens conventionally list them
    pub const ALL: [Slot; 4] = [
        Slot::Authentication,
        Slot::Signature,
        Slot::KeyManagement,
        Slot::CardAuthentication,
    ];

    /// Key reference byte used on the card
    pub fn key_reference(self) -> u8 {
        match self {
            Slot::Authentication => 0x9a,
            Slot::Signature => 0x9c,
            Slot::KeyManagement => 0x9d,
            Slot::CardAuthentication => 0x9e,
        }
    }

    /// Short hex name, e.g. "9a"
    pub fn name(self) -> &'static str {
        match self {
            Slot::Authentication => "9a",
            Slot::Signature => "9c",
            Slot::KeyManagement => "9d",
            Slot::CardAuthentication => "9e",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Slot {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "9a" | "authentication" => Ok(Slot::Authentication),
            "9c" | "signature" => Ok(Slot::Signature),
            "9d" | "key-management" | "key_management" => Ok(Slot::KeyManagement),
            "9e" | "card-authentication" | "card_authentication" => {
                Ok(Slot::CardAuthentication)
            }
            _ => Err(CatalogError::UnknownSlot(s.to_string())),
        }
    }
}

impl TryFrom<String> for Slot {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Slot> for String {
    fn from(slot: Slot) -> Self {
        slot.name().to_string()
    }
}

/// How often the agent asks for the PIN before using a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinPolicy {
    /// Defer to whatever the token enforces
    #[default]
    Unset,
    /// Prompt only when the token reports the PIN is required
    Once,
    /// Never prompt
    Never,
    /// Prompt before every signature
    Always,
}

impl PinPolicy {
    /// Whether a prompt must happen before the first signing attempt
    pub fn prompts_up_front(self) -> bool {
        matches!(self, PinPolicy::Always)
    }

    /// Whether a PIN-required response from the token may be answered with a prompt
    pub fn prompts_on_demand(self) -> bool {
        matches!(self, PinPolicy::Unset | PinPolicy::Once)
    }
}

/// A slot the agent exposes, with its PIN policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot: Slot,
    #[serde(default)]
    pub pin_policy: PinPolicy,
}

impl SlotConfig {
    pub fn new(slot: Slot, pin_policy: PinPolicy) -> Self {
        Self { slot, pin_policy }
    }
}

/// Validated, immutable table of exposed slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<SlotConfig>", into = "Vec<SlotConfig>")]
pub struct SlotCatalog {
    entries: Vec<SlotConfig>,
}

impl SlotCatalog {
    /// Build a catalog, rejecting empty tables and duplicate slots
    pub fn new(entries: Vec<SlotConfig>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }

        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|seen| seen.slot == entry.slot) {
                return Err(CatalogError::DuplicateSlot(entry.slot));
            }
        }

        Ok(Self { entries })
    }

    /// Iterate entries in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &SlotConfig> {
        self.entries.iter()
    }

    /// Look up a slot's configuration
    pub fn get(&self, slot: Slot) -> Option<&SlotConfig> {
        self.entries.iter().find(|entry| entry.slot == slot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SlotCatalog {
    fn default() -> Self {
        Self {
            entries: vec![SlotConfig::new(Slot::Authentication, PinPolicy::Unset)],
        }
    }
}

impl TryFrom<Vec<SlotConfig>> for SlotCatalog {
    type Error = CatalogError;

    fn try_from(entries: Vec<SlotConfig>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<SlotCatalog> for Vec<SlotConfig> {
    fn from(catalog: SlotCatalog) -> Self {
        catalog.entries
    }
}
