//! Key algorithms, signature negotiation and public key records

use ssh_encoding::Encode;
use ssh_key::public::{EcdsaPublicKey, KeyData};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg};

use crate::error::{Error, Result};
use crate::slot::Slot;

/// The key algorithms a token slot may hold that this agent can bridge to SSH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA with the given modulus length in bytes
    Rsa { modulus_len: usize },
    /// ECDSA over NIST P-256
    EcP256,
}

impl KeyAlgorithm {
    /// Classify an SSH public key, returning `None` for anything unsupported
    pub fn from_key_data(key: &KeyData) -> Option<Self> {
        match key {
            KeyData::Rsa(rsa) => rsa.n.as_positive_bytes().map(|n| KeyAlgorithm::Rsa {
                modulus_len: n.len(),
            }),
            KeyData::Ecdsa(EcdsaPublicKey::NistP256(_)) => Some(KeyAlgorithm::EcP256),
            _ => None,
        }
    }

    /// The key's own signature algorithm, used when the client asks for nothing else
    pub fn native_algorithm(&self) -> Algorithm {
        match self {
            KeyAlgorithm::Rsa { .. } => Algorithm::Rsa { hash: None },
            KeyAlgorithm::EcP256 => Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        }
    }

    /// Pick the signature algorithm for a sign request
    ///
    /// Only RSA keys honour the hash flags. When both flags are set the
    /// SHA-256 variant wins.
    pub fn negotiate(&self, flags: SignatureFlags) -> Algorithm {
        match self {
            KeyAlgorithm::Rsa { .. } if flags.contains(SignatureFlags::RSA_SHA2_256) => {
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha256),
                }
            }
            KeyAlgorithm::Rsa { .. } if flags.contains(SignatureFlags::RSA_SHA2_512) => {
                Algorithm::Rsa {
                    hash: Some(HashAlg::Sha512),
                }
            }
            _ => self.native_algorithm(),
        }
    }
}

/// Flags carried by an agent sign request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureFlags(u32);

impl SignatureFlags {
    /// SSH_AGENT_RSA_SHA2_256
    pub const RSA_SHA2_256: SignatureFlags = SignatureFlags(0x02);
    /// SSH_AGENT_RSA_SHA2_512
    pub const RSA_SHA2_512: SignatureFlags = SignatureFlags(0x04);

    pub const fn empty() -> Self {
        SignatureFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        SignatureFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SignatureFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SignatureFlags {
    type Output = SignatureFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        SignatureFlags(self.0 | rhs.0)
    }
}

/// Wire encoding of a public key, as compared byte for byte during signing
pub fn key_blob(key: &KeyData) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    key.encode(&mut blob)
        .map_err(|e| Error::Encoding(format!("cannot encode public key: {}", e)))?;
    Ok(blob)
}

/// A public key exposed by one slot of one token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub serial: u32,
    pub slot: Slot,
    pub key: KeyData,
    pub comment: String,
}

impl KeyRecord {
    pub fn new(model: &str, serial: u32, slot: Slot, key: KeyData) -> Self {
        Self {
            serial,
            slot,
            comment: key_comment(model, serial, slot),
            key,
        }
    }
}

/// Human readable comment naming the token and slot
pub fn key_comment(model: &str, serial: u32, slot: Slot) -> String {
    format!("{} #{} PIV Slot {}", model, serial, slot)
}
