//! YubiKey PIV backend over PC/SC

use p256::ecdsa::VerifyingKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use ssh_key::public::{EcdsaPublicKey, KeyData, RsaPublicKey};
use ssh_key::Mpint;
use tracing::debug;
use yubikey::piv::{self, AlgorithmId, SlotId};
use yubikey::reader::Context;
use yubikey::{Certificate, YubiKey};

use pivot_core::{DeviceError, KeyAlgorithm, Pin, Slot};

use super::{check_rsa_modulus, CardInfo, DeviceSession, TokenBackend};

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";

/// Enumerates PC/SC readers and opens YubiKeys on them
#[derive(Debug, Default)]
pub struct YubiKeyBackend;

impl YubiKeyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl TokenBackend for YubiKeyBackend {
    fn cards(&mut self) -> Result<Vec<CardInfo>, DeviceError> {
        let mut context = Context::open().map_err(map_error)?;
        let readers = context.iter().map_err(map_error)?;
        Ok(readers
            .map(|reader| CardInfo {
                reader: reader.name().to_string(),
            })
            .collect())
    }

    fn open(&mut self, card: &CardInfo) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let mut context = Context::open().map_err(map_error)?;
        let reader = context
            .iter()
            .map_err(map_error)?
            .find(|reader| reader.name() == card.reader)
            .ok_or_else(|| DeviceError::Transport(format!("reader {} is gone", card.reader)))?;
        let yubikey = reader.open().map_err(map_error)?;
        let version = yubikey.version();
        debug!(
            reader = %card.reader,
            "Opened YubiKey firmware {}.{}.{}",
            version.major,
            version.minor,
            version.patch
        );

        Ok(Box::new(YubiKeySession {
            reader: card.reader.clone(),
            firmware_major: version.major,
            yubikey,
        }))
    }
}

struct YubiKeySession {
    reader: String,
    firmware_major: u8,
    yubikey: YubiKey,
}

impl DeviceSession for YubiKeySession {
    fn reader(&self) -> &str {
        &self.reader
    }

    fn model(&self) -> &str {
        "YubiKey"
    }

    fn serial(&mut self) -> Result<u32, DeviceError> {
        Ok(self.yubikey.serial().0)
    }

    fn probe(&mut self) -> Result<(), DeviceError> {
        // Reading the attestation certificate works whether or not the PIN
        // is verified and leaves the PIN cache alone.
        Certificate::read(&mut self.yubikey, SlotId::Attestation)
            .map(|_| ())
            .map_err(map_error)
    }

    fn public_key(&mut self, slot: Slot) -> Result<KeyData, DeviceError> {
        let certificate =
            Certificate::read(&mut self.yubikey, slot_id(slot)).map_err(map_error)?;
        let spki = certificate.subject_pki();
        let bytes = spki.subject_public_key.raw_bytes();

        match spki.algorithm.oid.to_string().as_str() {
            OID_EC_PUBLIC_KEY => {
                let key = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| {
                    DeviceError::UnsupportedKey("ECDSA key not on P-256".to_string())
                })?;
                Ok(KeyData::from(EcdsaPublicKey::from(&key)))
            }
            OID_RSA_ENCRYPTION => {
                let key = rsa::RsaPublicKey::from_pkcs1_der(bytes)
                    .map_err(|e| DeviceError::Malformed(format!("bad RSA key: {}", e)))?;
                check_rsa_modulus(key.size())?;
                let mpint = |value: &rsa::BigUint| {
                    Mpint::from_positive_bytes(&value.to_bytes_be())
                        .map_err(|e| DeviceError::Malformed(format!("bad RSA integer: {}", e)))
                };
                Ok(KeyData::Rsa(RsaPublicKey {
                    e: mpint(key.e())?,
                    n: mpint(key.n())?,
                }))
            }
            other => Err(DeviceError::UnsupportedKey(other.to_string())),
        }
    }

    fn pin_retries(&mut self) -> Result<u8, DeviceError> {
        self.yubikey.get_pin_retries().map_err(map_error)
    }

    fn verify_pin(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        self.yubikey.verify_pin(pin.as_bytes()).map_err(map_error)
    }

    fn sign_raw(
        &mut self,
        slot: Slot,
        algorithm: KeyAlgorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let algorithm_id = match algorithm {
            KeyAlgorithm::EcP256 => AlgorithmId::EccP256,
            KeyAlgorithm::Rsa { modulus_len: 128 } => AlgorithmId::Rsa1024,
            KeyAlgorithm::Rsa { modulus_len: 256 } => AlgorithmId::Rsa2048,
            KeyAlgorithm::Rsa { modulus_len } => {
                return Err(DeviceError::UnsupportedKey(format!(
                    "RSA-{}",
                    modulus_len * 8
                )))
            }
        };

        let signature = piv::sign_data(&mut self.yubikey, input, algorithm_id, slot_id(slot))
            .map_err(map_error)?;
        Ok(signature.to_vec())
    }

    fn pin_cache_survives_close(&self) -> bool {
        // macOS keeps the PIN cache of firmware 5 tokens across sessions
        cfg!(target_os = "macos") && self.firmware_major >= 5
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        drop(self.yubikey);
        Ok(())
    }
}

fn slot_id(slot: Slot) -> SlotId {
    match slot {
        Slot::Authentication => SlotId::Authentication,
        Slot::Signature => SlotId::Signature,
        Slot::KeyManagement => SlotId::KeyManagement,
        Slot::CardAuthentication => SlotId::CardAuthentication,
    }
}

fn map_error(error: yubikey::Error) -> DeviceError {
    match error {
        yubikey::Error::NotFound => DeviceError::SlotEmpty,
        yubikey::Error::AuthenticationError => DeviceError::PinRequired,
        yubikey::Error::WrongPin { tries } => DeviceError::WrongPin { retries: tries },
        yubikey::Error::PinLocked => DeviceError::PinLocked,
        malformed @ (yubikey::Error::ParseError | yubikey::Error::InvalidObject) => {
            DeviceError::Malformed(malformed.to_string())
        }
        other => DeviceError::Transport(other.to_string()),
    }
}
