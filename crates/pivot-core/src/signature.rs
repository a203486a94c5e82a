//! Signing input preparation and signature encoding
//!
//! PIV tokens sign raw input: a digest for ECDSA keys and a fully padded
//! block for RSA keys. This module builds that input from the data an SSH
//! client asks to sign and turns the token's raw answer back into an SSH
//! signature.

use sha2::{Digest, Sha256, Sha512};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg, Signature};

use crate::error::{Error, Result};
use crate::key::KeyAlgorithm;

/// DER DigestInfo prefix for SHA-256
const SHA256_DIGEST_INFO: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

/// DER DigestInfo prefix for SHA-512
const SHA512_DIGEST_INFO: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

/// Minimum PKCS#1 v1.5 padding string length
const MIN_PADDING_LEN: usize = 8;

/// Check that a signature under `algorithm` can be handed back to a client
///
/// Legacy `ssh-rsa` (SHA-1) signatures have no representation in the agent
/// protocol types, so they are refused before the token is asked to sign.
pub fn ensure_encodable(algorithm: &Algorithm) -> Result<()> {
    match algorithm {
        Algorithm::Rsa { hash: None } => Err(Error::UnsupportedAlgorithm(algorithm.to_string())),
        _ => Ok(()),
    }
}

/// Build the bytes the token must sign for `data` under `algorithm`
pub fn signing_input(key: &KeyAlgorithm, algorithm: &Algorithm, data: &[u8]) -> Result<Vec<u8>> {
    ensure_encodable(algorithm)?;
    match (key, algorithm) {
        (
            KeyAlgorithm::EcP256,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
        ) => Ok(Sha256::digest(data).to_vec()),
        (KeyAlgorithm::Rsa { modulus_len }, Algorithm::Rsa { hash }) => {
            let (prefix, digest) = match hash {
                Some(HashAlg::Sha256) => (SHA256_DIGEST_INFO, Sha256::digest(data).to_vec()),
                Some(HashAlg::Sha512) => (SHA512_DIGEST_INFO, Sha512::digest(data).to_vec()),
                _ => return Err(Error::UnsupportedAlgorithm(algorithm.to_string())),
            };
            pkcs1v15_encode(*modulus_len, prefix, &digest)
        }
        _ => Err(Error::Encoding(format!(
            "{} cannot be used with a {:?} key",
            algorithm, key
        ))),
    }
}

/// EMSA-PKCS1-v1_5 encoding: 00 01 FF..FF 00 DigestInfo || digest
fn pkcs1v15_encode(modulus_len: usize, prefix: &[u8], digest: &[u8]) -> Result<Vec<u8>> {
    let t_len = prefix.len() + digest.len();
    if modulus_len < t_len + MIN_PADDING_LEN + 3 {
        return Err(Error::Encoding(format!(
            "RSA modulus of {} bytes is too short for a {} byte digest",
            modulus_len,
            digest.len()
        )));
    }

    let mut block = Vec::with_capacity(modulus_len);
    block.push(0x00);
    block.push(0x01);
    block.resize(modulus_len - t_len - 1, 0xff);
    block.push(0x00);
    block.extend_from_slice(prefix);
    block.extend_from_slice(digest);
    Ok(block)
}

/// Turn a token's raw signature into an SSH signature
///
/// ECDSA tokens answer with a DER `Ecdsa-Sig-Value`; RSA tokens answer with
/// the raw signature block.
pub fn encode_signature(key: &KeyAlgorithm, algorithm: Algorithm, raw: &[u8]) -> Result<Signature> {
    match key {
        KeyAlgorithm::EcP256 => {
            let signature = p256::ecdsa::Signature::from_der(raw)
                .map_err(|e| Error::Encoding(format!("invalid ECDSA signature: {}", e)))?;
            Signature::try_from(signature).map_err(|e| Error::Encoding(e.to_string()))
        }
        KeyAlgorithm::Rsa { modulus_len } => {
            if raw.len() != *modulus_len {
                return Err(Error::Encoding(format!(
                    "RSA signature is {} bytes, expected {}",
                    raw.len(),
                    modulus_len
                )));
            }
            Signature::new(algorithm, raw.to_vec()).map_err(|e| Error::Encoding(e.to_string()))
        }
    }
}
