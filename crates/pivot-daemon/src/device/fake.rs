//! Instrumented in-memory token
//!
//! Counts opens, closes and signatures, flags any overlapping hardware call,
//! and can simulate removal so stale handles can be detected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::SigningKey;
use ssh_key::public::{EcdsaPublicKey, Ed25519PublicKey, KeyData, RsaPublicKey};
use ssh_key::Mpint;

use pivot_core::{DeviceError, KeyAlgorithm, Pin, Slot};

use super::{check_rsa_modulus, CardInfo, DeviceSession, TokenBackend};

const DEFAULT_PIN: &str = "123456";
const MAX_RETRIES: u8 = 3;

/// Key material held by a fake slot
#[derive(Clone)]
enum FakeKey {
    Ecdsa(SigningKey),
    Rsa { key: KeyData, modulus_len: usize },
    Unsupported(KeyData),
}

impl FakeKey {
    fn public(&self) -> KeyData {
        match self {
            FakeKey::Ecdsa(secret) => {
                KeyData::from(EcdsaPublicKey::from(secret.verifying_key()))
            }
            FakeKey::Rsa { key, .. } | FakeKey::Unsupported(key) => key.clone(),
        }
    }
}

struct TokenState {
    keys: BTreeMap<Slot, FakeKey>,
    slot_errors: BTreeMap<Slot, DeviceError>,
    pin_protected: BTreeSet<Slot>,
    pin: String,
    retries: u8,
    verified: bool,
    persistent_pin_cache: bool,
    retries_query_fails: bool,
    generation: u64,
    op_delay: Duration,
    sign_delay: Duration,
}

struct FakeInner {
    serial: u32,
    model: String,
    state: Mutex<TokenState>,
    in_use: AtomicBool,
    violations: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    probes: AtomicUsize,
    serial_queries: AtomicUsize,
    stale_operations: AtomicUsize,
    signatures: AtomicUsize,
    pin_verifications: AtomicUsize,
}

/// A simulated token, shared between the test and the handles it opens
#[derive(Clone)]
pub struct FakeToken {
    inner: Arc<FakeInner>,
}

impl FakeToken {
    pub fn new(serial: u32) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                serial,
                model: "FakeToken".to_string(),
                state: Mutex::new(TokenState {
                    keys: BTreeMap::new(),
                    slot_errors: BTreeMap::new(),
                    pin_protected: BTreeSet::new(),
                    pin: DEFAULT_PIN.to_string(),
                    retries: MAX_RETRIES,
                    verified: false,
                    persistent_pin_cache: false,
                    retries_query_fails: false,
                    generation: 0,
                    op_delay: Duration::ZERO,
                    sign_delay: Duration::ZERO,
                }),
                in_use: AtomicBool::new(false),
                violations: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                serial_queries: AtomicUsize::new(0),
                stale_operations: AtomicUsize::new(0),
                signatures: AtomicUsize::new(0),
                pin_verifications: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Put a P-256 key derived from `seed` into `slot`
    pub fn with_p256_key(self, slot: Slot, seed: u8) -> Self {
        let mut scalar = [seed.max(1); 32];
        scalar[0] = 0x01;
        let secret = SigningKey::from_slice(&scalar).expect("valid scalar");
        self.state().keys.insert(slot, FakeKey::Ecdsa(secret));
        self
    }

    /// Put an RSA public key of `modulus_len` bytes into `slot`
    ///
    /// The fake answers RSA sign requests by echoing the padded block. Like
    /// a real token it refuses moduli other than 1024 or 2048 bits.
    pub fn with_rsa_key(self, slot: Slot, modulus_len: usize) -> Self {
        let mut n = vec![0xc5u8; modulus_len];
        n[modulus_len - 1] = 0x01;
        let key = KeyData::Rsa(RsaPublicKey {
            e: Mpint::from_positive_bytes(&[0x01, 0x00, 0x01]).expect("valid exponent"),
            n: Mpint::from_positive_bytes(&n).expect("valid modulus"),
        });
        self.state()
            .keys
            .insert(slot, FakeKey::Rsa { key, modulus_len });
        self
    }

    /// Put an Ed25519 key, which PIV cannot sign with here, into `slot`
    pub fn with_ed25519_key(self, slot: Slot) -> Self {
        let key = KeyData::Ed25519(Ed25519PublicKey([0x42; 32]));
        self.state().keys.insert(slot, FakeKey::Unsupported(key));
        self
    }

    /// Refuse to sign with `slot` until the PIN is verified
    pub fn with_pin_required(self, slot: Slot) -> Self {
        self.state().pin_protected.insert(slot);
        self
    }

    pub fn with_pin(self, pin: &str) -> Self {
        self.state().pin = pin.to_string();
        self
    }

    /// Keep the verified PIN across sessions
    pub fn with_persistent_pin_cache(self) -> Self {
        self.state().persistent_pin_cache = true;
        self
    }

    /// Make the retry counter query fail
    pub fn with_failing_retries_query(self) -> Self {
        self.state().retries_query_fails = true;
        self
    }

    /// Sleep inside every hardware call
    pub fn set_op_delay(&self, delay: Duration) {
        self.state().op_delay = delay;
    }

    /// Sleep inside signing calls, as a token waiting for touch does
    pub fn set_sign_delay(&self, delay: Duration) {
        self.state().sign_delay = delay;
    }

    /// Make every read of `slot` fail with `error`
    pub fn fail_slot(&self, slot: Slot, error: DeviceError) {
        self.state().slot_errors.insert(slot, error);
    }

    /// Invalidate every open handle, as unplugging does
    pub fn disconnect(&self) {
        let mut state = self.state();
        state.generation += 1;
        if !state.persistent_pin_cache {
            state.verified = false;
        }
    }

    /// Public key the token exposes for `slot`
    pub fn public_key(&self, slot: Slot) -> Option<KeyData> {
        self.state().keys.get(&slot).map(FakeKey::public)
    }

    /// P-256 public key for `slot` in compressed SEC1 form
    pub fn compressed_public_key(&self, slot: Slot) -> Option<KeyData> {
        match self.state().keys.get(&slot) {
            Some(FakeKey::Ecdsa(secret)) => {
                let point = secret.verifying_key().to_encoded_point(true);
                EcdsaPublicKey::from_sec1_bytes(point.as_bytes())
                    .ok()
                    .map(KeyData::from)
            }
            _ => None,
        }
    }

    pub fn serial(&self) -> u32 {
        self.inner.serial
    }

    pub fn retries(&self) -> u8 {
        self.state().retries
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.inner.probes.load(Ordering::SeqCst)
    }

    pub fn serial_queries(&self) -> usize {
        self.inner.serial_queries.load(Ordering::SeqCst)
    }

    /// Calls that overlapped another hardware call
    pub fn violations(&self) -> usize {
        self.inner.violations.load(Ordering::SeqCst)
    }

    /// Calls other than the health probe made through an invalidated handle
    pub fn stale_operations(&self) -> usize {
        self.inner.stale_operations.load(Ordering::SeqCst)
    }

    pub fn signatures(&self) -> usize {
        self.inner.signatures.load(Ordering::SeqCst)
    }

    pub fn pin_verifications(&self) -> usize {
        self.inner.pin_verifications.load(Ordering::SeqCst)
    }

    fn open_handle(&self, reader: &str) -> FakeHandle {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let generation = {
            let mut state = self.state();
            if !state.persistent_pin_cache {
                state.verified = false;
            }
            state.generation
        };
        FakeHandle {
            token: self.clone(),
            reader: reader.to_string(),
            generation,
        }
    }
}

struct FakeReader {
    name: String,
    token: Option<FakeToken>,
}

/// Backend over a mutable set of fake readers
#[derive(Clone, Default)]
pub struct FakeBackend {
    readers: Arc<Mutex<Vec<FakeReader>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn readers(&self) -> MutexGuard<'_, Vec<FakeReader>> {
        self.readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach `token` behind a reader called `name`
    pub fn attach(&self, name: &str, token: FakeToken) {
        self.readers().push(FakeReader {
            name: name.to_string(),
            token: Some(token),
        });
    }

    /// Attach a reader that holds no PIV token
    pub fn attach_foreign(&self, name: &str) {
        self.readers().push(FakeReader {
            name: name.to_string(),
            token: None,
        });
    }

    /// Remove a reader, invalidating handles to its token
    pub fn detach(&self, name: &str) {
        let mut readers = self.readers();
        if let Some(pos) = readers.iter().position(|r| r.name == name) {
            let reader = readers.remove(pos);
            if let Some(token) = reader.token {
                token.disconnect();
            }
        }
    }
}

impl TokenBackend for FakeBackend {
    fn cards(&mut self) -> Result<Vec<CardInfo>, DeviceError> {
        Ok(self
            .readers()
            .iter()
            .map(|r| CardInfo {
                reader: r.name.clone(),
            })
            .collect())
    }

    fn open(&mut self, card: &CardInfo) -> Result<Box<dyn DeviceSession>, DeviceError> {
        let readers = self.readers();
        let reader = readers
            .iter()
            .find(|r| r.name == card.reader)
            .ok_or_else(|| DeviceError::Transport(format!("no reader {}", card.reader)))?;
        match &reader.token {
            Some(token) => Ok(Box::new(token.open_handle(&reader.name))),
            None => Err(DeviceError::Transport("not a PIV token".to_string())),
        }
    }
}

struct FakeHandle {
    token: FakeToken,
    reader: String,
    generation: u64,
}

/// Marks a hardware call in flight
struct CallGuard<'a> {
    in_use: &'a AtomicBool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
}

impl FakeHandle {
    fn enter(&self, counts_as_stale: bool) -> Result<CallGuard<'_>, DeviceError> {
        let inner = &self.token.inner;
        if inner.in_use.swap(true, Ordering::SeqCst) {
            inner.violations.fetch_add(1, Ordering::SeqCst);
        }
        let guard = CallGuard {
            in_use: &inner.in_use,
        };

        let (delay, generation) = {
            let state = self.token.state();
            (state.op_delay, state.generation)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if generation != self.generation {
            if counts_as_stale {
                inner.stale_operations.fetch_add(1, Ordering::SeqCst);
            }
            return Err(DeviceError::Transport("token removed".to_string()));
        }
        Ok(guard)
    }
}

impl DeviceSession for FakeHandle {
    fn reader(&self) -> &str {
        &self.reader
    }

    fn model(&self) -> &str {
        &self.token.inner.model
    }

    fn serial(&mut self) -> Result<u32, DeviceError> {
        let _call = self.enter(true)?;
        self.token
            .inner
            .serial_queries
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.token.inner.serial)
    }

    fn probe(&mut self) -> Result<(), DeviceError> {
        self.token.inner.probes.fetch_add(1, Ordering::SeqCst);
        let _call = self.enter(false)?;
        Ok(())
    }

    fn public_key(&mut self, slot: Slot) -> Result<KeyData, DeviceError> {
        let _call = self.enter(true)?;
        let state = self.token.state();
        if let Some(error) = state.slot_errors.get(&slot) {
            return Err(error.clone());
        }
        let key = state.keys.get(&slot).ok_or(DeviceError::SlotEmpty)?;
        if let FakeKey::Rsa { modulus_len, .. } = key {
            check_rsa_modulus(*modulus_len)?;
        }
        Ok(key.public())
    }

    fn pin_retries(&mut self) -> Result<u8, DeviceError> {
        let _call = self.enter(true)?;
        let state = self.token.state();
        if state.retries_query_fails {
            return Err(DeviceError::Transport("retries unavailable".to_string()));
        }
        Ok(state.retries)
    }

    fn verify_pin(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        let _call = self.enter(true)?;
        self.token
            .inner
            .pin_verifications
            .fetch_add(1, Ordering::SeqCst);

        let mut state = self.token.state();
        if state.retries == 0 {
            return Err(DeviceError::PinLocked);
        }
        if pin.as_bytes() == state.pin.as_bytes() {
            state.retries = MAX_RETRIES;
            state.verified = true;
            return Ok(());
        }
        state.retries -= 1;
        if state.retries == 0 {
            Err(DeviceError::PinLocked)
        } else {
            Err(DeviceError::WrongPin {
                retries: state.retries,
            })
        }
    }

    fn sign_raw(
        &mut self,
        slot: Slot,
        algorithm: KeyAlgorithm,
        input: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let _call = self.enter(true)?;
        let (key, delay) = {
            let state = self.token.state();
            let key = state.keys.get(&slot).cloned().ok_or(DeviceError::SlotEmpty)?;
            if state.pin_protected.contains(&slot) && !state.verified {
                return Err(DeviceError::PinRequired);
            }
            (key, state.sign_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let raw = match (key, algorithm) {
            (FakeKey::Ecdsa(secret), KeyAlgorithm::EcP256) => {
                let signature: p256::ecdsa::Signature = secret
                    .sign_prehash(input)
                    .map_err(|e| DeviceError::Transport(e.to_string()))?;
                signature.to_der().as_bytes().to_vec()
            }
            (FakeKey::Rsa { modulus_len, .. }, KeyAlgorithm::Rsa { .. }) => {
                if input.len() != modulus_len {
                    return Err(DeviceError::Transport("bad input length".to_string()));
                }
                input.to_vec()
            }
            (key, _) => {
                return Err(DeviceError::UnsupportedKey(
                    key.public().algorithm().to_string(),
                ))
            }
        };
        self.token.inner.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(raw)
    }

    fn pin_cache_survives_close(&self) -> bool {
        self.token.state().persistent_pin_cache
    }

    fn close(self: Box<Self>) -> Result<(), DeviceError> {
        self.token.inner.closes.fetch_add(1, Ordering::SeqCst);
        if self.token.state().generation != self.generation {
            return Err(DeviceError::Transport("token removed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_first(backend: &mut FakeBackend) -> Box<dyn DeviceSession> {
        let cards = backend.cards().unwrap();
        backend.open(&cards[0]).unwrap()
    }

    #[test]
    fn test_stale_handle_fails() {
        let token = FakeToken::new(7).with_p256_key(Slot::Authentication, 1);
        let mut backend = FakeBackend::new();
        backend.attach("reader", token.clone());

        let mut session = open_first(&mut backend);
        assert!(session.probe().is_ok());
        token.disconnect();
        assert!(session.probe().is_err());
        assert_eq!(token.stale_operations(), 0);
        assert!(session.public_key(Slot::Authentication).is_err());
        assert_eq!(token.stale_operations(), 1);
    }

    #[test]
    fn test_pin_required_until_verified() {
        let token = FakeToken::new(7)
            .with_p256_key(Slot::Signature, 2)
            .with_pin_required(Slot::Signature);
        let mut backend = FakeBackend::new();
        backend.attach("reader", token.clone());
        let mut session = open_first(&mut backend);

        let input = [0u8; 32];
        assert_eq!(
            session.sign_raw(Slot::Signature, KeyAlgorithm::EcP256, &input),
            Err(DeviceError::PinRequired)
        );
        assert_eq!(
            session.verify_pin(&Pin::new("000000").unwrap()),
            Err(DeviceError::WrongPin { retries: 2 })
        );
        session.verify_pin(&Pin::new(DEFAULT_PIN).unwrap()).unwrap();
        assert!(session
            .sign_raw(Slot::Signature, KeyAlgorithm::EcP256, &input)
            .is_ok());
        assert_eq!(token.retries(), MAX_RETRIES);
    }

    #[test]
    fn test_oversized_rsa_key_unsupported() {
        let token = FakeToken::new(7)
            .with_rsa_key(Slot::Authentication, 256)
            .with_rsa_key(Slot::Signature, 384);
        let mut backend = FakeBackend::new();
        backend.attach("reader", token);
        let mut session = open_first(&mut backend);

        assert!(session.public_key(Slot::Authentication).is_ok());
        assert_eq!(
            session.public_key(Slot::Signature),
            Err(DeviceError::UnsupportedKey("RSA-3072".to_string()))
        );
    }

    #[test]
    fn test_foreign_reader_refuses_open() {
        let mut backend = FakeBackend::new();
        backend.attach_foreign("Generic Smart Card Reader");
        let cards = backend.cards().unwrap();
        assert!(backend.open(&cards[0]).is_err());
    }
}
