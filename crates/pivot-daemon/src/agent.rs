//! Agent core
//!
//! Implements the agent operations on top of the device registry. Every
//! operation runs on the blocking pool while holding the registry lock, so
//! only one of them touches hardware at a time and waiting callers are
//! served in lock order.

use std::sync::Arc;
use ssh_key::public::KeyData;
use ssh_key::Signature;
use tokio::sync::Mutex;
use tracing::{debug, info};

use pivot_core::{
    ensure_encodable, key_blob, Error, KeyRecord, PinBroker, Result, SignatureFlags, SlotCatalog,
    SlotFailure, SlotFailures,
};

use crate::registry::DeviceRegistry;
use crate::signer::Signer;
use crate::watchdog::TouchWatchdog;

/// Signers produced for one request, with the slots that failed
struct SignerSet {
    signers: Vec<Signer>,
    failures: SlotFailures,
}

/// Outcome of producing signers, as seen outside the registry lock
#[derive(Debug)]
pub struct SignerReport {
    pub keys: Vec<KeyRecord>,
    pub failures: SlotFailures,
}

struct AgentInner {
    /// The one lock serializing hardware access
    registry: Mutex<DeviceRegistry>,
    catalog: SlotCatalog,
    broker: Arc<dyn PinBroker>,
    watchdog: TouchWatchdog,
}

/// Handle to the agent core, cloned into every client connection
#[derive(Clone)]
pub struct PivAgent {
    inner: Arc<AgentInner>,
}

impl PivAgent {
    pub fn new(
        registry: DeviceRegistry,
        catalog: SlotCatalog,
        broker: Arc<dyn PinBroker>,
        watchdog: TouchWatchdog,
    ) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                registry: Mutex::new(registry),
                catalog,
                broker,
                watchdog,
            }),
        }
    }

    /// Public keys of every configured slot that holds a usable key
    pub async fn list_keys(&self) -> Result<Vec<KeyRecord>> {
        self.with_registry(|inner, registry| inner.list_keys(registry))
            .await
    }

    /// Build signers for every configured slot
    ///
    /// Signers stay bound to the sessions that produced them, so only their
    /// public keys and the per-slot failures leave the lock. Fails with
    /// [`Error::NoValidSigner`] when no configured slot works.
    pub async fn signers(&self) -> Result<SignerReport> {
        self.with_registry(|inner, registry| {
            let set = inner.signers(registry)?;
            let keys = set
                .signers
                .iter()
                .map(|signer| {
                    let model = registry
                        .session_mut(signer.serial())
                        .map(|s| s.model().to_string())
                        .unwrap_or_default();
                    KeyRecord::new(
                        &model,
                        signer.serial(),
                        signer.slot(),
                        signer.public_key().clone(),
                    )
                })
                .collect();
            Ok(SignerReport {
                keys,
                failures: set.failures,
            })
        })
        .await
    }

    /// Sign with the key's native algorithm
    ///
    /// RSA keys have no usable native algorithm, see
    /// [`pivot_core::ensure_encodable`].
    pub async fn sign(&self, key: KeyData, data: Vec<u8>) -> Result<Signature> {
        self.sign_with_flags(key, data, SignatureFlags::empty()).await
    }

    /// Sign, honouring the client's RSA hash flags
    pub async fn sign_with_flags(
        &self,
        key: KeyData,
        data: Vec<u8>,
        flags: SignatureFlags,
    ) -> Result<Signature> {
        self.with_registry(move |inner, registry| {
            inner.sign_with_flags(registry, &key, &data, flags)
        })
        .await
    }

    /// Close every token session; the next operation reconnects
    pub async fn close(&self) -> Result<()> {
        self.with_registry(|_, registry| {
            registry.close();
            Ok(())
        })
        .await
    }

    /// Removing every key resets the sessions instead
    pub async fn remove_all(&self) -> Result<()> {
        info!("Client asked to remove all keys, resetting token sessions");
        self.close().await
    }

    /// Adding, removing, locking and unlocking keys is not supported
    pub fn reject_mutation(&self, operation: &str) -> Result<()> {
        debug!(operation, "Rejecting key set mutation");
        Err(Error::OperationUnsupported)
    }

    /// No protocol extensions are supported
    pub fn reject_extension(&self, name: &str) -> Result<()> {
        debug!(extension = name, "Rejecting protocol extension");
        Err(Error::ExtensionUnsupported)
    }

    async fn with_registry<T, F>(&self, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AgentInner, &mut DeviceRegistry) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut registry = inner.registry.blocking_lock();
            let result = operation(&*inner, &mut *registry);
            registry.release_idle();
            result
        })
        .await
        .map_err(|e| Error::Internal(format!("agent task failed: {}", e)))?
    }
}

impl AgentInner {
    fn list_keys(&self, registry: &mut DeviceRegistry) -> Result<Vec<KeyRecord>> {
        registry.ensure()?;

        let mut records = Vec::new();
        for session in registry.sessions_mut() {
            let serial = session.serial();
            for entry in self.catalog.iter() {
                match Signer::build(
                    session.device(),
                    serial,
                    entry.slot,
                    entry.pin_policy,
                    Arc::clone(&self.broker),
                ) {
                    Ok(signer) => records.push(KeyRecord::new(
                        session.model(),
                        serial,
                        entry.slot,
                        signer.public_key().clone(),
                    )),
                    Err(e) => debug!(serial, slot = %entry.slot, "Skipping slot: {}", e),
                }
            }
        }
        Ok(records)
    }

    fn signers(&self, registry: &mut DeviceRegistry) -> Result<SignerSet> {
        registry.ensure()?;

        let mut signers = Vec::new();
        let mut failures = Vec::new();
        for session in registry.sessions_mut() {
            let serial = session.serial();
            for entry in self.catalog.iter() {
                match Signer::build(
                    session.device(),
                    serial,
                    entry.slot,
                    entry.pin_policy,
                    Arc::clone(&self.broker),
                ) {
                    Ok(signer) => signers.push(signer),
                    Err(error) => {
                        debug!(serial, slot = %entry.slot, "No signer for slot: {}", error);
                        failures.push(SlotFailure {
                            serial,
                            slot: entry.slot,
                            error,
                        });
                    }
                }
            }
        }

        if signers.is_empty() {
            return Err(Error::NoValidSigner(SlotFailures(failures)));
        }
        Ok(SignerSet {
            signers,
            failures: SlotFailures(failures),
        })
    }

    fn sign_with_flags(
        &self,
        registry: &mut DeviceRegistry,
        key: &KeyData,
        data: &[u8],
        flags: SignatureFlags,
    ) -> Result<Signature> {
        let set = self.signers(registry)?;
        let wanted = key_blob(key)?;
        let mut signer = None;
        for candidate in &set.signers {
            if key_blob(candidate.public_key())? == wanted {
                signer = Some(candidate);
                break;
            }
        }
        let signer = signer.ok_or(Error::NoMatchingKey)?;

        let algorithm = signer.algorithm().negotiate(flags);
        ensure_encodable(&algorithm)?;

        // Dropped on every path out of this function
        let mut watchdog = self.watchdog.arm();

        let session = registry
            .session_mut(signer.serial())
            .ok_or_else(|| Error::Internal("signer outlived its session".to_string()))?;
        let signature = signer.sign(session.device(), &mut watchdog, data, algorithm)?;

        info!(
            serial = signer.serial(),
            slot = %signer.slot(),
            fingerprint = %key.fingerprint(Default::default()),
            "Signed request"
        );
        watchdog.disarm();
        Ok(signature)
    }
}
