//! Behavioural tests for the agent core
//!
//! These tests drive the agent end to end against instrumented fake tokens:
//! hardware serialization, reconnection, algorithm negotiation, partial slot
//! failures, the touch watchdog and the rejection surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ssh_agent_lib::agent::Session;
use ssh_key::{Algorithm, EcdsaCurve, HashAlg};
use tokio::runtime::Handle;

use pivot_core::{DeviceError, Error, PinPolicy, SignatureFlags, Slot, SlotCatalog, SlotConfig};
use pivot_daemon::device::fake::{FakeBackend, FakeToken};
use pivot_daemon::notify::RecordingNotifier;
use pivot_daemon::pinentry::ScriptedPinBroker;
use pivot_daemon::{
    AgentSession, DeviceRegistry, DeviceSelector, PivAgent, ReleasePolicy, TouchWatchdog,
};

// ============================================
// Harness
// ============================================

struct Harness {
    backend: FakeBackend,
    notifier: RecordingNotifier,
    broker: ScriptedPinBroker,
    selector: DeviceSelector,
    grace: Duration,
    slots: Vec<SlotConfig>,
}

impl Harness {
    fn new() -> Self {
        Self {
            backend: FakeBackend::new(),
            notifier: RecordingNotifier::new(),
            broker: ScriptedPinBroker::answering("123456"),
            selector: DeviceSelector::First,
            grace: Duration::from_secs(30),
            slots: vec![SlotConfig::new(Slot::Authentication, PinPolicy::Unset)],
        }
    }

    fn slots(mut self, slots: &[(Slot, PinPolicy)]) -> Self {
        self.slots = slots
            .iter()
            .map(|(slot, policy)| SlotConfig::new(*slot, *policy))
            .collect();
        self
    }

    fn selector(mut self, selector: DeviceSelector) -> Self {
        self.selector = selector;
        self
    }

    fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn broker(mut self, broker: ScriptedPinBroker) -> Self {
        self.broker = broker;
        self
    }

    fn agent(&self) -> PivAgent {
        PivAgent::new(
            DeviceRegistry::new(
                Box::new(self.backend.clone()),
                self.selector,
                ReleasePolicy::Never,
            ),
            SlotCatalog::new(self.slots.clone()).unwrap(),
            Arc::new(self.broker.clone()),
            TouchWatchdog::new(
                self.grace,
                Arc::new(self.notifier.clone()),
                Handle::current(),
            ),
        )
    }
}

fn rsa(hash: Option<HashAlg>) -> Algorithm {
    Algorithm::Rsa { hash }
}

// ============================================
// Serialization
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hardware_calls_never_overlap() {
    let harness = Harness::new();
    let token = FakeToken::new(1001).with_p256_key(Slot::Authentication, 7);
    token.set_op_delay(Duration::from_millis(2));
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    let key = agent.list_keys().await.unwrap().remove(0).key;

    let mut tasks = Vec::new();
    for i in 0..24 {
        let agent = agent.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                agent.list_keys().await.map(|_| ())
            } else {
                agent
                    .sign(key, format!("request {}", i).into_bytes())
                    .await
                    .map(|_| ())
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(token.violations(), 0);
    assert_eq!(token.signatures(), 12);
    assert_eq!(token.opens(), 1);
}

// ============================================
// Reconnection
// ============================================

#[tokio::test]
async fn test_lost_token_is_reopened() {
    let harness = Harness::new();
    let token = FakeToken::new(1002).with_p256_key(Slot::Authentication, 7);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    assert_eq!(agent.list_keys().await.unwrap().len(), 1);
    token.disconnect();

    let keys = agent.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(token.opens(), 2);
    assert_eq!(token.closes(), 1);
    assert_eq!(token.stale_operations(), 0);
    assert_eq!(token.serial_queries(), 2);
}

#[tokio::test]
async fn test_unplugged_token_is_unavailable_until_replugged() {
    let harness = Harness::new();
    let token = FakeToken::new(1003).with_p256_key(Slot::Authentication, 7);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    agent.list_keys().await.unwrap();
    harness.backend.detach("Token");
    let err = agent.list_keys().await.unwrap_err();
    assert!(matches!(err, Error::DeviceUnavailable(_)));
    assert!(err.to_string().contains("could not reach device"));

    harness.backend.attach("Token", token.clone());
    assert_eq!(agent.list_keys().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_forces_rediscovery() {
    let harness = Harness::new();
    let token = FakeToken::new(1004).with_p256_key(Slot::Authentication, 7);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    agent.list_keys().await.unwrap();
    agent.close().await.unwrap();
    agent.close().await.unwrap();
    assert_eq!(token.closes(), 1);

    agent.list_keys().await.unwrap();
    assert_eq!(token.opens(), 2);
}

// ============================================
// Device selection
// ============================================

#[tokio::test]
async fn test_first_available_skips_foreign_readers() {
    let harness = Harness::new();
    harness.backend.attach_foreign("Contactless Reader");
    harness.backend.attach(
        "Token",
        FakeToken::new(2001).with_p256_key(Slot::Authentication, 1),
    );
    let agent = harness.agent();

    let keys = agent.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].serial, 2001);
}

#[tokio::test]
async fn test_serial_selection_picks_matching_token() {
    let harness = Harness::new().selector(DeviceSelector::Serial(2003));
    harness.backend.attach(
        "Token A",
        FakeToken::new(2002).with_p256_key(Slot::Authentication, 1),
    );
    harness.backend.attach(
        "Token B",
        FakeToken::new(2003).with_p256_key(Slot::Authentication, 2),
    );
    let agent = harness.agent();

    let keys = agent.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].serial, 2003);
}

#[tokio::test]
async fn test_all_tokens_are_listed() {
    let harness = Harness::new().selector(DeviceSelector::All);
    harness.backend.attach(
        "Token A",
        FakeToken::new(2004).with_p256_key(Slot::Authentication, 1),
    );
    harness.backend.attach(
        "Token B",
        FakeToken::new(2005).with_rsa_key(Slot::Authentication, 256),
    );
    let agent = harness.agent();

    let keys = agent.list_keys().await.unwrap();
    let serials: Vec<u32> = keys.iter().map(|k| k.serial).collect();
    assert_eq!(serials, vec![2004, 2005]);

    let rsa_key = keys[1].key.clone();
    let signature = agent
        .sign_with_flags(rsa_key, b"data".to_vec(), SignatureFlags::RSA_SHA2_256)
        .await
        .unwrap();
    assert_eq!(signature.algorithm(), rsa(Some(HashAlg::Sha256)));
}

// ============================================
// Algorithm negotiation and key matching
// ============================================

#[tokio::test]
async fn test_rsa_algorithm_negotiation() {
    let harness = Harness::new().slots(&[(Slot::Signature, PinPolicy::Unset)]);
    harness.backend.attach(
        "Token",
        FakeToken::new(3001).with_rsa_key(Slot::Signature, 256),
    );
    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;

    let cases = [
        (0x02, rsa(Some(HashAlg::Sha256))),
        (0x04, rsa(Some(HashAlg::Sha512))),
        (0x06, rsa(Some(HashAlg::Sha256))),
    ];
    for (bits, expected) in cases {
        let signature = agent
            .sign_with_flags(
                key.clone(),
                b"data".to_vec(),
                SignatureFlags::from_bits(bits),
            )
            .await
            .unwrap();
        assert_eq!(signature.algorithm(), expected, "flags {:#x}", bits);
        assert_eq!(signature.as_bytes().len(), 256);
    }
}

#[tokio::test]
async fn test_rsa_without_hash_flags_is_refused_before_signing() {
    let harness = Harness::new()
        .slots(&[(Slot::Signature, PinPolicy::Always)])
        .grace(Duration::from_millis(10));
    let token = FakeToken::new(3004).with_rsa_key(Slot::Signature, 256);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;

    let err = agent
        .sign_with_flags(key.clone(), b"data".to_vec(), SignatureFlags::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    assert!(matches!(
        agent.sign(key, b"data".to_vec()).await,
        Err(Error::UnsupportedAlgorithm(_))
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(token.signatures(), 0);
    assert_eq!(harness.broker.prompts(), 0);
    assert_eq!(harness.notifier.shown(), 0);
}

#[tokio::test]
async fn test_ecdsa_ignores_flags() {
    let harness = Harness::new();
    harness.backend.attach(
        "Token",
        FakeToken::new(3002).with_p256_key(Slot::Authentication, 3),
    );
    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;

    let signature = agent
        .sign_with_flags(key, b"data".to_vec(), SignatureFlags::from_bits(0x06))
        .await
        .unwrap();
    assert_eq!(
        signature.algorithm(),
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256
        }
    );
}

#[tokio::test]
async fn test_equivalent_key_with_other_encoding_does_not_match() {
    let harness = Harness::new();
    let token = FakeToken::new(3003).with_p256_key(Slot::Authentication, 3);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    let compressed = token.compressed_public_key(Slot::Authentication).unwrap();
    assert_ne!(Some(&compressed), token.public_key(Slot::Authentication).as_ref());

    let err = agent
        .sign(compressed, b"data".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMatchingKey));
    assert_eq!(token.signatures(), 0);

    let other = FakeToken::new(9).with_p256_key(Slot::Authentication, 99);
    let err = agent
        .sign(other.public_key(Slot::Authentication).unwrap(), b"data".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMatchingKey));
}

// ============================================
// Partial slot failure
// ============================================

#[tokio::test]
async fn test_partial_slot_failure() {
    let harness = Harness::new().slots(&[
        (Slot::Authentication, PinPolicy::Unset),
        (Slot::Signature, PinPolicy::Once),
        (Slot::KeyManagement, PinPolicy::Never),
    ]);
    let token = FakeToken::new(4001)
        .with_p256_key(Slot::Authentication, 1)
        .with_rsa_key(Slot::Signature, 256);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    let keys = agent.list_keys().await.unwrap();
    assert_eq!(keys.len(), 2);

    let report = agent.signers().await.unwrap();
    assert_eq!(report.keys.len(), 2);
    assert_eq!(report.failures.len(), 1);
    let failure = report.failures.iter().next().unwrap();
    assert_eq!(failure.slot, Slot::KeyManagement);
    assert!(matches!(
        failure.error,
        Error::Device {
            source: DeviceError::SlotEmpty,
            ..
        }
    ));

    token.fail_slot(Slot::Authentication, DeviceError::SlotEmpty);
    token.fail_slot(
        Slot::Signature,
        DeviceError::UnsupportedKey("RSA-4096".to_string()),
    );

    assert!(agent.list_keys().await.unwrap().is_empty());
    match agent.signers().await {
        Err(Error::NoValidSigner(failures)) => {
            assert_eq!(failures.len(), 3);
            assert!(failures.iter().any(|f| matches!(
                f.error,
                Error::UnsupportedKeyType {
                    slot: Slot::Signature,
                    ..
                }
            )));
        }
        other => panic!("expected NoValidSigner, got {:?}", other.map(|r| r.keys)),
    }
}

#[tokio::test]
async fn test_oversized_rsa_key_is_not_a_signer() {
    let harness = Harness::new().slots(&[
        (Slot::Authentication, PinPolicy::Unset),
        (Slot::Signature, PinPolicy::Unset),
    ]);
    let token = FakeToken::new(4003)
        .with_p256_key(Slot::Authentication, 1)
        .with_rsa_key(Slot::Signature, 384);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    let keys = agent.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].slot, Slot::Authentication);

    let report = agent.signers().await.unwrap();
    assert_eq!(report.keys.len(), 1);
    assert!(matches!(
        report.failures.iter().next().unwrap().error,
        Error::UnsupportedKeyType {
            slot: Slot::Signature,
            ..
        }
    ));

    let rsa_key = token.public_key(Slot::Signature).unwrap();
    let err = agent
        .sign_with_flags(rsa_key, b"data".to_vec(), SignatureFlags::RSA_SHA2_512)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoMatchingKey));
    assert_eq!(token.signatures(), 0);
}

#[tokio::test]
async fn test_unsupported_key_type_is_not_listed() {
    let harness = Harness::new().slots(&[
        (Slot::Authentication, PinPolicy::Unset),
        (Slot::CardAuthentication, PinPolicy::Unset),
    ]);
    harness.backend.attach(
        "Token",
        FakeToken::new(4002)
            .with_p256_key(Slot::Authentication, 1)
            .with_ed25519_key(Slot::CardAuthentication),
    );
    let agent = harness.agent();

    assert_eq!(agent.list_keys().await.unwrap().len(), 1);
    let report = agent.signers().await.unwrap();
    assert!(matches!(
        report.failures.iter().next().unwrap().error,
        Error::UnsupportedKeyType { .. }
    ));
}

// ============================================
// Touch watchdog
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fast_signature_shows_no_notification() {
    let harness = Harness::new().grace(Duration::from_millis(300));
    harness.backend.attach(
        "Token",
        FakeToken::new(5001).with_p256_key(Slot::Authentication, 1),
    );
    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;

    agent.sign(key, b"data".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(harness.notifier.shown(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_signature_shows_one_notification() {
    let harness = Harness::new().grace(Duration::from_millis(100));
    let token = FakeToken::new(5002).with_p256_key(Slot::Authentication, 1);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;

    token.set_sign_delay(Duration::from_millis(800));
    agent.sign(key, b"data".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.notifier.shown(), 1);
    assert_eq!(harness.notifier.dismissed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_notification_while_pin_prompt_is_open() {
    let broker = ScriptedPinBroker::answering("123456").with_delay(Duration::from_millis(800));
    let harness = Harness::new()
        .grace(Duration::from_millis(200))
        .broker(broker.clone());
    let token = FakeToken::new(5003)
        .with_p256_key(Slot::Authentication, 1)
        .with_pin_required(Slot::Authentication);
    harness.backend.attach("Token", token.clone());

    let shown_during_prompt = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let notifier = harness.notifier.clone();
        let shown_during_prompt = Arc::clone(&shown_during_prompt);
        broker.on_prompt_end(move || {
            shown_during_prompt.store(notifier.shown(), Ordering::SeqCst);
        });
    }

    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;
    agent.sign(key, b"data".to_vec()).await.unwrap();

    assert_eq!(broker.prompts(), 1);
    assert_eq!(shown_during_prompt.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(harness.notifier.shown(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_signature_retires_watchdog() {
    let harness = Harness::new()
        .grace(Duration::from_millis(100))
        .slots(&[(Slot::Authentication, PinPolicy::Never)]);
    let token = FakeToken::new(5004)
        .with_p256_key(Slot::Authentication, 1)
        .with_pin_required(Slot::Authentication);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();
    let key = agent.list_keys().await.unwrap().remove(0).key;

    let err = agent.sign(key, b"data".to_vec()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Device {
            source: DeviceError::PinRequired,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(harness.notifier.shown(), 0);
    assert_eq!(harness.broker.prompts(), 0);
}

// ============================================
// Rejection surface
// ============================================

#[tokio::test]
async fn test_mutations_and_extensions_rejected() {
    let harness = Harness::new();
    let token = FakeToken::new(6001).with_p256_key(Slot::Authentication, 1);
    harness.backend.attach("Token", token.clone());
    let agent = harness.agent();

    for operation in ["add", "remove", "lock", "unlock"] {
        assert!(matches!(
            agent.reject_mutation(operation),
            Err(Error::OperationUnsupported)
        ));
    }
    assert!(matches!(
        agent.reject_extension("query"),
        Err(Error::ExtensionUnsupported)
    ));

    let mut session = AgentSession::new(agent.clone());
    assert!(session.lock("pass".to_string()).await.is_err());
    assert!(session.unlock("pass".to_string()).await.is_err());

    // Removing all keys resets the connection and succeeds
    session.request_identities().await.unwrap();
    session.remove_all_identities().await.unwrap();
    assert_eq!(token.closes(), 1);
    assert_eq!(session.request_identities().await.unwrap().len(), 1);
    assert_eq!(token.opens(), 2);
}
