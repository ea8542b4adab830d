//! End-to-end tests for the payment engine.
//!
//! Every test builds its own catalog, facilitator key and ledger, and runs
//! once against the in-memory ledger and once against a temporary sled
//! database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ed25519_dalek::SigningKey;
use serde_json::json;

use m402::catalog::{ResourceCatalog, ResourceDescriptor};
use m402::encoding::Base64Bytes;
use m402::gateway::{AccessGateway, AccessOutcome, ResourceData, StaticDataProvider};
use m402::ledger::{ConsumedPaymentLedger, MemoryLedger, SledLedger};
use m402::proto::{ErrorReason, PaymentProof, TokenInfo};
use m402::signature::{Ed25519Verifier, KeyRegistry, attest};
use m402::timestamp::{Clock, FixedClock, UnixTimestamp};
use m402::validator::PaymentValidator;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const NOW: u64 = 1_700_000_000;
const RESOURCE: &str = "premium-data-v1";
const TOKEN_LEDGER: &str = "mxzaz-hqmqe";
const FACILITATOR: &str = "ogkpr-lyaaa";

struct Engine {
    gateway: AccessGateway,
    registry: Arc<KeyRegistry>,
    clock: Arc<FixedClock>,
    key: SigningKey,
}

fn ledgers() -> Vec<(&'static str, Arc<dyn ConsumedPaymentLedger>)> {
    let memory: Arc<dyn ConsumedPaymentLedger> = Arc::new(MemoryLedger::new());
    let sled: Arc<dyn ConsumedPaymentLedger> =
        Arc::new(SledLedger::open_temporary().expect("temp db"));
    vec![("memory", memory), ("sled", sled)]
}

fn engine(ledger: Arc<dyn ConsumedPaymentLedger>) -> Engine {
    let mut catalog = ResourceCatalog::new();
    catalog
        .register(ResourceDescriptor::new(
            RESOURCE,
            1000,
            TokenInfo {
                chain: "ICP".into(),
                ledger_id: TOKEN_LEDGER.into(),
                symbol: "ckBTC".into(),
            },
            FACILITATOR,
        ))
        .expect("register");
    catalog
        .register(ResourceDescriptor::new(
            "basic-data-v1",
            10,
            TokenInfo {
                chain: "ICP".into(),
                ledger_id: TOKEN_LEDGER.into(),
                symbol: "ckBTC".into(),
            },
            FACILITATOR,
        ))
        .expect("register");

    let key = SigningKey::from_bytes(&[11; 32]);
    let registry = Arc::new(KeyRegistry::new());
    registry.rotate(FACILITATOR, key.verifying_key());

    let clock = Arc::new(FixedClock::new(UnixTimestamp::from_secs(NOW)));
    let validator = PaymentValidator::new(
        Arc::new(catalog),
        ledger,
        Arc::new(Ed25519Verifier::new(Arc::clone(&registry))),
    )
    .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);

    let provider = StaticDataProvider::new().with(
        RESOURCE,
        ResourceData {
            mime_type: "application/json".into(),
            content: json!({ "report": "premium" }),
        },
    );

    Engine {
        gateway: AccessGateway::new(validator, Arc::new(provider)),
        registry,
        clock,
        key,
    }
}

fn signed_proof(key: &SigningKey, payment_id: &str, amount: u64, expiry: u64) -> PaymentProof {
    let mut proof = PaymentProof {
        payment_id: payment_id.into(),
        nonce: 7,
        payer: "ic3ca-7ynev".into(),
        amount,
        token_ledger: TOKEN_LEDGER.into(),
        facilitator_signature: Base64Bytes::default(),
        expiry: UnixTimestamp::from_secs(expiry),
        resource_id: RESOURCE.into(),
    };
    proof.facilitator_signature = attest(key, &proof);
    proof
}

fn count(engine: &Engine) -> u64 {
    engine.gateway.consumed_payment_count().expect("count")
}

fn rejection(outcome: AccessOutcome) -> ErrorReason {
    match outcome {
        AccessOutcome::Rejected(err) => err.reason(),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn grant_then_replay_then_first_failing_check() {
    for (name, ledger) in ledgers() {
        let engine = engine(ledger);
        let proof = signed_proof(&engine.key, "p1", 1000, NOW + 300);

        let outcome = engine.gateway.access(RESOURCE, Some(&proof)).await.expect(name);
        assert!(matches!(outcome, AccessOutcome::Granted { .. }), "{name}");
        assert_eq!(count(&engine), 1, "{name}");

        let outcome = engine.gateway.access(RESOURCE, Some(&proof)).await.expect(name);
        assert_eq!(rejection(outcome), ErrorReason::Replayed, "{name}");
        assert_eq!(count(&engine), 1, "{name}");

        let stale_and_cheap = signed_proof(&engine.key, "p2", 999, NOW - 100);
        let outcome = engine
            .gateway
            .access(RESOURCE, Some(&stale_and_cheap))
            .await
            .expect(name);
        assert_eq!(rejection(outcome), ErrorReason::AmountMismatch, "{name}");
        assert_eq!(count(&engine), 1, "{name}");
    }
}

#[tokio::test]
async fn challenge_without_proof() {
    let engine = engine(Arc::new(MemoryLedger::new()));
    let outcome = engine.gateway.access(RESOURCE, None).await.expect("access");
    let AccessOutcome::PaymentRequired(required) = outcome else {
        panic!("expected a challenge, got {outcome:?}");
    };
    assert_eq!(required.code, "402");
    assert_eq!(required.x402.amount, 1000);
    assert_eq!(required.x402.token.ledger_id, TOKEN_LEDGER);
    assert_eq!(required.x402.facilitator, FACILITATOR);
    assert_eq!(count(&engine), 0);
}

#[tokio::test]
async fn binding_soundness_with_valid_signature() {
    for (name, ledger) in ledgers() {
        let engine = engine(ledger);
        let proof = signed_proof(&engine.key, "p1", 1000, NOW + 300);

        let outcome = engine
            .gateway
            .access("basic-data-v1", Some(&proof))
            .await
            .expect(name);
        assert_eq!(rejection(outcome), ErrorReason::ResourceMismatch, "{name}");

        let cheap = signed_proof(&engine.key, "p2", 10, NOW + 300);
        let outcome = engine.gateway.access(RESOURCE, Some(&cheap)).await.expect(name);
        assert_eq!(rejection(outcome), ErrorReason::AmountMismatch, "{name}");
        assert_eq!(count(&engine), 0, "{name}");
    }
}

#[tokio::test]
async fn expiry_boundary_is_exact() {
    for (name, ledger) in ledgers() {
        let engine = engine(ledger);

        let at_now = signed_proof(&engine.key, "p-now", 1000, NOW);
        let outcome = engine.gateway.access(RESOURCE, Some(&at_now)).await.expect(name);
        assert_eq!(rejection(outcome), ErrorReason::Expired, "{name}");

        let next = signed_proof(&engine.key, "p-next", 1000, NOW + 1);
        let outcome = engine.gateway.access(RESOURCE, Some(&next)).await.expect(name);
        assert!(matches!(outcome, AccessOutcome::Granted { .. }), "{name}");

        let later = signed_proof(&engine.key, "p-later", 1000, NOW + 60);
        engine.clock.advance(60);
        let outcome = engine.gateway.access(RESOURCE, Some(&later)).await.expect(name);
        assert_eq!(rejection(outcome), ErrorReason::Expired, "{name}");
    }
}

#[tokio::test]
async fn key_rotation_applies_to_next_validation() {
    let engine = engine(Arc::new(MemoryLedger::new()));
    let old_proof = signed_proof(&engine.key, "p1", 1000, NOW + 300);

    let new_key = SigningKey::from_bytes(&[12; 32]);
    engine.registry.rotate(FACILITATOR, new_key.verifying_key());

    let outcome = engine.gateway.access(RESOURCE, Some(&old_proof)).await.expect("access");
    assert_eq!(rejection(outcome), ErrorReason::InvalidSignature);

    let new_proof = signed_proof(&new_key, "p1", 1000, NOW + 300);
    let outcome = engine.gateway.access(RESOURCE, Some(&new_proof)).await.expect("access");
    assert!(matches!(outcome, AccessOutcome::Granted { .. }));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn no_double_spend_across_threads() {
    for (name, ledger) in ledgers() {
        let engine = engine(ledger);
        let proof = signed_proof(&engine.key, "contended", 1000, NOW + 300);
        let validator = engine.gateway.validator();
        let granted = AtomicUsize::new(0);
        let replayed = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..32 {
                s.spawn(|| match validator.validate_and_consume(&proof, RESOURCE) {
                    Ok(_) => {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => {
                        assert_eq!(err.reason(), ErrorReason::Replayed);
                        replayed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::SeqCst), 1, "{name}");
        assert_eq!(replayed.load(Ordering::SeqCst), 31, "{name}");
        assert_eq!(count(&engine), 1, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn no_double_spend_across_tasks() {
    for (name, ledger) in ledgers() {
        let engine = engine(ledger);
        let gateway = Arc::new(engine.gateway.clone());
        let proof = Arc::new(signed_proof(&engine.key, "contended", 1000, NOW + 300));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let gateway = Arc::clone(&gateway);
                let proof = Arc::clone(&proof);
                tokio::spawn(async move { gateway.access(RESOURCE, Some(&proof)).await })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            match handle.await.expect("join").expect(name) {
                AccessOutcome::Granted { .. } => granted += 1,
                other => assert_eq!(rejection(other), ErrorReason::Replayed, "{name}"),
            }
        }

        assert_eq!(granted, 1, "{name}");
        assert_eq!(count(&engine), 1, "{name}");
    }
}
