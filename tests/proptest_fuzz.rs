// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests (fuzzing) for budget sync resilience.
//!
//! Uses proptest to generate random and malformed inputs and verify the
//! crate never panics, only returns clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::{Map, Value};

use budget_sync::config::QueueConfig;
use budget_sync::crypto::{
    self, canonical_string, decrypt_optimized, encrypt_optimized, generate_hash, is_valid_share_code,
    normalize_share_code, validate_share_code, KeyMaterial, SHARE_CODE_WORDS,
};
use budget_sync::health::{classify, SnapshotDigest};
use budget_sync::history::ChangeType;
use budget_sync::queue::{
    ExecutorResponse, HttpMethod, MemoryQueueStore, OfflineQueue, QueuedRequest, RequestError, RequestExecutor,
    RequestPriority, RequestSpec,
};
use budget_sync::signaling::{SignalMessage, MAX_METADATA_LEN};
use budget_sync::{EventBus, ManualClock};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Arbitrary JSON values, nested a few levels deep.
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".{0,40}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::btree_map("[a-zA-Z_]{1,12}", inner, 0..8)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// A budget record: a flat object with a few typed fields.
fn budget_record_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map(
        "[a-z]{1,10}",
        prop_oneof![
            any::<i32>().prop_map(|n| Value::Number(n.into())),
            "[ -~]{0,24}".prop_map(Value::String),
            any::<bool>().prop_map(Value::Bool),
        ],
        1..12,
    )
    .prop_map(|m| m.into_iter().collect())
}

fn key_strategy() -> impl Strategy<Value = KeyMaterial> {
    any::<[u8; 32]>().prop_map(|bytes| KeyMaterial::from_bytes(bytes, &[7; 16]))
}

fn priority_strategy() -> impl Strategy<Value = RequestPriority> {
    prop_oneof![
        Just(RequestPriority::High),
        Just(RequestPriority::Normal),
        Just(RequestPriority::Low),
    ]
}

fn signal_json_strategy() -> impl Strategy<Value = String> {
    (
        prop_oneof![
            Just("connected"),
            Just("data_changed"),
            Just("sync_requested"),
            Just("ping"),
            Just("pong"),
            Just("mystery"),
        ],
        proptest::option::of("[a-z0-9_]{0,20}"),
        proptest::option::of(any::<i64>()),
        proptest::option::of(".{0,300}"),
    )
        .prop_map(|(ty, budget, timestamp, device)| {
            let mut object = Map::new();
            object.insert("type".into(), Value::String(ty.into()));
            if let Some(budget) = budget {
                object.insert("budgetId".into(), Value::String(budget));
            }
            if let Some(timestamp) = timestamp {
                object.insert("timestamp".into(), Value::Number(timestamp.into()));
            }
            if let Some(device) = device {
                let mut metadata = Map::new();
                metadata.insert("deviceId".into(), Value::String(device));
                metadata.insert("secret".into(), Value::String("do not forward".into()));
                object.insert("metadata".into(), Value::Object(metadata));
            }
            Value::Object(object).to_string()
        })
}

// =============================================================================
// Crypto envelope
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any JSON value survives a seal and open, compressed or not.
    #[test]
    fn test_envelope_roundtrip(
        value in arbitrary_json_strategy(),
        key in key_strategy(),
        threshold in 0usize..4096,
    ) {
        let envelope = encrypt_optimized(&value, &key, threshold).unwrap();
        let opened: Value = decrypt_optimized(&envelope, &key).unwrap();
        prop_assert_eq!(opened, value);
    }

    /// A different key never opens the envelope, and never panics trying.
    #[test]
    fn test_envelope_rejects_wrong_key(
        value in arbitrary_json_strategy(),
        key in any::<[u8; 32]>(),
        other in any::<[u8; 32]>(),
    ) {
        prop_assume!(key != other);
        let key = KeyMaterial::from_bytes(key, &[7; 16]);
        let other = KeyMaterial::from_bytes(other, &[7; 16]);
        let envelope = encrypt_optimized(&value, &key, 64).unwrap();
        let err = decrypt_optimized::<Value>(&envelope, &other).unwrap_err();
        prop_assert!(err.is_decryption());
    }

    /// Flipped ciphertext bytes fail authentication.
    #[test]
    fn test_tampered_ciphertext_fails(
        value in arbitrary_json_strategy(),
        key in key_strategy(),
        flip in any::<prop::sample::Index>(),
    ) {
        let mut envelope = encrypt_optimized(&value, &key, 4096).unwrap();
        let at = flip.index(envelope.ciphertext.len());
        envelope.ciphertext[at] ^= 0x01;
        let err = decrypt_optimized::<Value>(&envelope, &key).unwrap_err();
        prop_assert!(err.is_decryption());
    }

    /// Object key order never changes the content hash.
    #[test]
    fn test_hash_ignores_key_order(fields in budget_record_strategy()) {
        let forward: Map<String, Value> = fields.iter().cloned().collect();
        let backward: Map<String, Value> = fields.iter().rev().cloned().collect();
        let forward = Value::Object(forward);
        let backward = Value::Object(backward);

        prop_assert_eq!(canonical_string(&forward).unwrap(), canonical_string(&backward).unwrap());
        let hash = generate_hash(&forward).unwrap();
        prop_assert_eq!(hash.len(), 64);
        prop_assert_eq!(&hash, &generate_hash(&backward).unwrap());
        prop_assert!(crypto::verify_hash(&backward, &hash).is_ok());
    }

    /// Changing any field changes the hash.
    #[test]
    fn test_hash_detects_edits(fields in budget_record_strategy(), bump in 1i64..1000) {
        let original = Value::Object(fields.iter().cloned().collect());
        let mut edited = original.clone();
        if let Some(object) = edited.as_object_mut() {
            object.insert("amount_delta".into(), Value::Number(bump.into()));
        }
        prop_assert_ne!(generate_hash(&original).unwrap(), generate_hash(&edited).unwrap());
    }
}

// =============================================================================
// Share codes
// =============================================================================

proptest! {
    /// Arbitrary input never panics the validator.
    #[test]
    fn test_share_code_validation_never_panics(input in ".{0,200}") {
        match validate_share_code(&input) {
            Ok(normalized) => {
                prop_assert_eq!(normalized.split(' ').count(), SHARE_CODE_WORDS);
                prop_assert_eq!(&normalized, &normalize_share_code(&normalized));
            }
            Err(e) => prop_assert!(!e.to_string().is_empty()),
        }
    }

    /// Case and spacing never change the outcome.
    #[test]
    fn test_share_code_normalization(
        words in prop::collection::vec(prop::sample::select(vec!["abandon", "ability", "able", "about", "zoo", "qqq"]), 0..6),
        upper in any::<bool>(),
    ) {
        let plain = words.join(" ");
        let noisy = format!("  {}  ", words.join("   "));
        let noisy = if upper { noisy.to_uppercase() } else { noisy };
        prop_assert_eq!(is_valid_share_code(&plain), is_valid_share_code(&noisy));
        let valid = words.len() == SHARE_CODE_WORDS && !words.contains(&"qqq");
        prop_assert_eq!(is_valid_share_code(&plain), valid);
    }

    /// Every generated code validates.
    #[test]
    fn test_generated_share_codes_validate(_run in 0u8..16) {
        let code = crypto::generate_share_code();
        prop_assert!(is_valid_share_code(&code));
    }
}

// =============================================================================
// Signaling frames
// =============================================================================

proptest! {
    /// Garbage frames are discarded, never a panic.
    #[test]
    fn test_signal_parse_arbitrary_text(text in ".{0,500}", now in any::<i64>()) {
        let _ = SignalMessage::parse(&text, now);
    }

    /// Only whitelisted, bounded metadata survives parsing.
    #[test]
    fn test_signal_parse_structured(text in signal_json_strategy(), now in any::<i64>()) {
        let raw: Value = serde_json::from_str(&text).unwrap();
        let parsed = SignalMessage::parse(&text, now);
        if raw["type"] == "mystery" {
            prop_assert!(parsed.is_none());
            return Ok(());
        }
        let message = parsed.unwrap();
        prop_assert_eq!(message.timestamp, raw["timestamp"].as_i64().unwrap_or(now));
        prop_assert_eq!(message.budget_id.as_deref(), raw["budgetId"].as_str());
        if let Some(metadata) = &message.metadata {
            let device = metadata.device_id.as_deref().unwrap();
            prop_assert!(device.chars().count() <= MAX_METADATA_LEN);
            prop_assert!(metadata.user_id.is_none());
        }

        // Serializing again yields a frame that parses to the same message
        let again = SignalMessage::parse(&message.to_json().unwrap(), 0).unwrap();
        prop_assert_eq!(again, message);
    }

    /// Change type aliases never panic.
    #[test]
    fn test_change_type_parse(raw in ".{0,30}") {
        if let Ok(change) = ChangeType::parse(&raw) {
            prop_assert_eq!(ChangeType::parse(change.as_str()).unwrap(), change);
        }
    }
}

// =============================================================================
// Health classification
// =============================================================================

proptest! {
    /// Matching digests are always clean, regardless of what was known before.
    #[test]
    fn test_identical_digests_are_clean(
        entries in prop::collection::btree_map("[a-z]{1,6}:[a-z0-9]{1,6}", "[0-9a-f]{64}", 0..30),
        stale in prop::collection::btree_map("[a-z]{1,6}:[a-z0-9]{1,6}", "[0-9a-f]{64}", 0..10),
    ) {
        let local: SnapshotDigest = entries.clone().into_iter().collect();
        let cloud: SnapshotDigest = entries.clone().into_iter().collect();
        let known: SnapshotDigest = stale.into_iter().collect();

        let divergence = classify(&local, &cloud, &known, &HashSet::new());
        prop_assert!(divergence.is_clean());
        prop_assert_eq!(divergence.agreed.len(), entries.len());
        prop_assert_eq!(divergence.fingerprint, None);
        prop_assert_eq!(local.root_hash(), cloud.root_hash());
    }

    /// Pending keys never take part in a comparison.
    #[test]
    fn test_pending_keys_are_excluded(
        local in prop::collection::btree_map("[a-z]{1,4}:[0-9]{1,3}", "[0-9a-f]{8}", 0..20),
        cloud in prop::collection::btree_map("[a-z]{1,4}:[0-9]{1,3}", "[0-9a-f]{8}", 0..20),
    ) {
        let pending: HashSet<String> = local.keys().chain(cloud.keys()).cloned().collect();
        let divergence = classify(
            &local.into_iter().collect(),
            &cloud.into_iter().collect(),
            &SnapshotDigest::new(),
            &pending,
        );
        prop_assert_eq!(divergence.compared(), 0);
        prop_assert_eq!(divergence.corruption_ratio(), 0.0);
    }
}

// =============================================================================
// Offline queue ordering
// =============================================================================

#[derive(Default)]
struct RecordingExecutor {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl RequestExecutor for RecordingExecutor {
    async fn execute(&self, request: &QueuedRequest) -> Result<ExecutorResponse, RequestError> {
        self.delivered.lock().unwrap().push(request.url.clone());
        Ok(ExecutorResponse { status: 200, body: None })
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A drain delivers by priority tier, then in enqueue order.
    #[test]
    fn test_drain_order_is_priority_then_fifo(priorities in prop::collection::vec(priority_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let delivered = runtime.block_on(async {
            let executor = Arc::new(RecordingExecutor::default());
            let queue = OfflineQueue::new(
                Arc::new(MemoryQueueStore::new()),
                executor.clone(),
                Arc::new(ManualClock::new(1_700_000_000_000)),
                EventBus::default(),
                QueueConfig::default(),
            );
            for (i, priority) in priorities.iter().enumerate() {
                queue
                    .enqueue(RequestSpec::new(HttpMethod::Put, format!("/r/{i}")).priority(*priority))
                    .await
                    .unwrap();
            }
            queue.set_online(true);
            let report = queue.force_drain().await.unwrap();
            assert_eq!(report.delivered, priorities.len());
            let order = executor.delivered.lock().unwrap().clone();
            order
        });

        let mut expected: Vec<(RequestPriority, usize)> =
            priorities.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
        expected.sort();
        let expected: Vec<String> = expected.into_iter().map(|(_, i)| format!("/r/{i}")).collect();
        prop_assert_eq!(delivered, expected);
    }
}
