//! Idempotency keys and the guard contract.
//!
//! The guard itself lives outside this crate (a unique index, a sent-mail
//! ledger, ...). The orchestrator derives a content-addressed key per step
//! invocation and hands both to the collaborator, which claims the key before
//! applying an external side effect.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Result of claiming an idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First claim; the side effect may be applied
    Fresh,

    /// The side effect was already applied for this content
    AlreadyApplied,
}

/// Content-addressed uniqueness check
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Atomically claim `key`. Claiming an already-claimed key reports
    /// `AlreadyApplied` and changes nothing.
    async fn claim(&self, key: &str) -> Result<Claim>;
}

/// Generate an idempotency key for a step over the given state fields
pub fn generate_idempotency_key(
    run_id: Uuid,
    step_name: &str,
    fields: &BTreeMap<String, Value>,
) -> String {
    // BTreeMap serializes in key order, so equal content hashes equally
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    format!("{}:{}:{}", run_id, step_name, hash_input(&canonical))
}

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
