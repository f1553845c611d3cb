use std::time::Duration;

use async_trait::async_trait;
use keyrelay_common::Headers;

use crate::errors::ProviderResult;
use crate::key::{KeyHandle, KeyPatch, KeyView};

/// One implementation per upstream service family. Each provider owns its
/// key records exclusively; nothing outside a provider ever holds a
/// mutable reference to one of its records — callers pass a hash and a
/// patch.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    fn service(&self) -> &str;

    /// Every key record, secret redacted.
    async fn list(&self) -> Vec<KeyView>;

    /// Selects one key capable of serving `model`. Fails with
    /// `NoKeysAvailable` when the eligible subset is empty.
    async fn get(&self, model: &str) -> ProviderResult<KeyHandle>;

    /// Marks a key disabled; idempotent.
    async fn disable(&self, hash: &str);

    /// Terminal disable: the upstream indicated the credential itself is
    /// permanently unusable (invalid, billing-suspended), not merely
    /// rate-limited. Sets both `isDisabled` and `isRevoked`.
    async fn revoke(&self, hash: &str);

    /// Merges a patch into the named key and sets `lastChecked` to now.
    /// The sole entry point the background checker uses to mutate state.
    async fn update(&self, hash: &str, patch: KeyPatch);

    /// Count of non-disabled keys.
    async fn available(&self) -> usize;

    /// True iff any non-disabled key has never been checked.
    async fn any_unchecked(&self) -> bool;

    async fn increment_prompt(&self, hash: &str);

    async fn increment_usage(&self, hash: &str, family: &str, tokens: u64);

    /// Records a 429 event and arms the reuse-throttle lockout.
    async fn mark_rate_limited(&self, hash: &str);

    /// Time the queue should sleep before retrying; 0 if some eligible
    /// key is usable now.
    async fn get_lockout_period(&self, model: &str) -> Duration;

    /// Aggregate diagnostic in `[0, 1]`: fraction of keys not currently
    /// disabled or locked out.
    async fn remaining_quota(&self) -> f64;

    async fn usage_in_usd(&self) -> String;

    /// Parses service-specific rate-limit headers and tightens the
    /// stored bound. OpenAI is the only service that currently overrides
    /// this; everyone else takes the no-op default rather than being
    /// probed for a concrete type.
    async fn update_rate_limits(&self, _hash: &str, _headers: &Headers) {}
}
