use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Short deterministic fingerprint of a secret; the only form of a key's
/// identity that ever leaves this process.
pub type KeyHash = String;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-credential state. The secret is never serialized; `hash` is the
/// public handle everything outside the owning provider refers to it by.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub secret: String,
    pub hash: KeyHash,
    pub service: String,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub model_families: HashSet<String>,
    pub last_used_millis: u64,
    pub last_checked_millis: u64,
    pub prompt_count: u64,
    pub rate_limited_at: u64,
    pub rate_limited_until: u64,
    pub usage_by_family: HashMap<String, u64>,
    pub extension: ServiceExtension,
}

/// Capability/quota hints the checker harvests that only one service
/// family understands. `updateRateLimits` is universal on the provider
/// trait; providers that don't use header hints just ignore the call.
/// Anthropic and Google carry no such service-specific hint today — a
/// Google key's detected model ids already live in `model_families`
/// (the checker's probe fills that in directly), and there is no
/// observable signal this proxy's probes can use to infer an Anthropic
/// key's billing tier.
#[derive(Debug, Clone, Default)]
pub enum ServiceExtension {
    #[default]
    None,
    OpenAi {
        remaining_requests: Option<u64>,
        remaining_tokens: Option<u64>,
        reset_at_millis: Option<u64>,
    },
}

impl KeyRecord {
    pub fn new(secret: impl Into<String>, service: impl Into<String>) -> Self {
        let secret = secret.into();
        let hash = keyrelay_common::fingerprint(&secret);
        Self {
            secret,
            hash,
            service: service.into(),
            is_disabled: false,
            is_revoked: false,
            model_families: HashSet::new(),
            last_used_millis: 0,
            last_checked_millis: 0,
            prompt_count: 0,
            rate_limited_at: 0,
            rate_limited_until: 0,
            usage_by_family: HashMap::new(),
            extension: ServiceExtension::default(),
        }
    }

    pub fn supports(&self, family: &str) -> bool {
        self.model_families.contains(family)
    }

    /// A key is currently locked out for `lockout_window_millis` after its
    /// most recent `rate_limited_at`, independent of `rate_limited_until`
    /// (which governs how long the background queue keeps it parked).
    pub fn is_locked_out(&self, now: u64, lockout_window_millis: u64) -> bool {
        now.saturating_sub(self.rate_limited_at) < lockout_window_millis
    }

    pub fn view(&self) -> KeyView {
        KeyView {
            hash: self.hash.clone(),
            service: self.service.clone(),
            is_disabled: self.is_disabled,
            is_revoked: self.is_revoked,
            model_families: {
                let mut families: Vec<String> = self.model_families.iter().cloned().collect();
                families.sort();
                families
            },
            last_used_millis: self.last_used_millis,
            last_checked_millis: self.last_checked_millis,
            prompt_count: self.prompt_count,
        }
    }
}

/// Redacted view of a key record, safe to return from `list()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyView {
    pub hash: String,
    pub service: String,
    pub is_disabled: bool,
    pub is_revoked: bool,
    pub model_families: Vec<String>,
    pub last_used_millis: u64,
    pub last_checked_millis: u64,
    pub prompt_count: u64,
}

/// What `get(model)` hands back to the caller: enough to stamp
/// authorization on the outbound request, never more.
#[derive(Debug, Clone)]
pub struct KeyHandle {
    pub hash: KeyHash,
    pub secret: String,
    pub service: String,
}

/// A partial update applied by the checker's `update` callback. Only
/// fields the checker actually observed are `Some`.
#[derive(Debug, Clone, Default)]
pub struct KeyPatch {
    pub model_families: Option<HashSet<String>>,
    pub is_disabled: Option<bool>,
    pub is_revoked: Option<bool>,
    pub extension: Option<ServiceExtension>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_derived_from_secret_not_stored_separately() {
        let record = KeyRecord::new("sk-abc123", "openai");
        assert_eq!(record.hash, keyrelay_common::fingerprint("sk-abc123"));
    }

    #[test]
    fn locked_out_window_is_relative_to_rate_limited_at() {
        let mut record = KeyRecord::new("sk-abc123", "openai");
        record.rate_limited_at = 1_000;
        assert!(record.is_locked_out(1_500, 2_000));
        assert!(!record.is_locked_out(3_500, 2_000));
    }
}
