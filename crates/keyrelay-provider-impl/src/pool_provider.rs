use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use keyrelay_common::Headers;
use keyrelay_provider_core::{
    DisabledEvent, Event, EventHub, KeyHandle, KeyPatch, KeyProvider, KeyRecord, KeyView,
    OperationalEvent, ProviderError, ProviderResult, RateLimitedEvent, RevokedEvent, now_millis,
};
use tokio::sync::Mutex;

/// Default artificial delay applied to a key right after it is handed out,
/// so a burst of concurrent requests spreads across the pool instead of
/// hammering whichever key sorts first.
pub const DEFAULT_REUSE_DELAY: Duration = Duration::from_millis(500);

/// Default window a key stays deprioritized after a genuine 429.
pub const DEFAULT_LOCKOUT_WINDOW: Duration = Duration::from_secs(20);

/// `RATE_LIMIT_LOCKOUT`, §4.1 rule 1: how recently a key must have seen a
/// 429 for selection to rank it below every key that hasn't.
pub const DEFAULT_RATE_LIMIT_LOCKOUT: Duration = Duration::from_millis(2_000);

/// A `KeyProvider` backed by an in-memory `Vec<KeyRecord>` behind a single
/// mutex. Every supported service (OpenAI, Anthropic, Google) is a simple
/// bearer/header-credential API with no OAuth dance, so one generic
/// implementation serves all three rather than duplicating selection logic
/// per service.
pub struct ApiKeyProvider {
    service: String,
    records: Mutex<Vec<KeyRecord>>,
    reuse_delay: Duration,
    lockout_window: Duration,
    rate_limit_lockout: Duration,
    events: EventHub,
}

impl ApiKeyProvider {
    pub fn new(service: impl Into<String>, events: EventHub) -> Self {
        Self {
            service: service.into(),
            records: Mutex::new(Vec::new()),
            reuse_delay: DEFAULT_REUSE_DELAY,
            lockout_window: DEFAULT_LOCKOUT_WINDOW,
            rate_limit_lockout: DEFAULT_RATE_LIMIT_LOCKOUT,
            events,
        }
    }

    pub fn with_timing(mut self, reuse_delay: Duration, lockout_window: Duration) -> Self {
        self.reuse_delay = reuse_delay;
        self.lockout_window = lockout_window;
        self
    }

    /// Seeds the pool with a raw secret. Model family support defaults to
    /// empty, which the background checker fills in on its first probe.
    pub async fn add_key(&self, secret: impl Into<String>) -> String {
        let record = KeyRecord::new(secret, self.service.clone());
        let hash = record.hash.clone();
        self.records.lock().await.push(record);
        hash
    }

    async fn with_record_mut<T>(&self, hash: &str, f: impl FnOnce(&mut KeyRecord) -> T) -> Option<T> {
        let mut guard = self.records.lock().await;
        guard.iter_mut().find(|r| r.hash == hash).map(f)
    }

    /// Recovers a raw secret by its public hash. Used only by the
    /// background checker, which needs to call the real upstream — every
    /// other caller deals exclusively in hashes.
    pub async fn secret_for(&self, hash: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .iter()
            .find(|r| r.hash == hash)
            .map(|r| r.secret.clone())
    }

    fn locked_out(record: &KeyRecord, now: u64) -> bool {
        now < record.rate_limited_until
    }
}

#[async_trait]
impl KeyProvider for ApiKeyProvider {
    fn service(&self) -> &str {
        &self.service
    }

    async fn list(&self) -> Vec<KeyView> {
        self.records.lock().await.iter().map(KeyRecord::view).collect()
    }

    async fn get(&self, model: &str) -> ProviderResult<KeyHandle> {
        let now = now_millis();
        let mut guard = self.records.lock().await;
        if guard.is_empty() {
            return Err(ProviderError::NoKeysConfigured);
        }

        let chosen = guard
            .iter_mut()
            .filter(|r| !r.is_disabled && !r.is_revoked && r.supports(model))
            .min_by(|a, b| {
                // Rule 1: not-currently-locked-out beats locked-out, where
                // "locked out" means a 429 within the last RATE_LIMIT_LOCKOUT
                // window (§4.1), independent of the reuse-throttle window
                // below. Rule 2: among two locked-out keys, the one whose
                // lockout will clear soonest (earlier rate_limited_at) wins.
                // Rule 3: otherwise, least-recently-used wins.
                let a_locked = a.is_locked_out(now, self.rate_limit_lockout.as_millis() as u64);
                let b_locked = b.is_locked_out(now, self.rate_limit_lockout.as_millis() as u64);
                a_locked
                    .cmp(&b_locked)
                    .then_with(|| {
                        if a_locked && b_locked {
                            a.rate_limited_at.cmp(&b.rate_limited_at)
                        } else {
                            std::cmp::Ordering::Equal
                        }
                    })
                    .then_with(|| a.last_used_millis.cmp(&b.last_used_millis))
            });

        let Some(record) = chosen else {
            return Err(ProviderError::NoKeysAvailable);
        };

        record.last_used_millis = now;
        record.rate_limited_until = record.rate_limited_until.max(now + self.reuse_delay.as_millis() as u64);

        Ok(KeyHandle {
            hash: record.hash.clone(),
            secret: record.secret.clone(),
            service: record.service.clone(),
        })
    }

    async fn disable(&self, hash: &str) {
        let changed = self
            .with_record_mut(hash, |r| {
                let was_disabled = r.is_disabled;
                r.is_disabled = true;
                !was_disabled
            })
            .await
            .unwrap_or(false);
        if changed {
            self.events
                .emit(Event::Operational(OperationalEvent::Disabled(DisabledEvent {
                    at: SystemTime::now(),
                    service: self.service.clone(),
                    key_hash: hash.to_string(),
                    reason: "disabled by operator or checker".to_string(),
                })))
                .await;
        }
    }

    async fn revoke(&self, hash: &str) {
        let changed = self
            .with_record_mut(hash, |r| {
                let was_revoked = r.is_revoked;
                r.is_disabled = true;
                r.is_revoked = true;
                !was_revoked
            })
            .await
            .unwrap_or(false);
        if changed {
            self.events
                .emit(Event::Operational(OperationalEvent::Revoked(RevokedEvent {
                    at: SystemTime::now(),
                    service: self.service.clone(),
                    key_hash: hash.to_string(),
                })))
                .await;
        }
    }

    async fn update(&self, hash: &str, patch: KeyPatch) {
        let now = now_millis();
        self.with_record_mut(hash, move |r| {
            if let Some(families) = patch.model_families {
                r.model_families = families;
            }
            if let Some(disabled) = patch.is_disabled {
                r.is_disabled = disabled;
            }
            if let Some(revoked) = patch.is_revoked {
                r.is_revoked = revoked;
            }
            if let Some(extension) = patch.extension {
                r.extension = extension;
            }
            r.last_checked_millis = now;
        })
        .await;
    }

    async fn available(&self) -> usize {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| !r.is_disabled && !r.is_revoked)
            .count()
    }

    async fn any_unchecked(&self) -> bool {
        self.records
            .lock()
            .await
            .iter()
            .any(|r| !r.is_disabled && !r.is_revoked && r.last_checked_millis == 0)
    }

    async fn increment_prompt(&self, hash: &str) {
        self.with_record_mut(hash, |r| r.prompt_count += 1).await;
    }

    async fn increment_usage(&self, hash: &str, family: &str, tokens: u64) {
        self.with_record_mut(hash, |r| {
            *r.usage_by_family.entry(family.to_string()).or_insert(0) += tokens;
        })
        .await;
    }

    async fn mark_rate_limited(&self, hash: &str) {
        let now = now_millis();
        let lockout_until = now + self.lockout_window.as_millis() as u64;
        self.with_record_mut(hash, move |r| {
            r.rate_limited_at = now;
            r.rate_limited_until = r.rate_limited_until.max(lockout_until);
        })
        .await;
        self.events
            .emit(Event::Operational(OperationalEvent::RateLimited(RateLimitedEvent {
                at: SystemTime::now(),
                service: self.service.clone(),
                key_hash: hash.to_string(),
                lockout_until_millis: lockout_until,
            })))
            .await;
    }

    async fn get_lockout_period(&self, model: &str) -> Duration {
        let now = now_millis();
        let guard = self.records.lock().await;
        let mut min_remaining: Option<u64> = None;
        for record in guard.iter().filter(|r| !r.is_disabled && !r.is_revoked && r.supports(model)) {
            if !Self::locked_out(record, now) {
                return Duration::ZERO;
            }
            let remaining = record.rate_limited_until - now;
            min_remaining = Some(min_remaining.map_or(remaining, |m| m.min(remaining)));
        }
        min_remaining.map(Duration::from_millis).unwrap_or(Duration::ZERO)
    }

    async fn remaining_quota(&self) -> f64 {
        let now = now_millis();
        let guard = self.records.lock().await;
        if guard.is_empty() {
            return 0.0;
        }
        let usable = guard
            .iter()
            .filter(|r| !r.is_disabled && !r.is_revoked && !Self::locked_out(r, now))
            .count();
        usable as f64 / guard.len() as f64
    }

    async fn usage_in_usd(&self) -> String {
        // No per-token pricing table is maintained here; callers that need
        // cost estimates should derive them from `usage_by_family` upstream.
        "0.00".to_string()
    }

    async fn update_rate_limits(&self, hash: &str, headers: &Headers) {
        let remaining_requests = header_u64(headers, "x-ratelimit-remaining-requests");
        let remaining_tokens = header_u64(headers, "x-ratelimit-remaining-tokens");
        if remaining_requests.is_none() && remaining_tokens.is_none() {
            return;
        }
        self.with_record_mut(hash, move |r| {
            if let keyrelay_provider_core::ServiceExtension::OpenAi { remaining_requests: rr, remaining_tokens: rt, .. } = &mut r.extension {
                if let Some(v) = remaining_requests {
                    *rr = Some(v);
                }
                if let Some(v) = remaining_tokens {
                    *rt = Some(v);
                }
            } else {
                r.extension = keyrelay_provider_core::ServiceExtension::OpenAi {
                    remaining_requests,
                    remaining_tokens,
                    reset_at_millis: None,
                };
            }
        })
        .await;
    }
}

fn header_u64(headers: &Headers, name: &str) -> Option<u64> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::EventHub;

    async fn provider_with_two_keys() -> ApiKeyProvider {
        let provider = ApiKeyProvider::new("openai", EventHub::new(8));
        let a = provider.add_key("sk-a").await;
        let b = provider.add_key("sk-b").await;
        provider
            .update(
                &a,
                KeyPatch {
                    model_families: Some(["gpt-4".to_string()].into_iter().collect()),
                    ..Default::default()
                },
            )
            .await;
        provider
            .update(
                &b,
                KeyPatch {
                    model_families: Some(["gpt-4".to_string()].into_iter().collect()),
                    ..Default::default()
                },
            )
            .await;
        provider
    }

    #[tokio::test]
    async fn unsupported_model_yields_no_keys_available() {
        let provider = provider_with_two_keys().await;
        let err = provider.get("gpt-5-nonexistent").await.unwrap_err();
        assert!(matches!(err, ProviderError::NoKeysAvailable));
    }

    #[tokio::test]
    async fn reuse_delay_spreads_successive_selections_across_keys() {
        let provider = provider_with_two_keys().await;
        let first = provider.get("gpt-4").await.unwrap();
        let second = provider.get("gpt-4").await.unwrap();
        assert_ne!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn disabled_key_is_never_selected() {
        let provider = provider_with_two_keys().await;
        let first = provider.get("gpt-4").await.unwrap();
        provider.disable(&first.hash).await;
        for _ in 0..5 {
            let handle = provider.get("gpt-4").await.unwrap();
            assert_ne!(handle.hash, first.hash);
        }
    }

    #[tokio::test]
    async fn rate_limited_key_yields_positive_lockout_period_once_all_keys_are_locked() {
        let provider = provider_with_two_keys().await;
        let first = provider.get("gpt-4").await.unwrap();
        provider.mark_rate_limited(&first.hash).await;
        let second = provider.get("gpt-4").await.unwrap();
        provider.mark_rate_limited(&second.hash).await;
        let lockout = provider.get_lockout_period("gpt-4").await;
        assert!(lockout > Duration::ZERO);
    }

    #[tokio::test]
    async fn recently_rate_limited_key_ranks_below_a_never_limited_one() {
        // L1: a key that saw a 429 moments ago loses to any key that
        // didn't, even though its much longer lockout_until window (armed
        // by mark_rate_limited) hasn't come close to expiring.
        let provider = provider_with_two_keys().await;
        let first = provider.get("gpt-4").await.unwrap();
        provider.mark_rate_limited(&first.hash).await;
        let next = provider.get("gpt-4").await.unwrap();
        assert_ne!(next.hash, first.hash);
    }

    #[tokio::test]
    async fn rate_limited_at_tiebreak_does_not_apply_when_neither_key_is_locked_out() {
        // L2: two eligible keys that are both outside the RATE_LIMIT_LOCKOUT
        // window (neither is "locked out") must be ranked by smaller
        // last_used alone — a stale rate_limited_at (from a 429 long ago)
        // must not out-rank it. k1: rate_limited_at=0, last_used=9000
        // (recovered from an old 429, used recently). k2:
        // rate_limited_at=1000, last_used=1000 (never really limited,
        // used less recently). k2 must win.
        let provider = provider_with_two_keys().await;
        let hashes: Vec<String> = provider.list().await.into_iter().map(|v| v.hash).collect();
        let (k1, k2) = (hashes[0].clone(), hashes[1].clone());

        provider
            .with_record_mut(&k1, |r| {
                r.rate_limited_at = 0;
                r.last_used_millis = 9_000;
            })
            .await;
        provider
            .with_record_mut(&k2, |r| {
                r.rate_limited_at = 1_000;
                r.last_used_millis = 1_000;
            })
            .await;

        let chosen = provider.get("gpt-4").await.unwrap();
        assert_eq!(chosen.hash, k2, "smaller last_used must win when neither key is locked out");
    }

    #[tokio::test]
    async fn revoke_implies_disabled() {
        let provider = provider_with_two_keys().await;
        let first = provider.get("gpt-4").await.unwrap();
        provider.revoke(&first.hash).await;
        let view = provider.list().await.into_iter().find(|v| v.hash == first.hash).unwrap();
        assert!(view.is_revoked);
        assert!(view.is_disabled);
    }

    #[tokio::test]
    async fn empty_pool_reports_no_keys_configured() {
        let provider = ApiKeyProvider::new("openai", EventHub::new(8));
        let err = provider.get("gpt-4").await.unwrap_err();
        assert!(matches!(err, ProviderError::NoKeysConfigured));
    }
}
