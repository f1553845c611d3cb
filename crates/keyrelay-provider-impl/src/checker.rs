use std::sync::Arc;
use std::time::Duration;

use keyrelay_provider_core::{KeyPatch, KeyProvider, KeyView, now_millis};

use crate::pool_provider::ApiKeyProvider;

/// Outcome of probing a single key against its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Key works; `model_families` lists what it's good for.
    Ok,
    /// 401/403 — the secret itself is bad. Disable permanently.
    AuthFailure,
    /// Billing/quota exhausted, distinct from a transient rate limit.
    QuotaFailure,
    /// Network error, timeout, or 5xx — try again soon, don't disable.
    Transient,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    pub model_families: Vec<String>,
}

#[async_trait::async_trait]
pub trait KeyProbe: Send + Sync {
    async fn probe(&self, secret: &str) -> ProbeResult;
}

/// Cadence and backoff for the background checker. Healthy keys are
/// reprobed infrequently; keys that have never been checked are probed
/// aggressively so a freshly added key starts serving traffic quickly;
/// transport errors back off exponentially rather than hammering a
/// struggling upstream.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub healthy_interval: Duration,
    pub unchecked_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(8 * 3600),
            unchecked_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
        }
    }
}

impl CheckerConfig {
    fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let secs = self.backoff_base.as_secs_f64() * 2f64.powi(consecutive_failures as i32);
        Duration::from_secs_f64(secs.min(self.backoff_max.as_secs_f64()))
    }

    fn due(&self, view: &KeyView, now: u64) -> bool {
        if view.last_checked_millis == 0 {
            return true;
        }
        let elapsed = now.saturating_sub(view.last_checked_millis);
        let interval = if view.model_families.is_empty() {
            self.unchecked_interval
        } else {
            self.healthy_interval
        };
        elapsed >= interval.as_millis() as u64
    }
}

/// Drives periodic re-verification of a provider's keys. One instance per
/// service; `spawn` runs it forever in the background.
pub struct KeyChecker {
    provider: Arc<ApiKeyProvider>,
    probe: Arc<dyn KeyProbe>,
    config: CheckerConfig,
}

impl KeyChecker {
    pub fn new(provider: Arc<ApiKeyProvider>, probe: Arc<dyn KeyProbe>, config: CheckerConfig) -> Self {
        Self { provider, probe, config }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                let sweep_failed = self.sweep().await;
                let sleep_for = if sweep_failed {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.config.backoff_for(consecutive_failures)
                } else {
                    consecutive_failures = 0;
                    self.config.unchecked_interval
                };
                tokio::time::sleep(sleep_for).await;
            }
        });
    }

    /// Probes every key due for a check. Returns true if any probe hit a
    /// transport-level (as opposed to auth/quota) failure, to drive the
    /// caller's exponential backoff.
    async fn sweep(&self) -> bool {
        let views: Vec<KeyView> = self.provider.list().await;
        let now = now_millis();
        let mut any_transient = false;

        for view in views {
            if view.is_disabled || view.is_revoked || !self.config.due(&view, now) {
                continue;
            }
            let Some(secret) = self.provider.secret_for(&view.hash).await else {
                continue;
            };
            any_transient |= self.check_one(&view.hash, &secret).await;
        }
        any_transient
    }

    async fn check_one(&self, hash: &str, secret: &str) -> bool {
        let result = self.probe.probe(secret).await;
        match result.outcome {
            ProbeOutcome::Ok => {
                self.provider
                    .update(
                        hash,
                        KeyPatch {
                            model_families: Some(result.model_families.into_iter().collect()),
                            is_disabled: Some(false),
                            ..Default::default()
                        },
                    )
                    .await;
                false
            }
            ProbeOutcome::AuthFailure => {
                self.provider.revoke(hash).await;
                false
            }
            ProbeOutcome::QuotaFailure => {
                self.provider
                    .update(
                        hash,
                        KeyPatch {
                            is_disabled: Some(true),
                            is_revoked: Some(true),
                            ..Default::default()
                        },
                    )
                    .await;
                false
            }
            ProbeOutcome::Transient => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::EventHub;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedProbe {
        calls: AtomicU32,
        outcome: ProbeOutcome,
    }

    #[async_trait::async_trait]
    impl KeyProbe for FixedProbe {
        async fn probe(&self, _secret: &str) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ProbeResult {
                outcome: self.outcome,
                model_families: vec!["gpt-4".to_string()],
            }
        }
    }

    #[tokio::test]
    async fn ok_probe_marks_key_checked_and_supported() {
        let provider = Arc::new(ApiKeyProvider::new("openai", EventHub::new(4)));
        provider.add_key("sk-test").await;

        let probe = Arc::new(FixedProbe {
            calls: AtomicU32::new(0),
            outcome: ProbeOutcome::Ok,
        });
        let checker = KeyChecker::new(provider.clone(), probe.clone(), CheckerConfig::default());
        let failed = checker.sweep().await;
        assert!(!failed);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

        let views = provider.list().await;
        assert_eq!(views[0].model_families, vec!["gpt-4".to_string()]);
    }

    #[tokio::test]
    async fn auth_failure_disables_and_revokes_the_key() {
        let provider = Arc::new(ApiKeyProvider::new("openai", EventHub::new(4)));
        provider.add_key("sk-bad").await;
        let probe = Arc::new(FixedProbe {
            calls: AtomicU32::new(0),
            outcome: ProbeOutcome::AuthFailure,
        });
        let checker = KeyChecker::new(provider.clone(), probe, CheckerConfig::default());
        checker.sweep().await;

        let views = provider.list().await;
        assert!(views[0].is_disabled);
        assert!(views[0].is_revoked);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = CheckerConfig::default();
        let first = config.backoff_for(0);
        let later = config.backoff_for(10);
        assert!(later >= first);
        assert!(later <= config.backoff_max);
    }
}
