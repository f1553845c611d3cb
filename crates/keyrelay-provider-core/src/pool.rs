use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keyrelay_common::Headers;

use crate::errors::{ProviderError, ProviderResult};
use crate::key::{KeyHandle, KeyView};
use crate::provider::KeyProvider;

/// Aggregates one [`KeyProvider`] per supported service and routes calls
/// to the provider identified by the request's target family. Holds only
/// shared references to providers; it never touches a key record
/// directly.
pub struct KeyPool {
    providers: HashMap<String, Arc<dyn KeyProvider>>,
    /// `(model name prefix, service)`, checked in order. A configured
    /// table rather than hard-coded string matching, so a new family
    /// doesn't need a code change to become selectable.
    model_prefixes: Vec<(String, String)>,
}

impl KeyPool {
    pub fn new(model_prefixes: Vec<(String, String)>) -> Self {
        Self {
            providers: HashMap::new(),
            model_prefixes,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn KeyProvider>) {
        self.providers.insert(provider.service().to_string(), provider);
    }

    pub fn service_for_model(&self, model: &str) -> Option<&str> {
        self.model_prefixes
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, service)| service.as_str())
    }

    fn provider(&self, service: &str) -> ProviderResult<&Arc<dyn KeyProvider>> {
        self.providers
            .get(service)
            .ok_or_else(|| ProviderError::UnknownService(service.to_string()))
    }

    /// Resolves a model to a service and selects a key within it.
    pub async fn get(&self, model: &str) -> ProviderResult<(String, KeyHandle)> {
        let service = self
            .service_for_model(model)
            .ok_or_else(|| ProviderError::UnknownService(model.to_string()))?;
        let handle = self.provider(service)?.get(model).await?;
        Ok((service.to_string(), handle))
    }

    pub async fn disable(&self, service: &str, hash: &str) -> ProviderResult<()> {
        self.provider(service)?.disable(hash).await;
        Ok(())
    }

    pub async fn revoke(&self, service: &str, hash: &str) -> ProviderResult<()> {
        self.provider(service)?.revoke(hash).await;
        Ok(())
    }

    pub async fn mark_rate_limited(&self, service: &str, hash: &str) -> ProviderResult<()> {
        self.provider(service)?.mark_rate_limited(hash).await;
        Ok(())
    }

    pub async fn increment_prompt(&self, service: &str, hash: &str) -> ProviderResult<()> {
        self.provider(service)?.increment_prompt(hash).await;
        Ok(())
    }

    pub async fn increment_usage(&self, service: &str, hash: &str, family: &str, tokens: u64) -> ProviderResult<()> {
        self.provider(service)?.increment_usage(hash, family, tokens).await;
        Ok(())
    }

    pub async fn update_rate_limits(&self, service: &str, hash: &str, headers: &Headers) -> ProviderResult<()> {
        self.provider(service)?.update_rate_limits(hash, headers).await;
        Ok(())
    }

    /// Per-service count, not a global one: downstream callers (the
    /// queue's stall guard) need to reason about one service at a time.
    pub async fn available(&self, service: &str) -> ProviderResult<usize> {
        Ok(self.provider(service)?.available().await)
    }

    pub async fn any_unchecked(&self, service: &str) -> ProviderResult<bool> {
        Ok(self.provider(service)?.any_unchecked().await)
    }

    pub async fn get_lockout_period(&self, service: &str, model: &str) -> ProviderResult<Duration> {
        Ok(self.provider(service)?.get_lockout_period(model).await)
    }

    pub async fn list(&self) -> Vec<KeyView> {
        let mut views = Vec::new();
        for provider in self.providers.values() {
            views.extend(provider.list().await);
        }
        views
    }

    pub fn services(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_table_picks_longest_match_order_given() {
        let pool = KeyPool::new(vec![
            ("gpt-".to_string(), "openai".to_string()),
            ("claude-".to_string(), "anthropic".to_string()),
            ("gemini-".to_string(), "google-ai".to_string()),
        ]);
        assert_eq!(pool.service_for_model("gpt-4"), Some("openai"));
        assert_eq!(pool.service_for_model("claude-3-opus-20240229"), Some("anthropic"));
        assert_eq!(pool.service_for_model("gemini-pro"), Some("google-ai"));
        assert_eq!(pool.service_for_model("unknown-model"), None);
    }
}
