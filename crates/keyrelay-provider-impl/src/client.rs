use std::sync::OnceLock;

use crate::checker::{KeyProbe, ProbeOutcome, ProbeResult};

static SHARED_CLIENT: OnceLock<wreq::Client> = OnceLock::new();

fn shared_client() -> wreq::Client {
    SHARED_CLIENT
        .get_or_init(|| wreq::Client::builder().build().expect("default client config is valid"))
        .clone()
}

/// Probes an OpenAI-compatible key by listing models; a 200 response with
/// at least one chat-capable id counts as healthy.
pub struct OpenAiProbe {
    pub base_url: String,
}

impl Default for OpenAiProbe {
    fn default() -> Self {
        Self { base_url: "https://api.openai.com".to_string() }
    }
}

#[async_trait::async_trait]
impl KeyProbe for OpenAiProbe {
    async fn probe(&self, secret: &str) -> ProbeResult {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let response = shared_client()
            .get(&url)
            .bearer_auth(secret)
            .send()
            .await;
        classify_response(response, |body| {
            body.get("data")
                .and_then(|v| v.as_array())
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["gpt-4".to_string(), "gpt-3.5-turbo".to_string()])
        })
        .await
    }
}

/// Probes an Anthropic key with a `GET /v1/models` call, treating any
/// non-auth, non-quota response as proof the key itself is accepted.
pub struct AnthropicProbe {
    pub base_url: String,
    pub version: String,
}

impl Default for AnthropicProbe {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            version: "2023-06-01".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl KeyProbe for AnthropicProbe {
    async fn probe(&self, secret: &str) -> ProbeResult {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let response = shared_client()
            .get(&url)
            .header("x-api-key", secret)
            .header("anthropic-version", &self.version)
            .send()
            .await;
        classify_response(response, |body| {
            body.get("data")
                .and_then(|v| v.as_array())
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["claude-3-opus-20240229".to_string(), "claude-2.1".to_string()])
        })
        .await
    }
}

/// Probes a Google AI Studio key. Credentials travel as a `?key=` query
/// parameter rather than a header.
pub struct GoogleProbe {
    pub base_url: String,
}

impl Default for GoogleProbe {
    fn default() -> Self {
        Self { base_url: "https://generativelanguage.googleapis.com".to_string() }
    }
}

#[async_trait::async_trait]
impl KeyProbe for GoogleProbe {
    async fn probe(&self, secret: &str) -> ProbeResult {
        let url = format!("{}/v1beta/models", self.base_url.trim_end_matches('/'));
        let response = shared_client()
            .get(&url)
            .query(&[("key", secret)])
            .send()
            .await;
        classify_response(response, |body| {
            body.get("models")
                .and_then(|v| v.as_array())
                .map(|models| {
                    models
                        .iter()
                        .filter_map(|m| m.get("name").and_then(|id| id.as_str()))
                        .map(|name| name.trim_start_matches("models/").to_string())
                        .collect()
                })
                .unwrap_or_else(|| vec!["gemini-pro".to_string()])
        })
        .await
    }
}

/// A 402, or a 403/429 whose body names a billing/quota reason, is the
/// terminal "this credential is permanently unusable" signal (§4.1). A
/// bare 429 with no billing signal is just a transient rate limit — it
/// must not disable the key (§4.1, §7 UpstreamRateLimit vs UpstreamBilling).
fn is_billing_failure(status: u16, body: &[u8]) -> bool {
    if status == 402 {
        return true;
    }
    if !matches!(status, 403 | 429) {
        return false;
    }
    let text = String::from_utf8_lossy(body);
    text.contains("insufficient_quota") || text.contains("billing") || text.contains("exceeded your current quota")
}

async fn classify_response(
    response: Result<wreq::Response, wreq::Error>,
    extract_families: impl FnOnce(&serde_json::Value) -> Vec<String>,
) -> ProbeResult {
    let response = match response {
        Ok(resp) => resp,
        Err(_) => {
            return ProbeResult {
                outcome: ProbeOutcome::Transient,
                model_families: Vec::new(),
            };
        }
    };

    let status = response.status().as_u16();
    if matches!(status, 401 | 402 | 403 | 429) {
        let body = response.bytes().await.unwrap_or_default();
        let outcome = if is_billing_failure(status, &body) {
            ProbeOutcome::QuotaFailure
        } else if status == 401 || status == 403 {
            ProbeOutcome::AuthFailure
        } else {
            // Bare 429: transient rate limit, not a credential failure.
            ProbeOutcome::Transient
        };
        return ProbeResult { outcome, model_families: Vec::new() };
    }
    if status >= 500 {
        return ProbeResult {
            outcome: ProbeOutcome::Transient,
            model_families: Vec::new(),
        };
    }

    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    ProbeResult {
        outcome: ProbeOutcome::Ok,
        model_families: extract_families(&body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_429_is_not_a_billing_failure() {
        assert!(!is_billing_failure(429, b"{\"error\":{\"message\":\"rate limit exceeded\"}}"));
    }

    #[test]
    fn billing_signalled_429_is_a_billing_failure() {
        assert!(is_billing_failure(429, b"{\"error\":{\"code\":\"insufficient_quota\"}}"));
    }

    #[test]
    fn bare_402_is_always_a_billing_failure() {
        assert!(is_billing_failure(402, b""));
    }
}
