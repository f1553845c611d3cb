//! C8: dispatches a prepared request to the bound key's upstream,
//! extracts pool-feedback signals from the response (§4.6/§7), and
//! returns either a buffered body or a live chunk stream the router turns
//! into an HTTP response. Grounded on the teacher's
//! `gproxy-provider-impl/src/dispatch/{mod,stream}.rs` split between a
//! native path and a streaming transform path, and on
//! `gproxy-protocol/src/sse.rs`'s buffer-and-resume idiom (reused here via
//! `keyrelay_transform::StreamTransformer`).

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use keyrelay_common::{Headers, header_set};
use keyrelay_provider_core::KeyPool;
use keyrelay_transform::{Dialect, RequestBody, ResponseBody, StreamTransformer, transform_response};
use tracing::warn;

use crate::context::RequestContext;
use crate::error::ProxyError;
use crate::queue::Admission;
use crate::tokenizer::TokenEstimator;

/// Deadline for a non-streaming upstream call, per §5.
pub const NON_STREAMING_DEADLINE: Duration = Duration::from_secs(60);
/// Deadline for a streaming upstream call, per §5.
pub const STREAMING_DEADLINE: Duration = Duration::from_secs(5 * 60);
/// Bounded retry count for a 429 handed back to the queue, per §4.6/§7.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFamily {
    OpenAi,
    Anthropic,
    GoogleAi,
}

/// Per-service base URL and authorization-stamping scheme, §6.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub base_url: String,
    pub family: ServiceFamily,
}

impl ServiceEndpoint {
    fn path_for(&self, dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::OpenAiChat => "/v1/chat/completions",
            Dialect::OpenAiText => "/v1/completions",
            Dialect::OpenAiImage => "/v1/images/generations",
            Dialect::AnthropicText => "/v1/complete",
            Dialect::AnthropicChat => "/v1/messages",
        }
    }

    /// Stamps the bound key's secret onto the outbound request using the
    /// service's expected scheme: Bearer header, `x-api-key` header, or a
    /// `?key=` query parameter.
    fn stamp_auth(&self, secret: &str, url: &mut String, headers: &mut Headers) {
        match self.family {
            ServiceFamily::OpenAi => {
                header_set(headers, "Authorization", format!("Bearer {secret}"));
            }
            ServiceFamily::Anthropic => {
                header_set(headers, "x-api-key", secret);
                header_set(headers, "anthropic-version", "2023-06-01");
            }
            ServiceFamily::GoogleAi => {
                let sep = if url.contains('?') { '&' } else { '?' };
                url.push(sep);
                url.push_str("key=");
                url.push_str(secret);
            }
        }
    }
}

fn is_billing_failure(status: u16, body: &[u8]) -> bool {
    if !matches!(status, 402 | 403 | 429) {
        return false;
    }
    let text = String::from_utf8_lossy(body);
    text.contains("insufficient_quota") || text.contains("billing") || text.contains("exceeded your current quota")
}

pub enum UpstreamOutcome {
    Buffered {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    Streaming {
        status: u16,
        headers: Headers,
        stream: Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>,
    },
}

fn request_body_to_json(body: &RequestBody) -> serde_json::Value {
    match body {
        RequestBody::OpenAiChat(r) => serde_json::to_value(r),
        RequestBody::OpenAiText(r) => serde_json::to_value(r),
        RequestBody::OpenAiImage(r) => serde_json::to_value(r),
        RequestBody::AnthropicText(r) => serde_json::to_value(r),
        RequestBody::AnthropicChat(r) => serde_json::to_value(r),
    }
    .unwrap_or(serde_json::Value::Null)
}

fn wants_stream(body: &RequestBody) -> bool {
    match body {
        RequestBody::OpenAiChat(r) => r.stream,
        RequestBody::OpenAiText(r) => r.stream,
        RequestBody::OpenAiImage(_) => false,
        RequestBody::AnthropicText(r) => r.stream,
        RequestBody::AnthropicChat(r) => r.stream,
    }
}

fn response_text(body: &ResponseBody) -> String {
    match body {
        ResponseBody::OpenAiChat(r) => r
            .choices
            .first()
            .map(|c| c.message.content.as_text())
            .unwrap_or_default(),
        ResponseBody::OpenAiText(r) => r.choices.first().map(|c| c.text.clone()).unwrap_or_default(),
        ResponseBody::OpenAiImage(_) => String::new(),
        ResponseBody::AnthropicText(r) => r.completion.clone(),
        ResponseBody::AnthropicChat(r) => r.text(),
    }
}

fn wreq_headers_to_headers(headers: &wreq::header::HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

/// Dispatches a dequeued, key-bound request to its service's upstream.
/// One instance is shared across every request; it holds the HTTP client
/// and the per-service endpoint table.
pub struct UpstreamProxy {
    client: wreq::Client,
    endpoints: HashMap<String, ServiceEndpoint>,
}

impl UpstreamProxy {
    pub fn new(client: wreq::Client) -> Self {
        Self { client, endpoints: HashMap::new() }
    }

    pub fn register(&mut self, service: impl Into<String>, endpoint: ServiceEndpoint) {
        self.endpoints.insert(service.into(), endpoint);
    }

    fn endpoint(&self, service: &str) -> Result<&ServiceEndpoint, ProxyError> {
        self.endpoints
            .get(service)
            .ok_or_else(|| ProxyError::Unsupported(format!("no upstream endpoint registered for {service}")))
    }

    /// Runs the full dispatch-and-signal-extraction loop: send, classify
    /// the response, apply the matching pool feedback, and bound-retry
    /// with a fresh key on the retryable rows of the error taxonomy.
    ///
    /// `admission` owns the concurrency-gate permit (§5) for the whole
    /// call, including any retries onto a fresh key. For a buffered
    /// response it is simply dropped when this function returns; for a
    /// streaming response it is moved into the stream's state so the
    /// slot stays occupied until the client has consumed the last chunk.
    pub async fn dispatch(
        &self,
        pool: &KeyPool,
        estimator: &dyn TokenEstimator,
        ctx: &mut RequestContext,
        body: RequestBody,
        outbound_headers: Headers,
        admission: Admission,
    ) -> Result<UpstreamOutcome, ProxyError> {
        let streaming = wants_stream(&body);
        let payload = request_body_to_json(&body);
        let mut rate_limit_attempts = 0u32;
        let mut server_error_retried = false;
        let mut auth_retried = false;

        loop {
            let handle = ctx.key.clone().ok_or(ProxyError::Cancelled)?;
            let endpoint = self.endpoint(&ctx.service)?;
            let mut url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), endpoint.path_for(ctx.outbound_api));
            let mut headers = outbound_headers.clone();
            endpoint.stamp_auth(&handle.secret, &mut url, &mut headers);

            let deadline = if streaming { STREAMING_DEADLINE } else { NON_STREAMING_DEADLINE };
            let mut request = self.client.post(&url).json(&payload);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = match tokio::time::timeout(deadline, request.send()).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(err)) => return Err(ProxyError::UpstreamServer(err.to_string())),
                Err(_elapsed) => return Err(ProxyError::Timeout),
            };

            let status = response.status().as_u16();
            let response_headers = wreq_headers_to_headers(response.headers());

            if status == 402 || status == 401 || status == 403 {
                let body_bytes = response.bytes().await.unwrap_or_default();
                let billing = status == 402 || is_billing_failure(status, &body_bytes);
                if billing {
                    let _ = pool.revoke(&ctx.service, &handle.hash).await;
                } else {
                    let _ = pool.disable(&ctx.service, &handle.hash).await;
                }
                if !auth_retried && pool.available(&ctx.service).await.unwrap_or(0) > 0 {
                    auth_retried = true;
                    if let Ok((_, fresh)) = pool.get(&ctx.model).await {
                        ctx.bind_key(fresh);
                        continue;
                    }
                }
                return Err(if billing { ProxyError::UpstreamBilling } else { ProxyError::UpstreamAuth });
            }

            if status == 429 {
                let body_bytes = response.bytes().await.unwrap_or_default();
                if is_billing_failure(status, &body_bytes) {
                    let _ = pool.revoke(&ctx.service, &handle.hash).await;
                    if pool.available(&ctx.service).await.unwrap_or(0) > 0 {
                        if let Ok((_, fresh)) = pool.get(&ctx.model).await {
                            ctx.bind_key(fresh);
                            continue;
                        }
                    }
                    return Err(ProxyError::UpstreamBilling);
                }
                let _ = pool.mark_rate_limited(&ctx.service, &handle.hash).await;
                rate_limit_attempts += 1;
                if rate_limit_attempts < MAX_RATE_LIMIT_RETRIES {
                    if let Ok((_, fresh)) = pool.get(&ctx.model).await {
                        ctx.bind_key(fresh);
                        continue;
                    }
                }
                return Err(ProxyError::UpstreamRateLimit);
            }

            if status >= 500 {
                if !server_error_retried {
                    server_error_retried = true;
                    if let Ok((_, fresh)) = pool.get(&ctx.model).await {
                        ctx.bind_key(fresh);
                        continue;
                    }
                }
                let body_bytes = response.bytes().await.unwrap_or_default();
                warn!(trace_id = %ctx.trace_id, status, "upstream server error, passing through");
                return Ok(UpstreamOutcome::Buffered { status, headers: response_headers, body: body_bytes });
            }

            if status >= 400 {
                // Any other client error (400 malformed translation, 404,
                // 422, ...) is the caller's problem, not the key's; pass it
                // through untouched rather than penalising the credential.
                let body_bytes = response.bytes().await.unwrap_or_default();
                return Ok(UpstreamOutcome::Buffered { status, headers: response_headers, body: body_bytes });
            }

            // 2xx: success bookkeeping, then either stream or buffer.
            let _ = pool.increment_prompt(&ctx.service, &handle.hash).await;
            if let Some(openai_headers) = openai_rate_limit_headers(&response_headers) {
                let _ = pool.update_rate_limits(&ctx.service, &handle.hash, &openai_headers).await;
            }

            if streaming {
                let transformer = StreamTransformer::new(ctx.inbound_api, ctx.outbound_api)
                    .map_err(|e| ProxyError::Unsupported(e.to_string()))?;
                return Ok(Self::stream_response(transformer, response, status, response_headers, admission));
            }

            let body_bytes = response.bytes().await.unwrap_or_default();
            let output_estimate = translate_and_estimate(ctx, &body_bytes, estimator);
            let _ = pool
                .increment_usage(&ctx.service, &handle.hash, &ctx.model, u64::from(output_estimate))
                .await;
            ctx.output_tokens = output_estimate;

            let translated = translate_response_body(ctx, body_bytes)?;
            return Ok(UpstreamOutcome::Buffered { status, headers: response_headers, body: translated });
        }
    }

    fn stream_response(
        transformer: StreamTransformer,
        response: wreq::Response,
        status: u16,
        headers: Headers,
        admission: Admission,
    ) -> UpstreamOutcome {
        let upstream = response.bytes_stream();

        // `admission` rides along in the unfold state purely to be
        // dropped with it: once the stream is exhausted (or the client
        // disconnects and drops the whole `Body`), the permit it holds is
        // released and the concurrency gate's slot frees up.
        let transformed = futures_util::stream::unfold(
            (upstream, transformer, Vec::<u8>::new(), admission),
            |(mut upstream, mut transformer, mut accumulated, admission)| async move {
                loop {
                    match upstream.next().await {
                        Some(Ok(chunk)) => {
                            let (remainder, out) = transformer.push(accumulated, &chunk);
                            accumulated = remainder;
                            if !out.is_empty() {
                                return Some((Ok(Bytes::from(out)), (upstream, transformer, accumulated, admission)));
                            }
                        }
                        Some(Err(err)) => {
                            return Some((
                                Err(ProxyError::UpstreamServer(err.to_string())),
                                (upstream, transformer, accumulated, admission),
                            ));
                        }
                        None => return None,
                    }
                }
            },
        );

        UpstreamOutcome::Streaming { status, headers, stream: Box::pin(transformed) }
    }
}

fn openai_rate_limit_headers(headers: &Headers) -> Option<Headers> {
    let relevant: Headers = headers
        .iter()
        .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-ratelimit-"))
        .cloned()
        .collect();
    (!relevant.is_empty()).then_some(relevant)
}

/// Parses the upstream's native response body, translates it back to the
/// inbound dialect if needed, and returns a rough output-token count.
fn translate_and_estimate(ctx: &RequestContext, body: &Bytes, estimator: &dyn TokenEstimator) -> u32 {
    let parsed = match ctx.outbound_api {
        Dialect::OpenAiChat => serde_json::from_slice(body).ok().map(ResponseBody::OpenAiChat),
        Dialect::OpenAiText => serde_json::from_slice(body).ok().map(ResponseBody::OpenAiText),
        Dialect::OpenAiImage => serde_json::from_slice(body).ok().map(ResponseBody::OpenAiImage),
        Dialect::AnthropicText => serde_json::from_slice(body).ok().map(ResponseBody::AnthropicText),
        Dialect::AnthropicChat => serde_json::from_slice(body).ok().map(ResponseBody::AnthropicChat),
    };
    let Some(parsed) = parsed else {
        return estimator.estimate(&String::from_utf8_lossy(body));
    };
    estimator.estimate(&response_text(&parsed))
}

/// Translates a buffered upstream response body back to the dialect the
/// client is expecting, leaving it untouched if inbound == outbound.
pub fn translate_response_body(ctx: &RequestContext, body: Bytes) -> Result<Bytes, ProxyError> {
    if ctx.inbound_api == ctx.outbound_api {
        return Ok(body);
    }
    let parsed: ResponseBody = match ctx.outbound_api {
        Dialect::OpenAiChat => serde_json::from_slice(&body)
            .map(ResponseBody::OpenAiChat)
            .map_err(|e| ProxyError::UpstreamServer(e.to_string()))?,
        Dialect::OpenAiText => serde_json::from_slice(&body)
            .map(ResponseBody::OpenAiText)
            .map_err(|e| ProxyError::UpstreamServer(e.to_string()))?,
        Dialect::OpenAiImage => serde_json::from_slice(&body)
            .map(ResponseBody::OpenAiImage)
            .map_err(|e| ProxyError::UpstreamServer(e.to_string()))?,
        Dialect::AnthropicText => serde_json::from_slice(&body)
            .map(ResponseBody::AnthropicText)
            .map_err(|e| ProxyError::UpstreamServer(e.to_string()))?,
        Dialect::AnthropicChat => serde_json::from_slice(&body)
            .map(ResponseBody::AnthropicChat)
            .map_err(|e| ProxyError::UpstreamServer(e.to_string()))?,
    };
    let translated = transform_response(ctx.inbound_api, ctx.outbound_api, parsed)
        .map_err(|e| ProxyError::Unsupported(e.to_string()))?;
    let json = match translated {
        ResponseBody::OpenAiChat(r) => serde_json::to_vec(&r),
        ResponseBody::OpenAiText(r) => serde_json::to_vec(&r),
        ResponseBody::OpenAiImage(r) => serde_json::to_vec(&r),
        ResponseBody::AnthropicText(r) => serde_json::to_vec(&r),
        ResponseBody::AnthropicChat(r) => serde_json::to_vec(&r),
    }
    .map_err(|e| ProxyError::UpstreamServer(e.to_string()))?;
    Ok(Bytes::from(json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_failure_is_detected_from_body_text() {
        assert!(is_billing_failure(429, b"{\"error\":{\"code\":\"insufficient_quota\"}}"));
        assert!(!is_billing_failure(429, b"{\"error\":{\"code\":\"rate_limit_exceeded\"}}"));
        assert!(!is_billing_failure(500, b"insufficient_quota"));
    }

    #[test]
    fn openai_rate_limit_headers_filters_prefix() {
        let headers = vec![
            ("x-ratelimit-remaining-requests".to_string(), "10".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ];
        let filtered = openai_rate_limit_headers(&headers).unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn no_rate_limit_headers_yields_none() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        assert!(openai_rate_limit_headers(&headers).is_none());
    }
}
