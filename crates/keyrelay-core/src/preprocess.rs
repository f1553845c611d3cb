//! C6: validates an inbound body against its claimed dialect, estimates
//! prompt token cost, resolves the target service from the model name,
//! and translates the body into the dialect the bound service expects.
//! Authorization stamping and final serialization happen later, after the
//! queue hands the request a key (see `upstream`), so a credential is
//! bound at the latest possible moment.

use bytes::Bytes;
use keyrelay_protocol::anthropic::messages::CreateMessageRequest;
use keyrelay_protocol::anthropic::text_completion::CompleteRequest;
use keyrelay_protocol::openai::chat::ChatCompletionRequest;
use keyrelay_protocol::openai::completion::CompletionRequest;
use keyrelay_protocol::openai::image::ImageGenerationRequest;
use keyrelay_provider_core::KeyPool;
use keyrelay_transform::{Dialect, RequestBody, transform_request};

use crate::context::RequestContext;
use crate::error::ProxyError;
use crate::tokenizer::TokenEstimator;

/// Everything the router worked out about an inbound request from its
/// route alone, before the body has even been parsed.
pub struct InboundRequest {
    pub inbound: Dialect,
    /// Overrides the model named in the body — used by the
    /// `/v1/claude-3/complete` compatibility route, which forces a fixed
    /// model regardless of what the client sent.
    pub forced_model: Option<String>,
    pub body: Bytes,
}

pub struct Preprocessed {
    pub ctx: RequestContext,
    pub body: RequestBody,
}

/// Parses `bytes` as `dialect`'s canonical request shape. `BadRequest` on
/// any violation — malformed JSON, missing required fields.
fn parse_body(dialect: Dialect, bytes: &Bytes) -> Result<RequestBody, ProxyError> {
    match dialect {
        Dialect::OpenAiChat => serde_json::from_slice::<ChatCompletionRequest>(bytes)
            .map(RequestBody::OpenAiChat)
            .map_err(|e| ProxyError::BadRequest(e.to_string())),
        Dialect::OpenAiText => serde_json::from_slice::<CompletionRequest>(bytes)
            .map(RequestBody::OpenAiText)
            .map_err(|e| ProxyError::BadRequest(e.to_string())),
        Dialect::OpenAiImage => serde_json::from_slice::<ImageGenerationRequest>(bytes)
            .map(RequestBody::OpenAiImage)
            .map_err(|e| ProxyError::BadRequest(e.to_string())),
        Dialect::AnthropicText => serde_json::from_slice::<CompleteRequest>(bytes)
            .map(RequestBody::AnthropicText)
            .map_err(|e| ProxyError::BadRequest(e.to_string())),
        Dialect::AnthropicChat => serde_json::from_slice::<CreateMessageRequest>(bytes)
            .map(RequestBody::AnthropicChat)
            .map_err(|e| ProxyError::BadRequest(e.to_string())),
    }
}

fn model_of(body: &RequestBody) -> &str {
    match body {
        RequestBody::OpenAiChat(r) => &r.model,
        RequestBody::OpenAiText(r) => &r.model,
        RequestBody::OpenAiImage(r) => r.model.as_deref().unwrap_or("dall-e-2"),
        RequestBody::AnthropicText(r) => &r.model,
        RequestBody::AnthropicChat(r) => &r.model,
    }
}

fn set_model(body: &mut RequestBody, model: String) {
    match body {
        RequestBody::OpenAiChat(r) => r.model = model,
        RequestBody::OpenAiText(r) => r.model = model,
        RequestBody::OpenAiImage(r) => r.model = Some(model),
        RequestBody::AnthropicText(r) => r.model = model,
        RequestBody::AnthropicChat(r) => r.model = model,
    }
}

fn prompt_text(body: &RequestBody) -> String {
    match body {
        RequestBody::OpenAiChat(r) => r
            .messages
            .iter()
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n"),
        RequestBody::OpenAiText(r) => r.prompt.clone(),
        RequestBody::OpenAiImage(r) => r.prompt.clone(),
        RequestBody::AnthropicText(r) => r.prompt.clone(),
        RequestBody::AnthropicChat(r) => r
            .messages
            .iter()
            .map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Non-Anthropic services never translate dialect. Within Anthropic,
/// `claude-3*` models always upgrade to `anthropic-chat` outbound — per
/// §6, both `/v1/complete` and the `/v1/claude-3/complete` compatibility
/// route transparently upgrade; everything older (`claude-2`, ...) takes
/// the standard `anthropic-text` mapping instead.
fn outbound_for(inbound: Dialect, service: &str, model: &str) -> Dialect {
    if service != "anthropic" {
        return inbound;
    }
    if model.starts_with("claude-3") {
        return Dialect::AnthropicChat;
    }
    match inbound {
        Dialect::OpenAiChat => Dialect::AnthropicText,
        Dialect::OpenAiText => Dialect::AnthropicText,
        other => other,
    }
}

/// Runs steps 1-3 of the preprocessor pipeline (parse, estimate, translate)
/// and resolves the target service. Steps 4-5 (stamp authorization,
/// finalize body) happen in `upstream` once the queue has bound a key.
pub fn preprocess(
    trace_id: String,
    inbound_request: InboundRequest,
    pool: &KeyPool,
    estimator: &dyn TokenEstimator,
) -> Result<Preprocessed, ProxyError> {
    let InboundRequest { inbound, forced_model, body } = inbound_request;

    let mut parsed = parse_body(inbound, &body)?;
    if let Some(model) = forced_model {
        set_model(&mut parsed, model);
    }

    let model = model_of(&parsed).to_string();
    let prompt_tokens = estimator.estimate(&prompt_text(&parsed));

    let service = pool
        .service_for_model(&model)
        .ok_or_else(|| ProxyError::BadRequest(format!("no service recognizes model '{model}'")))?
        .to_string();

    let outbound = outbound_for(inbound, &service, &model);
    let translated = transform_request(inbound, outbound, parsed)
        .map_err(|e| ProxyError::Unsupported(e.to_string()))?;

    let mut ctx = RequestContext::new(trace_id, inbound, outbound, service, model);
    ctx.prompt_tokens = prompt_tokens;

    Ok(Preprocessed { ctx, body: translated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::KeyPool;

    fn pool() -> KeyPool {
        KeyPool::new(vec![
            ("gpt-".to_string(), "openai".to_string()),
            ("claude-".to_string(), "anthropic".to_string()),
        ])
    }

    #[test]
    fn claude_3_models_upgrade_to_anthropic_chat_outbound() {
        let body = Bytes::from(
            r#"{"model":"claude-3-opus-20240229","prompt":"\n\nHuman: hi\n\nAssistant:","max_tokens_to_sample":10}"#,
        );
        let req = InboundRequest { inbound: Dialect::AnthropicText, forced_model: None, body };
        let estimator = crate::tokenizer::CharHeuristicEstimator;
        let pre = preprocess("t1".to_string(), req, &pool(), &estimator).unwrap();
        assert_eq!(pre.ctx.outbound_api, Dialect::AnthropicChat);
        assert_eq!(pre.ctx.service, "anthropic");
    }

    #[test]
    fn pre_claude_3_models_flatten_to_anthropic_text_not_chat() {
        let body = Bytes::from(r#"{"model":"claude-2","messages":[{"role":"user","content":"hi"}]}"#);
        let req = InboundRequest { inbound: Dialect::OpenAiChat, forced_model: None, body };
        let estimator = crate::tokenizer::CharHeuristicEstimator;
        let pre = preprocess("t1".to_string(), req, &pool(), &estimator).unwrap();
        assert_eq!(pre.ctx.outbound_api, Dialect::AnthropicText);
        assert_eq!(pre.ctx.service, "anthropic");
    }

    #[test]
    fn malformed_body_is_bad_request() {
        let body = Bytes::from(r#"{"model":"gpt-4""#);
        let req = InboundRequest { inbound: Dialect::OpenAiChat, forced_model: None, body };
        let estimator = crate::tokenizer::CharHeuristicEstimator;
        let err = preprocess("t1".to_string(), req, &pool(), &estimator).unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }

    #[test]
    fn forced_model_overrides_body_for_compatibility_route() {
        let body = Bytes::from(r#"{"model":"whatever","prompt":"\n\nHuman: hi\n\nAssistant:","max_tokens_to_sample":10}"#);
        let req = InboundRequest {
            inbound: Dialect::AnthropicText,
            forced_model: Some("claude-3-sonnet-20240229".to_string()),
            body,
        };
        let estimator = crate::tokenizer::CharHeuristicEstimator;
        let pre = preprocess("t1".to_string(), req, &pool(), &estimator).unwrap();
        assert_eq!(pre.ctx.model, "claude-3-sonnet-20240229");
        assert_eq!(pre.ctx.outbound_api, Dialect::AnthropicChat);
    }

    #[test]
    fn unrecognized_model_prefix_is_bad_request() {
        let body = Bytes::from(r#"{"model":"mystery-1","prompt":"hi"}"#);
        let req = InboundRequest { inbound: Dialect::OpenAiText, forced_model: None, body };
        let estimator = crate::tokenizer::CharHeuristicEstimator;
        let err = preprocess("t1".to_string(), req, &pool(), &estimator).unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest(_)));
    }
}
