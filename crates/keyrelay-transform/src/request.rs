use std::collections::HashMap;
use std::sync::OnceLock;

use keyrelay_protocol::anthropic::messages::{CreateMessageRequest, MessageContent, MessageParam, MessageRole};
use keyrelay_protocol::anthropic::text_completion::CompleteRequest;
use keyrelay_protocol::openai::chat::{ChatCompletionRequest, ChatMessage, Role, StopSequences};

use crate::body::RequestBody;
use crate::dialect::Dialect;
use crate::error::TransformError;

type RequestFn = fn(RequestBody) -> Result<RequestBody, TransformError>;

fn request_table() -> &'static HashMap<(Dialect, Dialect), RequestFn> {
    static TABLE: OnceLock<HashMap<(Dialect, Dialect), RequestFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use Dialect::*;
        HashMap::from([
            ((OpenAiChat, OpenAiChat), identity_openai_chat as RequestFn),
            ((OpenAiChat, AnthropicText), openai_chat_to_anthropic_text as RequestFn),
            ((OpenAiChat, AnthropicChat), openai_chat_to_anthropic_chat as RequestFn),
            ((OpenAiText, OpenAiChat), openai_text_to_openai_chat as RequestFn),
            ((OpenAiText, AnthropicText), openai_text_to_anthropic_text as RequestFn),
            ((AnthropicText, AnthropicChat), anthropic_text_to_anthropic_chat as RequestFn),
            ((AnthropicText, AnthropicText), identity_anthropic_text as RequestFn),
            ((AnthropicChat, AnthropicChat), identity_anthropic_chat as RequestFn),
            ((OpenAiImage, OpenAiImage), identity_openai_image as RequestFn),
        ])
    })
}

/// Looks up `(inbound, outbound)` in the table populated above and applies
/// it. Pairs missing from the table fail here, at request entry, rather
/// than partway through a half-applied transform.
pub fn transform_request(
    inbound: Dialect,
    outbound: Dialect,
    body: RequestBody,
) -> Result<RequestBody, TransformError> {
    match request_table().get(&(inbound, outbound)) {
        Some(transform) => transform(body),
        None => Err(TransformError::Unsupported { inbound, outbound }),
    }
}

fn identity_openai_chat(body: RequestBody) -> Result<RequestBody, TransformError> {
    match body {
        RequestBody::OpenAiChat(req) => Ok(RequestBody::OpenAiChat(req)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn identity_anthropic_text(body: RequestBody) -> Result<RequestBody, TransformError> {
    match body {
        RequestBody::AnthropicText(req) => Ok(RequestBody::AnthropicText(req)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn identity_anthropic_chat(body: RequestBody) -> Result<RequestBody, TransformError> {
    match body {
        RequestBody::AnthropicChat(req) => Ok(RequestBody::AnthropicChat(req)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn identity_openai_image(body: RequestBody) -> Result<RequestBody, TransformError> {
    match body {
        RequestBody::OpenAiImage(req) => Ok(RequestBody::OpenAiImage(req)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn stop_sequences_to_vec(stop: Option<StopSequences>) -> Option<Vec<String>> {
    match stop {
        Some(StopSequences::Single(s)) => Some(vec![s]),
        Some(StopSequences::Many(v)) => Some(v),
        None => None,
    }
}

/// Flattens a messages array into a single prompt using `\n\nHuman:` /
/// `\n\nAssistant:` markers, terminated with a trailing `\n\nAssistant:`.
/// System messages are folded in as plain text ahead of the first turn.
fn openai_chat_to_anthropic_text(body: RequestBody) -> Result<RequestBody, TransformError> {
    let RequestBody::OpenAiChat(req) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let mut prompt = String::new();
    for message in &req.messages {
        let text = message.content.as_text();
        match message.role {
            Role::System => {
                if !text.is_empty() {
                    prompt.push_str(&text);
                    prompt.push('\n');
                }
            }
            Role::User => {
                prompt.push_str("\n\nHuman: ");
                prompt.push_str(&text);
            }
            Role::Assistant => {
                prompt.push_str("\n\nAssistant: ");
                prompt.push_str(&text);
            }
        }
    }
    prompt.push_str("\n\nAssistant:");

    Ok(RequestBody::AnthropicText(CompleteRequest {
        model: req.model,
        prompt,
        max_tokens_to_sample: req.max_tokens.unwrap_or(1024),
        stop_sequences: stop_sequences_to_vec(req.stop),
        temperature: req.temperature,
        stream: req.stream,
    }))
}

/// Direct upgrade to Anthropic's native chat dialect: roles map across
/// one-for-one, the lone `system` message (if any) is hoisted to the
/// top-level `system` field.
fn openai_chat_to_anthropic_chat(body: RequestBody) -> Result<RequestBody, TransformError> {
    let RequestBody::OpenAiChat(req) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let mut system = None;
    let mut messages = Vec::with_capacity(req.messages.len());
    for message in req.messages {
        let text = message.content.as_text();
        match message.role {
            Role::System => system = Some(text),
            Role::User => messages.push(MessageParam {
                role: MessageRole::User,
                content: MessageContent::Text(text),
            }),
            Role::Assistant => messages.push(MessageParam {
                role: MessageRole::Assistant,
                content: MessageContent::Text(text),
            }),
        }
    }

    Ok(RequestBody::AnthropicChat(CreateMessageRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens.unwrap_or(1024),
        system,
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: stop_sequences_to_vec(req.stop),
        stream: req.stream,
    }))
}

fn openai_text_to_openai_chat(body: RequestBody) -> Result<RequestBody, TransformError> {
    let RequestBody::OpenAiText(req) = body else {
        return Err(TransformError::BodyMismatch);
    };

    Ok(RequestBody::OpenAiChat(ChatCompletionRequest {
        model: req.model,
        messages: vec![ChatMessage {
            role: Role::User,
            content: keyrelay_protocol::openai::chat::MessageContent::Text(req.prompt),
            name: None,
        }],
        temperature: req.temperature,
        top_p: None,
        max_tokens: req.max_tokens,
        stop: req.stop,
        stream: req.stream,
        user: None,
        extra: serde_json::Map::new(),
    }))
}

fn openai_text_to_anthropic_text(body: RequestBody) -> Result<RequestBody, TransformError> {
    let RequestBody::OpenAiText(req) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let prompt = format!("\n\nHuman: {}\n\nAssistant:", req.prompt);

    Ok(RequestBody::AnthropicText(CompleteRequest {
        model: req.model,
        prompt,
        max_tokens_to_sample: req.max_tokens.unwrap_or(1024),
        stop_sequences: stop_sequences_to_vec(req.stop),
        temperature: req.temperature,
        stream: req.stream,
    }))
}

/// Splits a flattened `\n\nHuman:` / `\n\nAssistant:` prompt back into an
/// alternating message list, recovering the system text (anything ahead
/// of the first marker) as a top-level field.
fn anthropic_text_to_anthropic_chat(body: RequestBody) -> Result<RequestBody, TransformError> {
    let RequestBody::AnthropicText(req) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let (system, turns) = split_human_assistant_turns(&req.prompt);
    let messages = turns
        .into_iter()
        .map(|(role, text)| MessageParam {
            role,
            content: MessageContent::Text(text),
        })
        .collect();

    Ok(RequestBody::AnthropicChat(CreateMessageRequest {
        model: req.model,
        messages,
        max_tokens: req.max_tokens_to_sample,
        system,
        temperature: req.temperature,
        top_p: None,
        stop_sequences: req.stop_sequences,
        stream: req.stream,
    }))
}

fn split_human_assistant_turns(prompt: &str) -> (Option<String>, Vec<(MessageRole, String)>) {
    const HUMAN: &str = "\n\nHuman:";
    const ASSISTANT: &str = "\n\nAssistant:";

    let mut markers: Vec<(usize, MessageRole)> = Vec::new();
    for marker in [HUMAN, ASSISTANT] {
        let role = if marker == HUMAN {
            MessageRole::User
        } else {
            MessageRole::Assistant
        };
        let mut from = 0;
        while let Some(rel) = prompt[from..].find(marker) {
            markers.push((from + rel, role));
            from += rel + marker.len();
        }
    }
    markers.sort_by_key(|(pos, _)| *pos);

    let system = markers.first().and_then(|(pos, _)| {
        let head = prompt[..*pos].trim();
        (!head.is_empty()).then(|| head.to_string())
    });

    let mut turns = Vec::new();
    for (idx, (pos, role)) in markers.iter().enumerate() {
        let marker_len = match role {
            MessageRole::User => HUMAN.len(),
            MessageRole::Assistant => ASSISTANT.len(),
        };
        let start = pos + marker_len;
        let end = markers.get(idx + 1).map(|(p, _)| *p).unwrap_or(prompt.len());
        let text = prompt[start..end].trim().to_string();
        if !text.is_empty() {
            turns.push((*role, text));
        }
    }

    (system, turns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_protocol::openai::chat::{ChatMessage, MessageContent};
    use keyrelay_protocol::openai::image::ImageGenerationRequest;

    fn sample_chat() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-2".to_string(),
            messages: vec![
                ChatMessage {
                    role: Role::System,
                    content: MessageContent::Text("be terse".to_string()),
                    name: None,
                },
                ChatMessage {
                    role: Role::User,
                    content: MessageContent::Text("hi".to_string()),
                    name: None,
                },
            ],
            temperature: None,
            top_p: None,
            max_tokens: Some(256),
            stop: None,
            stream: false,
            user: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn flattens_messages_with_markers() {
        let result =
            transform_request(Dialect::OpenAiChat, Dialect::AnthropicText, RequestBody::OpenAiChat(sample_chat()))
                .unwrap();
        let RequestBody::AnthropicText(req) = result else {
            panic!("wrong variant");
        };
        assert_eq!(req.prompt, "be terse\n\nHuman: hi\n\nAssistant:");
    }

    #[test]
    fn round_trips_flattened_prompt_into_messages() {
        let flattened =
            transform_request(Dialect::OpenAiChat, Dialect::AnthropicText, RequestBody::OpenAiChat(sample_chat()))
                .unwrap();
        let rebuilt = transform_request(Dialect::AnthropicText, Dialect::AnthropicChat, flattened).unwrap();
        let RequestBody::AnthropicChat(req) = rebuilt else {
            panic!("wrong variant");
        };
        assert_eq!(req.system.as_deref(), Some("be terse"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].content.as_text(), "hi");
    }

    #[test]
    fn unsupported_pair_fails_at_entry() {
        let err = transform_request(Dialect::OpenAiImage, Dialect::AnthropicChat, RequestBody::OpenAiImage(
            ImageGenerationRequest { prompt: "x".to_string(), model: None, n: None, size: None },
        ))
        .unwrap_err();
        assert_eq!(
            err,
            TransformError::Unsupported { inbound: Dialect::OpenAiImage, outbound: Dialect::AnthropicChat }
        );
    }
}
