//! Streaming transforms follow the cursor contract from
//! `keyrelay_protocol::sse`: feed `(accumulated bytes, new chunk)`, get
//! back `(new accumulated bytes, fully decoded output bytes)`. No HTTP
//! stack is involved, so this is unit-testable on plain byte slices.

use keyrelay_protocol::anthropic::messages::{ContentBlockDelta, MessageStreamEvent};
use keyrelay_protocol::anthropic::text_completion::CompletionStreamEvent;
use keyrelay_protocol::openai::chat::{
    ChatCompletionChunk, ChatCompletionChunkChoice, ChatCompletionDelta, Role,
};
use keyrelay_protocol::sse::{self, SseEvent};

use crate::dialect::Dialect;
use crate::error::TransformError;

pub enum StreamTransformer {
    Passthrough,
    AnthropicTextToOpenAiChat(AnthropicTextToOpenAiChatState),
    AnthropicChatToOpenAiChat(AnthropicChatToOpenAiChatState),
    AnthropicChatToAnthropicText(AnthropicChatToAnthropicTextState),
}

impl StreamTransformer {
    pub fn new(inbound: Dialect, outbound: Dialect) -> Result<Self, TransformError> {
        use Dialect::*;
        match (inbound, outbound) {
            (OpenAiChat, OpenAiChat)
            | (OpenAiText, OpenAiText)
            | (AnthropicText, AnthropicText)
            | (AnthropicChat, AnthropicChat)
            | (OpenAiImage, OpenAiImage) => Ok(Self::Passthrough),
            (OpenAiChat, AnthropicText) | (OpenAiText, AnthropicText) => {
                Ok(Self::AnthropicTextToOpenAiChat(AnthropicTextToOpenAiChatState::default()))
            }
            (OpenAiChat, AnthropicChat) => {
                Ok(Self::AnthropicChatToOpenAiChat(AnthropicChatToOpenAiChatState::default()))
            }
            (AnthropicText, AnthropicChat) => {
                Ok(Self::AnthropicChatToAnthropicText(AnthropicChatToAnthropicTextState::default()))
            }
            _ => Err(TransformError::Unsupported { inbound, outbound }),
        }
    }

    /// Advances the cursor by one chunk. `[DONE]` passes through
    /// unchanged; an event this transformer doesn't recognise is skipped
    /// rather than killing the stream.
    pub fn push(&mut self, accumulated: Vec<u8>, chunk: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let (remainder, events) = sse::decode_step(accumulated, chunk);
        let mut out = Vec::new();
        for event in &events {
            if event.data.trim() == "[DONE]" {
                out.extend(sse::encode_event(None, "[DONE]"));
                continue;
            }
            if let Some(bytes) = self.translate(event) {
                out.extend(bytes);
            }
        }
        (remainder, out)
    }

    fn translate(&mut self, event: &SseEvent) -> Option<Vec<u8>> {
        match self {
            StreamTransformer::Passthrough => {
                Some(sse::encode_event(event.event.as_deref(), &event.data))
            }
            StreamTransformer::AnthropicTextToOpenAiChat(state) => state.translate(event),
            StreamTransformer::AnthropicChatToOpenAiChat(state) => state.translate(event),
            StreamTransformer::AnthropicChatToAnthropicText(state) => state.translate(event),
        }
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn encode_chunk(chunk: &ChatCompletionChunk) -> Option<Vec<u8>> {
    serde_json::to_string(chunk).ok().map(|json| sse::encode_event(None, &json))
}

#[derive(Default)]
pub struct AnthropicTextToOpenAiChatState {
    id: Option<String>,
    sent_role: bool,
}

impl AnthropicTextToOpenAiChatState {
    fn translate(&mut self, event: &SseEvent) -> Option<Vec<u8>> {
        let parsed: CompletionStreamEvent = serde_json::from_str(&event.data).ok()?;
        let id = self
            .id
            .get_or_insert_with(|| format!("chatcmpl-{}", unix_timestamp()))
            .clone();
        let role = if self.sent_role {
            None
        } else {
            self.sent_role = true;
            Some(Role::Assistant)
        };

        encode_chunk(&ChatCompletionChunk {
            id,
            object: "chat.completion.chunk".to_string(),
            created: unix_timestamp(),
            model: parsed.model,
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta: ChatCompletionDelta { role, content: Some(parsed.completion) },
                finish_reason: parsed.stop_reason,
            }],
        })
    }
}

#[derive(Default)]
pub struct AnthropicChatToOpenAiChatState {
    id: String,
    model: String,
}

impl AnthropicChatToOpenAiChatState {
    fn translate(&mut self, event: &SseEvent) -> Option<Vec<u8>> {
        let parsed: MessageStreamEvent = serde_json::from_str(&event.data).ok()?;
        match parsed {
            MessageStreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                encode_chunk(&ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: unix_timestamp(),
                    model: self.model.clone(),
                    choices: vec![ChatCompletionChunkChoice {
                        index: 0,
                        delta: ChatCompletionDelta { role: Some(Role::Assistant), content: None },
                        finish_reason: None,
                    }],
                })
            }
            MessageStreamEvent::ContentBlockDelta { delta: ContentBlockDelta::TextDelta { text }, .. } => {
                encode_chunk(&ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: unix_timestamp(),
                    model: self.model.clone(),
                    choices: vec![ChatCompletionChunkChoice {
                        index: 0,
                        delta: ChatCompletionDelta { role: None, content: Some(text) },
                        finish_reason: None,
                    }],
                })
            }
            MessageStreamEvent::MessageDelta { delta, .. } => encode_chunk(&ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: unix_timestamp(),
                model: self.model.clone(),
                choices: vec![ChatCompletionChunkChoice {
                    index: 0,
                    delta: ChatCompletionDelta::default(),
                    finish_reason: delta.stop_reason,
                }],
            }),
            MessageStreamEvent::MessageStop => Some(sse::encode_event(None, "[DONE]")),
        }
    }
}

#[derive(Default)]
pub struct AnthropicChatToAnthropicTextState {
    model: String,
}

impl AnthropicChatToAnthropicTextState {
    fn translate(&mut self, event: &SseEvent) -> Option<Vec<u8>> {
        let parsed: MessageStreamEvent = serde_json::from_str(&event.data).ok()?;
        let encode = |completion: String, stop_reason: Option<String>, model: &str| {
            let evt = CompletionStreamEvent {
                kind: "completion".to_string(),
                completion,
                model: model.to_string(),
                stop_reason,
            };
            serde_json::to_string(&evt).ok().map(|json| sse::encode_event(None, &json))
        };

        match parsed {
            MessageStreamEvent::MessageStart { message } => {
                self.model = message.model;
                None
            }
            MessageStreamEvent::ContentBlockDelta { delta: ContentBlockDelta::TextDelta { text }, .. } => {
                encode(text, None, &self.model)
            }
            MessageStreamEvent::MessageDelta { delta, .. } => encode(String::new(), delta.stop_reason, &self.model),
            MessageStreamEvent::MessageStop => Some(sse::encode_event(None, "[DONE]")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_echoes_bytes_unchanged() {
        let mut xform = StreamTransformer::new(Dialect::OpenAiChat, Dialect::OpenAiChat).unwrap();
        let wire = sse::encode_event(None, r#"{"id":"1"}"#);
        let (remainder, out) = xform.push(Vec::new(), &wire);
        assert!(remainder.is_empty());
        assert_eq!(out, wire);
    }

    #[test]
    fn done_sentinel_passes_through_every_transformer() {
        let mut xform = StreamTransformer::new(Dialect::OpenAiChat, Dialect::AnthropicChat).unwrap();
        let wire = sse::encode_event(None, "[DONE]");
        let (_, out) = xform.push(Vec::new(), &wire);
        assert_eq!(out, wire);
    }

    #[test]
    fn anthropic_message_stream_becomes_openai_chunks() {
        let mut xform = StreamTransformer::new(Dialect::OpenAiChat, Dialect::AnthropicChat).unwrap();
        let start = sse::encode_event(
            Some("message_start"),
            r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-opus-20240229","role":"assistant"}}"#,
        );
        let delta = sse::encode_event(
            Some("content_block_delta"),
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
        );

        let mut combined = start;
        combined.extend(delta);
        let (_, out) = xform.push(Vec::new(), &combined);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.contains("\"content\":\"hi\""));
    }

    #[test]
    fn unparseable_event_is_skipped_not_fatal() {
        let mut xform = StreamTransformer::new(Dialect::OpenAiChat, Dialect::AnthropicChat).unwrap();
        let junk = sse::encode_event(None, "not json");
        let (remainder, out) = xform.push(Vec::new(), &junk);
        assert!(remainder.is_empty());
        assert!(out.is_empty());
    }
}
