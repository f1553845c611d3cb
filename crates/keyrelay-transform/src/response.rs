use std::collections::HashMap;
use std::sync::OnceLock;

use keyrelay_protocol::openai::chat::{
    ChatCompletionChoice, ChatCompletionResponse, ChatMessage, MessageContent, Role, Usage,
};
use keyrelay_protocol::openai::completion::{CompletionChoice, CompletionResponse};

use crate::body::ResponseBody;
use crate::dialect::Dialect;
use crate::error::TransformError;

type ResponseFn = fn(ResponseBody) -> Result<ResponseBody, TransformError>;

fn response_table() -> &'static HashMap<(Dialect, Dialect), ResponseFn> {
    static TABLE: OnceLock<HashMap<(Dialect, Dialect), ResponseFn>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use Dialect::*;
        HashMap::from([
            ((OpenAiChat, OpenAiChat), identity_openai_chat as ResponseFn),
            ((OpenAiChat, AnthropicText), anthropic_text_to_openai_chat as ResponseFn),
            ((OpenAiChat, AnthropicChat), anthropic_chat_to_openai_chat as ResponseFn),
            ((OpenAiText, OpenAiChat), openai_chat_to_openai_text as ResponseFn),
            ((OpenAiText, AnthropicText), anthropic_text_to_openai_text as ResponseFn),
            ((AnthropicText, AnthropicChat), anthropic_chat_to_anthropic_text as ResponseFn),
            ((AnthropicText, AnthropicText), identity_anthropic_text as ResponseFn),
            ((AnthropicChat, AnthropicChat), identity_anthropic_chat as ResponseFn),
            ((OpenAiImage, OpenAiImage), identity_openai_image as ResponseFn),
        ])
    })
}

/// Same table shape as request translation, keyed by `(inbound, outbound)`
/// — the direction the *response* travels is outbound-to-inbound, but the
/// pair used to look up the transform is the one the request chose.
pub fn transform_response(
    inbound: Dialect,
    outbound: Dialect,
    body: ResponseBody,
) -> Result<ResponseBody, TransformError> {
    match response_table().get(&(inbound, outbound)) {
        Some(transform) => transform(body),
        None => Err(TransformError::Unsupported { inbound, outbound }),
    }
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn estimate_tokens(text: &str) -> u32 {
    ((text.len() as f64) / 4.0).ceil() as u32
}

fn identity_openai_chat(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    match body {
        ResponseBody::OpenAiChat(resp) => Ok(ResponseBody::OpenAiChat(resp)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn identity_anthropic_text(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    match body {
        ResponseBody::AnthropicText(resp) => Ok(ResponseBody::AnthropicText(resp)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn identity_anthropic_chat(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    match body {
        ResponseBody::AnthropicChat(resp) => Ok(ResponseBody::AnthropicChat(resp)),
        _ => Err(TransformError::BodyMismatch),
    }
}

fn identity_openai_image(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    match body {
        ResponseBody::OpenAiImage(resp) => Ok(ResponseBody::OpenAiImage(resp)),
        _ => Err(TransformError::BodyMismatch),
    }
}

/// Reshapes Anthropic's flat `completion` into OpenAI's
/// `choices[0].message` plus a synthesised usage block (the legacy
/// dialect carries no usage figures of its own).
fn anthropic_text_to_openai_chat(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    let ResponseBody::AnthropicText(resp) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let completion_tokens = estimate_tokens(&resp.completion);
    Ok(ResponseBody::OpenAiChat(ChatCompletionResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: resp.model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: MessageContent::Text(resp.completion),
                name: None,
            },
            finish_reason: resp.stop_reason,
        }],
        usage: Some(Usage {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        }),
    }))
}

fn anthropic_chat_to_openai_chat(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    let ResponseBody::AnthropicChat(resp) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let prompt_tokens = resp.usage.input_tokens;
    let completion_tokens = resp.usage.output_tokens;
    let text = resp.text();

    Ok(ResponseBody::OpenAiChat(ChatCompletionResponse {
        id: resp.id,
        object: "chat.completion".to_string(),
        created: unix_timestamp(),
        model: resp.model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: MessageContent::Text(text),
                name: None,
            },
            finish_reason: resp.stop_reason,
        }],
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }),
    }))
}

fn openai_chat_to_openai_text(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    let ResponseBody::OpenAiChat(resp) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let choices = resp
        .choices
        .into_iter()
        .map(|choice| CompletionChoice {
            index: choice.index,
            text: choice.message.content.as_text(),
            finish_reason: choice.finish_reason,
        })
        .collect();

    Ok(ResponseBody::OpenAiText(CompletionResponse {
        id: resp.id,
        object: "text_completion".to_string(),
        created: resp.created,
        model: resp.model,
        choices,
        usage: resp.usage,
    }))
}

fn anthropic_text_to_openai_text(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    let ResponseBody::AnthropicText(resp) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let completion_tokens = estimate_tokens(&resp.completion);
    Ok(ResponseBody::OpenAiText(CompletionResponse {
        id: resp.id,
        object: "text_completion".to_string(),
        created: unix_timestamp(),
        model: resp.model,
        choices: vec![CompletionChoice {
            index: 0,
            text: resp.completion,
            finish_reason: resp.stop_reason,
        }],
        usage: Some(Usage {
            prompt_tokens: 0,
            completion_tokens,
            total_tokens: completion_tokens,
        }),
    }))
}

/// Used by the `/v1/claude-3/complete` compatibility route: the request
/// was upgraded to `anthropic-chat` outbound, so the response needs
/// reshaping back to the legacy `type: "completion"` envelope.
fn anthropic_chat_to_anthropic_text(body: ResponseBody) -> Result<ResponseBody, TransformError> {
    let ResponseBody::AnthropicChat(resp) = body else {
        return Err(TransformError::BodyMismatch);
    };

    let text = resp.text();
    Ok(ResponseBody::AnthropicText(
        keyrelay_protocol::anthropic::text_completion::CompleteResponse::new(
            resp.id,
            resp.model,
            text,
            resp.stop_reason,
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_protocol::anthropic::messages::{ContentBlock, CreateMessageResponse, MessageRole, MessageUsage};

    #[test]
    fn reshapes_anthropic_messages_into_openai_chat() {
        let resp = CreateMessageResponse {
            id: "msg_1".to_string(),
            kind: "message".to_string(),
            role: MessageRole::Assistant,
            model: "claude-3-opus-20240229".to_string(),
            content: vec![ContentBlock::Text { text: "hello".to_string() }],
            stop_reason: Some("end_turn".to_string()),
            usage: MessageUsage { input_tokens: 5, output_tokens: 2 },
        };

        let translated = transform_response(
            Dialect::OpenAiChat,
            Dialect::AnthropicChat,
            ResponseBody::AnthropicChat(resp),
        )
        .unwrap();

        let ResponseBody::OpenAiChat(chat) = translated else {
            panic!("wrong variant");
        };
        assert_eq!(chat.choices[0].message.content.as_text(), "hello");
        assert_eq!(chat.usage.unwrap().total_tokens, 7);
    }
}
