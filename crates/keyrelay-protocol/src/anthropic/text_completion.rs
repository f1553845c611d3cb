use serde::{Deserialize, Serialize};

/// `POST /v1/complete`, the legacy Anthropic text-completion dialect. The
/// prompt is expected to carry the `\n\nHuman: ... \n\nAssistant:` markers
/// already; the preprocessor is what produces them when translating from
/// another dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens_to_sample: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub completion: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl CompleteResponse {
    pub fn new(id: String, model: String, completion: String, stop_reason: Option<String>) -> Self {
        Self {
            kind: "completion".to_string(),
            id,
            completion,
            model,
            stop_reason,
        }
    }
}

/// One decoded `data:` payload of a `/v1/complete` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub completion: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}
