use serde::{Deserialize, Serialize};

/// Shared error body shape, modeled on OpenAI's `{"error": {...}}` envelope
/// since both dialects this proxy terminates locally (BadRequest,
/// Unsupported, NoKeysAvailable) are surfaced to the client before an
/// upstream is ever chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code: None,
            },
        }
    }
}
