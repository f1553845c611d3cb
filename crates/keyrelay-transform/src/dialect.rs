use std::fmt;

/// One of the wire shapes a client or upstream can speak. Used on both
/// sides of a translation: `inbound` is what the client sent, `outbound`
/// is what the bound service expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    OpenAiChat,
    OpenAiText,
    OpenAiImage,
    AnthropicText,
    AnthropicChat,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::OpenAiChat => "openai",
            Dialect::OpenAiText => "openai-text",
            Dialect::OpenAiImage => "openai-image",
            Dialect::AnthropicText => "anthropic-text",
            Dialect::AnthropicChat => "anthropic-chat",
        };
        f.write_str(name)
    }
}
