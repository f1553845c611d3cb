use keyrelay_protocol::anthropic::messages::{CreateMessageRequest, CreateMessageResponse};
use keyrelay_protocol::anthropic::text_completion::{CompleteRequest, CompleteResponse};
use keyrelay_protocol::openai::chat::{ChatCompletionRequest, ChatCompletionResponse};
use keyrelay_protocol::openai::completion::{CompletionRequest, CompletionResponse};
use keyrelay_protocol::openai::image::{ImageGenerationRequest, ImageGenerationResponse};

#[derive(Debug, Clone)]
pub enum RequestBody {
    OpenAiChat(ChatCompletionRequest),
    OpenAiText(CompletionRequest),
    OpenAiImage(ImageGenerationRequest),
    AnthropicText(CompleteRequest),
    AnthropicChat(CreateMessageRequest),
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    OpenAiChat(ChatCompletionResponse),
    OpenAiText(CompletionResponse),
    OpenAiImage(ImageGenerationResponse),
    AnthropicText(CompleteResponse),
    AnthropicChat(CreateMessageResponse),
}
