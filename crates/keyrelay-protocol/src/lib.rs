//! Wire-format types for every dialect the proxy understands: native
//! OpenAI chat completions, the legacy OpenAI text completion endpoint,
//! OpenAI image generation, Anthropic's legacy text completion endpoint,
//! and Anthropic messages. Each module is a pure data definition; no
//! behavior lives here — translation between dialects is
//! `keyrelay-transform`'s job.

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod sse;
