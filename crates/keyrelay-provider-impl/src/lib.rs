//! Concrete `KeyProvider` implementation shared by every supported
//! service, plus the background checker and upstream probes that keep
//! key health current.
//!
//! All three services (OpenAI, Anthropic, Google AI Studio) are plain
//! API-key credentials with no OAuth flow, so one generic pool
//! implementation covers them; only the probe and auth-stamping differ.

pub mod checker;
pub mod client;
pub mod pool_provider;

pub use checker::{CheckerConfig, KeyChecker, KeyProbe, ProbeOutcome, ProbeResult};
pub use client::{AnthropicProbe, GoogleProbe, OpenAiProbe};
pub use pool_provider::{ApiKeyProvider, DEFAULT_LOCKOUT_WINDOW, DEFAULT_REUSE_DELAY};
