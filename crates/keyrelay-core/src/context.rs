use std::time::Instant;

use keyrelay_provider_core::KeyHandle;
use keyrelay_transform::Dialect;

/// Per-request mutable record threaded through preprocessing, the queue,
/// and upstream dispatch. Lifetime equals one inbound HTTP request.
pub struct RequestContext {
    pub trace_id: String,
    pub inbound_api: Dialect,
    pub outbound_api: Dialect,
    pub service: String,
    pub model: String,
    /// Present from queue admission onward; absent while waiting.
    pub key: Option<KeyHandle>,
    pub prompt_tokens: u32,
    pub output_tokens: u32,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(trace_id: String, inbound_api: Dialect, outbound_api: Dialect, service: String, model: String) -> Self {
        Self {
            trace_id,
            inbound_api,
            outbound_api,
            service,
            model,
            key: None,
            prompt_tokens: 0,
            output_tokens: 0,
            started_at: Instant::now(),
        }
    }

    pub fn bind_key(&mut self, key: KeyHandle) {
        self.key = Some(key);
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}
