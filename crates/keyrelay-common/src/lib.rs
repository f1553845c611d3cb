//! Small utilities shared across the keyrelay crates: header bag helpers,
//! credential fingerprinting, and trace id generation. Kept dependency-free
//! of any HTTP framework so it can sit underneath both the proxy core and
//! the provider implementations.

mod error;
mod fingerprint;
mod headers;

pub use error::CommonError;
pub use fingerprint::fingerprint;
pub use headers::{Headers, header_get, header_remove, header_set};

/// Generates a fresh per-request correlation id.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
