//! Core credential-pool abstractions for keyrelay.
//!
//! This crate intentionally does not depend on any HTTP client or on
//! `keyrelay-transform` — it knows about key records and selection
//! policy, not about request/response bodies.

pub mod errors;
pub mod events;
pub mod key;
pub mod pool;
pub mod provider;

pub use errors::{ProviderError, ProviderResult};
pub use events::{
    DisabledEvent, Event, EventHub, EventSink, OperationalEvent, RateLimitedEvent, RevokedEvent,
    TerminalEventSink,
};
pub use key::{KeyHandle, KeyPatch, KeyRecord, KeyView, ServiceExtension, now_millis};
pub use pool::KeyPool;
pub use provider::KeyProvider;
