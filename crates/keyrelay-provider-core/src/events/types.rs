use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Operational(OperationalEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationalEvent {
    RateLimited(RateLimitedEvent),
    Disabled(DisabledEvent),
    Revoked(RevokedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedEvent {
    pub at: SystemTime,
    pub service: String,
    pub key_hash: String,
    pub lockout_until_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisabledEvent {
    pub at: SystemTime,
    pub service: String,
    pub key_hash: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedEvent {
    pub at: SystemTime,
    pub service: String,
    pub key_hash: String,
}
