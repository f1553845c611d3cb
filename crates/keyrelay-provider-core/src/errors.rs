use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The eligible subset (not disabled, supports the requested family,
    /// not locked out) is empty.
    NoKeysAvailable,
    /// A service has no keys configured at all; fails fast at startup.
    NoKeysConfigured,
    /// `get(model)` was called for a service with no registered provider.
    UnknownService(String),
    InvalidConfig(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NoKeysAvailable => write!(f, "no keys available"),
            ProviderError::NoKeysConfigured => write!(f, "no keys configured"),
            ProviderError::UnknownService(service) => write!(f, "unknown service: {service}"),
            ProviderError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for ProviderError {}
