use std::fmt;

use bytes::Bytes;
use http::StatusCode;
use keyrelay_protocol::error::ErrorBody;

/// The error taxonomy from the component design: one variant per row, each
/// knowing its own client-facing status. No variant carries a secret.
#[derive(Debug)]
pub enum ProxyError {
    BadRequest(String),
    Unsupported(String),
    NoKeysAvailable,
    TransientLockout,
    UpstreamAuth,
    UpstreamBilling,
    UpstreamRateLimit,
    UpstreamServer(String),
    Cancelled,
    Timeout,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unsupported(_) => StatusCode::BAD_REQUEST,
            ProxyError::NoKeysAvailable => StatusCode::PAYMENT_REQUIRED,
            ProxyError::TransientLockout => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamAuth => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamBilling => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamRateLimit => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamServer(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::Unsupported(_) => "unsupported_dialect",
            ProxyError::NoKeysAvailable => "no_keys_available",
            ProxyError::TransientLockout => "transient_lockout",
            ProxyError::UpstreamAuth => "upstream_auth",
            ProxyError::UpstreamBilling => "upstream_billing",
            ProxyError::UpstreamRateLimit => "upstream_rate_limit",
            ProxyError::UpstreamServer(_) => "upstream_server",
            ProxyError::Cancelled => "cancelled",
            ProxyError::Timeout => "timeout",
        }
    }

    pub fn body(&self) -> Bytes {
        let body = ErrorBody::new(self.kind(), self.to_string());
        serde_json::to_vec(&body).map(Bytes::from).unwrap_or_else(|_| Bytes::from_static(b"{\"error\":{}}"))
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            ProxyError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            ProxyError::NoKeysAvailable => write!(f, "no keys available"),
            ProxyError::TransientLockout => write!(f, "all eligible keys are currently rate limited"),
            ProxyError::UpstreamAuth => write!(f, "upstream rejected credentials"),
            ProxyError::UpstreamBilling => write!(f, "upstream billing failure"),
            ProxyError::UpstreamRateLimit => write!(f, "upstream rate limit exhausted retries"),
            ProxyError::UpstreamServer(msg) => write!(f, "upstream server error: {msg}"),
            ProxyError::Cancelled => write!(f, "request cancelled"),
            ProxyError::Timeout => write!(f, "upstream deadline exceeded"),
        }
    }
}

impl std::error::Error for ProxyError {}
