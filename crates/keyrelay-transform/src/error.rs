use std::fmt;

use crate::dialect::Dialect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// No entry in the dispatch table covers this pair. Fails at request
    /// entry, before anything is dequeued or dispatched.
    Unsupported { inbound: Dialect, outbound: Dialect },
    /// The body handed to a transform function didn't match the dialect
    /// its caller claimed for it.
    BodyMismatch,
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::Unsupported { inbound, outbound } => {
                write!(f, "unsupported dialect pair: {inbound} -> {outbound}")
            }
            TransformError::BodyMismatch => write!(f, "body does not match claimed dialect"),
        }
    }
}

impl std::error::Error for TransformError {}
