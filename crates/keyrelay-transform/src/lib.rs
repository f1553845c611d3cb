//! Dialect translation: a table of pure functions keyed by `(inbound,
//! outbound)` dialect pairs, populated once at startup, plus the
//! streaming variant of the same idea built on a byte-cursor contract.
//! Unknown pairs fail loudly at request entry rather than mid-transform.

mod body;
mod dialect;
mod error;
mod request;
mod response;
mod stream;

pub use body::{RequestBody, ResponseBody};
pub use dialect::Dialect;
pub use error::TransformError;
pub use request::transform_request;
pub use response::transform_response;
pub use stream::StreamTransformer;
