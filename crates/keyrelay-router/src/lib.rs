pub mod error;
pub mod handler;
pub mod models;
pub mod routes;

pub use routes::router;

/// Per-connection disconnect signal, inserted as a request extension by
/// the server's accept loop (see `apps/keyrelay/src/main.rs`). Cancelled
/// once the underlying connection is torn down for any reason, which a
/// request in the middle of `CoreState::handle` (queue wait or upstream
/// dispatch) is racing against via a child token.
#[derive(Clone)]
pub struct ConnDisconnect(pub tokio_util::sync::CancellationToken);
