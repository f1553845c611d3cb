use axum::body::Body;
use axum::response::{IntoResponse, Response};
use keyrelay_core::ProxyError;

/// Turns a pipeline failure into the client-facing response, exactly the
/// status/body pair `ProxyError` already carries — the router adds no
/// error-shaping of its own.
pub struct RouterError(pub ProxyError);

impl From<ProxyError> for RouterError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let mut resp = Response::new(Body::from(self.0.body()));
        *resp.status_mut() = self.0.status();
        resp
    }
}
