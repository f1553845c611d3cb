//! Shared request handling for every forwarding route: build an
//! `InboundRequest` from the raw HTTP parts, run it through
//! `CoreState::handle`, and shape whatever comes back into an axum
//! `Response`. Grounded on the teacher's `gproxy-core/src/handler.rs`
//! `proxy_handler`, split along the same received/dispatched/responded
//! tracing points but without its provider-lookup and auth layers, which
//! have no counterpart here.

use std::sync::Arc;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use keyrelay_core::{CoreState, InboundRequest, UpstreamOutcome};
use keyrelay_transform::Dialect;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::RouterError;

fn inbound_headers(headers: &HeaderMap) -> keyrelay_common::Headers {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

fn response_headers(headers: &mut axum::http::HeaderMap, pairs: &keyrelay_common::Headers) {
    for (name, value) in pairs {
        let lower = name.to_ascii_lowercase();
        // Hop-by-hop and framing headers are the router's own business, not
        // the upstream's; let axum recompute them for the outgoing body.
        if matches!(lower.as_str(), "content-length" | "transfer-encoding" | "connection") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            axum::http::HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Runs one inbound request through the full pipeline and turns the
/// result into an HTTP response. `forced_model` is `Some` only for the
/// `/v1/claude-3/complete` compatibility route. `conn_cancel` is the
/// connection's disconnect signal (see `ConnDisconnect`); a child token
/// is what's actually threaded through the queue wait, so it cancels
/// when either the connection goes away or this request is done, without
/// the two requests on a kept-alive connection cancelling each other.
pub async fn dispatch(
    state: Arc<CoreState>,
    inbound: Dialect,
    forced_model: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    conn_cancel: CancellationToken,
) -> Response {
    let trace_id = keyrelay_common::new_trace_id();
    let outbound_headers = inbound_headers(&headers);
    let cancel = conn_cancel.child_token();

    info!(trace_id = %trace_id, %inbound, "request received");

    let request = InboundRequest { inbound, forced_model, body };
    let result = state.handle(trace_id.clone(), request, outbound_headers, cancel).await;

    match result {
        Ok((ctx, outcome)) => {
            info!(
                trace_id = %trace_id,
                service = %ctx.service,
                model = %ctx.model,
                prompt_tokens = ctx.prompt_tokens,
                output_tokens = ctx.output_tokens,
                elapsed_ms = ctx.elapsed_ms(),
                "request dispatched"
            );
            let mut response = match outcome {
                UpstreamOutcome::Buffered { status, headers, body } => {
                    let mut resp = Response::new(Body::from(body));
                    *resp.status_mut() = axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
                    response_headers(resp.headers_mut(), &headers);
                    resp
                }
                UpstreamOutcome::Streaming { status, headers, stream } => {
                    let mut resp = Response::new(Body::from_stream(stream));
                    *resp.status_mut() = axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
                    response_headers(resp.headers_mut(), &headers);
                    resp
                }
            };
            if let Ok(value) = axum::http::HeaderValue::from_str(&trace_id) {
                response.headers_mut().insert("x-keyrelay-request-id", value);
            }
            response
        }
        Err(err) => {
            tracing::warn!(trace_id = %trace_id, status = err.status().as_u16(), %err, "request failed");
            RouterError(err).into_response()
        }
    }
}
