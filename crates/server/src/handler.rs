//! The request entry points.

use crate::AppState;
use crate::dispatch::dispatch;
use crate::forward::{buffered_response, stream_response};
use crate::identify::identify_client;
use aogate_core::error::GatewayError;
use aogate_core::slip::RoutingSlip;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;

/// Liveness probe, used by hosting services to watch the container.
pub async fn liveness() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Proxy any GET or POST to a backend, driving the plugin pipeline through
/// the request lifecycle.
pub async fn proxy(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to read request body: {e}")))?;
    let path = parts.uri.path().trim_start_matches('/').to_string();
    let query = parts.uri.query().map(|query| query.to_string());

    let mut slip = RoutingSlip::new(parts.method, path, query, parts.headers, body);
    state.plugins.on_new_request_received(&mut slip).await?;

    slip.client = identify_client(&slip.headers, &state.config)?;
    if slip.client.is_some() {
        state.plugins.on_client_identified(&mut slip).await?;
    }

    let upstream = dispatch(&state.registry, &mut slip).await?;

    slip.headers_from_target = Some(upstream.headers().clone());
    state.plugins.on_headers_from_target_received(&mut slip).await?;

    let is_event_stream = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        == Some("text/event-stream");

    if is_event_stream {
        stream_response(upstream, slip, state.plugins.clone())
    } else {
        buffered_response(upstream, &mut slip, &state.plugins).await
    }
}
