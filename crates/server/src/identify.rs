//! Maps inbound credentials to a proxy-internal client name.

use aogate_core::config::Config;
use aogate_core::error::{GatewayError, ImmediateResponse};
use axum::http::{HeaderMap, StatusCode};
use serde_json::json;

/// Resolve the client behind a request.
///
/// An `api-key` header must match a configured client key; an unknown key is
/// rejected outright. Without an `api-key`, an `authorization` header maps
/// to the designated Entra ID client when one is configured; its bearer
/// token is opaque to the proxy and passes through to the backend. Requests
/// without either header proceed anonymously, plugins decide their fate.
pub fn identify_client(
    headers: &HeaderMap,
    config: &Config,
) -> Result<Option<String>, GatewayError> {
    if let Some(key) = headers.get("api-key").and_then(|value| value.to_str().ok()) {
        return match config.client_for_key(key) {
            Some(client) => Ok(Some(client.name.clone())),
            None => Err(ImmediateResponse::json(
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "The provided API key is not a valid proxy key. Ensure that the \
                              'api-key' header contains a valid key from the proxy's \
                              configuration."
                }),
            )
            .into()),
        };
    }

    if headers.contains_key("authorization") {
        return Ok(config.entra_id_client().map(|client| client.name.clone()));
    }

    Ok(None)
}
