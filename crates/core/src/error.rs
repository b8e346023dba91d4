use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// A fully formed HTTP response used to short-circuit the request pipeline.
///
/// Plugins and the dispatcher signal caller-visible outcomes (401, 429, 500)
/// by returning this value wrapped in [`GatewayError::Immediate`]; the
/// top-level handler writes it verbatim.
#[derive(Debug, Clone)]
pub struct ImmediateResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl ImmediateResponse {
    pub fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
            headers: Vec::new(),
        }
    }
}

impl IntoResponse for ImmediateResponse {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            [("content-type", self.content_type)],
            self.body,
        )
            .into_response();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        response
    }
}

/// Unified error type for all proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("immediate response ({})", .0.status)]
    Immediate(ImmediateResponse),

    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Immediate(response) => response.status,
            Self::UpstreamTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::UpstreamConnect(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-facing message that does not leak internal state.
    fn public_message(&self) -> &'static str {
        match self {
            Self::UpstreamTimeout(_) => "The upstream endpoint did not respond in time.",
            Self::UpstreamConnect(_) => "The upstream endpoint could not be reached.",
            Self::Network(_) => "The upstream connection failed.",
            _ => "The proxy encountered an internal error.",
        }
    }
}

impl From<ImmediateResponse> for GatewayError {
    fn from(response: ImmediateResponse) -> Self {
        Self::Immediate(response)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::UpstreamTimeout(e.to_string())
        } else if e.is_connect() {
            Self::UpstreamConnect(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::Immediate(response) => response.into_response(),
            other => {
                let status = other.status_code();
                if status.is_server_error() {
                    tracing::error!("request failed: {other}");
                } else {
                    tracing::warn!("request failed: {other}");
                }
                let body = json!({"error": {"message": other.public_message()}});
                (
                    status,
                    [("content-type", "application/json")],
                    body.to_string(),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_response_is_written_verbatim() {
        let err = GatewayError::Immediate(ImmediateResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"message": "busy"}),
        ));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            GatewayError::UpstreamTimeout("t".into()).status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            GatewayError::UpstreamConnect("c".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Network("n".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Internal("i".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = GatewayError::Internal("secret backend state".into());
        assert_eq!(err.public_message(), "The proxy encountered an internal error.");
    }
}
