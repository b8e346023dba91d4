//! Target selection and upstream request forwarding.

use crate::registry::{EndpointRegistry, TargetKind};
use aogate_core::error::{GatewayError, ImmediateResponse};
use aogate_core::slip::{RoutingSlip, now_ms};
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, StatusCode};
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_BACKOFF_MS: i64 = 10_000;

/// Forward the request on the slip to the first usable target.
///
/// Targets are tried in registry order. A target is skipped when it is still
/// blocked from an earlier throttle, when its virtual deployment does not
/// match the requested one, or when the non-streaming admission draw fails.
/// A 429/500 from the backend blocks the target and moves on to the next
/// one; transport errors propagate to the caller.
pub async fn dispatch(
    registry: &EndpointRegistry,
    slip: &mut RoutingSlip,
) -> Result<reqwest::Response, GatewayError> {
    for target in registry.targets() {
        if target.is_blocked(now_ms()) {
            continue;
        }

        if let TargetKind::VirtualDeploymentStandin {
            virtual_deployment, ..
        } = &target.kind
            && slip.virtual_deployment.as_deref() != Some(virtual_deployment.as_str())
        {
            continue;
        }

        if !target.passes_non_streaming_filter(slip.is_non_streaming_response_requested) {
            continue;
        }

        if let TargetKind::Mock {
            body,
            ms_to_wait_before_return,
        } = &target.kind
        {
            if let Some(ms) = ms_to_wait_before_return {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            remember_target(slip, target);
            slip.aoai_request_start_time_ms = Some(now_ms());
            return mock_response(body);
        }

        let headers = outbound_headers(&slip.headers, target.backend_key.as_deref());
        if let TargetKind::VirtualDeploymentStandin { standin, .. } = &target.kind {
            slip.path = rewrite_deployment(&slip.path, standin);
        }
        remember_target(slip, target);
        slip.aoai_request_start_time_ms = Some(now_ms());

        let mut url = format!("{}/{}", target.base_url.trim_end_matches('/'), slip.path);
        if let Some(query) = &slip.query {
            url.push('?');
            url.push_str(query);
        }

        let response = target
            .http
            .request(slip.method.clone(), url)
            .headers(headers)
            .body(slip.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 429 || status == 500 {
            let wait_ms = response
                .headers()
                .get("retry-after-ms")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_BACKOFF_MS);
            target.block_for_ms(wait_ms);
            tracing::warn!(
                "target '{}' answered {status}, blocked for {wait_ms} ms",
                target.name
            );
            continue;
        }

        return Ok(response);
    }

    Err(ImmediateResponse::json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({
            "message": "Could not find any endpoint or deployment with remaining capacity. \
                        Try again later."
        }),
    )
    .into())
}

/// Outbound headers: everything from the caller except `Host` and
/// `Content-Length`. The proxy-level `api-key` is replaced by the target's
/// backend key, or removed entirely when the target has none so that an
/// `Authorization` bearer passes through on its own.
fn outbound_headers(inbound: &HeaderMap, backend_key: Option<&str>) -> HeaderMap {
    let mut headers = inbound.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    if headers.contains_key("api-key") {
        match backend_key.and_then(|key| key.parse().ok()) {
            Some(key) => {
                headers.insert("api-key", key);
            }
            None => {
                headers.remove("api-key");
            }
        }
    }
    headers
}

fn rewrite_deployment(path: &str, standin: &str) -> String {
    static DEPLOYMENT_RE: OnceLock<Regex> = OnceLock::new();
    let re = DEPLOYMENT_RE
        .get_or_init(|| Regex::new(r"deployments/[^/]+").expect("deployment regex is valid"));
    re.replace(path, format!("deployments/{standin}")).into_owned()
}

fn remember_target(slip: &mut RoutingSlip, target: &crate::registry::Target) {
    slip.aoai_endpoint = Some(target.endpoint_name.clone());
    match &target.kind {
        TargetKind::VirtualDeploymentStandin {
            virtual_deployment,
            standin,
        } => {
            slip.aoai_virtual_deployment = Some(virtual_deployment.clone());
            slip.aoai_standin_deployment = Some(standin.clone());
        }
        _ => {
            slip.aoai_virtual_deployment = None;
            slip.aoai_standin_deployment = None;
        }
    }
}

fn mock_response(body: &serde_json::Value) -> Result<reqwest::Response, GatewayError> {
    let response = axum::http::Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(body.to_string())
        .map_err(|e| GatewayError::Internal(format!("mock response build failed: {e}")))?;
    Ok(reqwest::Response::from(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use bytes::Bytes;

    #[test]
    fn outbound_headers_drop_host_and_content_length() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", "proxy.example".parse().unwrap());
        inbound.insert("content-length", "42".parse().unwrap());
        inbound.insert("x-custom", "kept".parse().unwrap());

        let outbound = outbound_headers(&inbound, Some("backend"));
        assert!(!outbound.contains_key("host"));
        assert!(!outbound.contains_key("content-length"));
        assert_eq!(outbound.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn api_key_is_swapped_for_backend_key() {
        let mut inbound = HeaderMap::new();
        inbound.insert("api-key", "proxy-key".parse().unwrap());

        let outbound = outbound_headers(&inbound, Some("backend-key"));
        assert_eq!(outbound.get("api-key").unwrap(), "backend-key");
    }

    #[test]
    fn api_key_is_removed_when_target_has_no_key() {
        let mut inbound = HeaderMap::new();
        inbound.insert("api-key", "proxy-key".parse().unwrap());
        inbound.insert("authorization", "Bearer aad-token".parse().unwrap());

        let outbound = outbound_headers(&inbound, None);
        assert!(!outbound.contains_key("api-key"));
        assert_eq!(outbound.get("authorization").unwrap(), "Bearer aad-token");
    }

    #[test]
    fn missing_api_key_stays_missing() {
        let outbound = outbound_headers(&HeaderMap::new(), Some("backend-key"));
        assert!(!outbound.contains_key("api-key"));
    }

    #[test]
    fn deployment_path_rewrite_replaces_requested_name() {
        assert_eq!(
            rewrite_deployment("openai/deployments/gpt-4/chat/completions", "gpt-4-real"),
            "openai/deployments/gpt-4-real/chat/completions"
        );
        assert_eq!(rewrite_deployment("openai/models", "x"), "openai/models");
    }

    #[tokio::test]
    async fn mock_registry_answers_without_a_backend() {
        let config = aogate_core::config::Config::from_yaml(
            r#"
aoai:
  mock_response:
    json: {"choices": [], "usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}}
"#,
        )
        .unwrap();
        let registry = EndpointRegistry::from_config(&config).unwrap();
        let mut slip = RoutingSlip::new(
            Method::POST,
            "openai/deployments/gpt-4/chat/completions".into(),
            None,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        );

        let response = dispatch(&registry, &mut slip).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["usage"]["total_tokens"], 3);
        assert_eq!(slip.aoai_endpoint.as_deref(), Some("mock"));
    }

    #[tokio::test]
    async fn exhausted_registry_yields_429() {
        let config = aogate_core::config::Config::from_yaml(
            r#"
aoai:
  endpoints:
    - name: e1
      url: https://e1.invalid/
"#,
        )
        .unwrap();
        let registry = EndpointRegistry::from_config(&config).unwrap();
        registry.targets()[0].block_for_ms(60_000);

        let mut slip = RoutingSlip::new(
            Method::POST,
            "openai/deployments/gpt-4/chat/completions".into(),
            None,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        );
        let err = dispatch(&registry, &mut slip).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn standin_targets_require_matching_deployment() {
        let config = aogate_core::config::Config::from_yaml(
            r#"
aoai:
  endpoints:
    - name: e1
      url: https://e1.invalid/
      virtual_deployments:
        - name: gpt-4
          standins:
            - name: gpt-4-real
"#,
        )
        .unwrap();
        let registry = EndpointRegistry::from_config(&config).unwrap();

        // Request for a different deployment: no target qualifies.
        let mut slip = RoutingSlip::new(
            Method::POST,
            "openai/deployments/gpt-35/chat/completions".into(),
            None,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        );
        let err = dispatch(&registry, &mut slip).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }
}
