use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Current wall-clock time in millisecond resolution.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-request record threaded through the pipeline.
///
/// The slip is the sole channel of communication between the server, the
/// dispatcher, and the plugins. Each request owns its slip exclusively; a
/// slip is never shared across requests.
#[derive(Debug)]
pub struct RoutingSlip {
    pub request_id: String,
    pub request_received_utc: DateTime<Utc>,
    pub method: Method,
    /// Request path without leading slash, rewritten in place for standins.
    pub path: String,
    pub query: Option<String>,
    /// Inbound headers as received from the caller.
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Parsed request body, `None` when the body is not valid JSON.
    pub body_json: Option<Value>,
    /// Deployment name extracted from the `deployments/<name>` path segment.
    pub virtual_deployment: Option<String>,
    pub is_non_streaming_response_requested: bool,
    pub client: Option<String>,

    // Filled by the dispatcher for the chosen target.
    pub aoai_endpoint: Option<String>,
    pub aoai_virtual_deployment: Option<String>,
    pub aoai_standin_deployment: Option<String>,
    pub aoai_request_start_time_ms: Option<i64>,
    pub aoai_roundtrip_time_ms: Option<i64>,

    // Filled while the target response is consumed.
    pub headers_from_target: Option<HeaderMap>,
    pub body_dict_from_target: Option<Value>,
    /// Payload of the streaming data event currently being dispatched.
    pub data_from_target: Option<String>,
    /// Number of streaming data events observed so far (excluding `[DONE]`).
    pub data_events_from_target: u64,
}

impl RoutingSlip {
    pub fn new(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let body_json = serde_json::from_slice::<Value>(&body).ok();
        let virtual_deployment = extract_virtual_deployment(&path);
        // A body that does not parse counts as a streaming request, so it is
        // never held back by the non-streaming admission filter.
        let is_non_streaming_response_requested = body_json
            .as_ref()
            .map(|body| !stream_requested(body))
            .unwrap_or(false);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request_received_utc: Utc::now(),
            method,
            path,
            query,
            headers,
            body,
            body_json,
            virtual_deployment,
            is_non_streaming_response_requested,
            client: None,
            aoai_endpoint: None,
            aoai_virtual_deployment: None,
            aoai_standin_deployment: None,
            aoai_request_start_time_ms: None,
            aoai_roundtrip_time_ms: None,
            headers_from_target: None,
            body_dict_from_target: None,
            data_from_target: None,
            data_events_from_target: 0,
        }
    }

    /// Measure the roundtrip time to the target, once the response body has
    /// been fully read (buffered) or the stream has closed (streaming).
    pub fn measure_roundtrip(&mut self) {
        if let Some(start) = self.aoai_request_start_time_ms {
            self.aoai_roundtrip_time_ms = Some(now_ms() - start);
        }
    }

    /// Region reported by the backend via the `x-ms-region` header.
    pub fn aoai_region(&self) -> Option<String> {
        self.headers_from_target
            .as_ref()
            .and_then(|headers| headers.get("x-ms-region"))
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string())
    }
}

fn extract_virtual_deployment(path: &str) -> Option<String> {
    static DEPLOYMENT_RE: OnceLock<Regex> = OnceLock::new();
    let re = DEPLOYMENT_RE
        .get_or_init(|| Regex::new(r"deployments/([^/]+)").expect("deployment regex is valid"));
    re.captures(path)
        .map(|captures| captures[1].to_string())
}

fn stream_requested(body: &Value) -> bool {
    match body.get("stream") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slip_with_body(path: &str, body: &str) -> RoutingSlip {
        RoutingSlip::new(
            Method::POST,
            path.to_string(),
            None,
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    #[test]
    fn extracts_virtual_deployment_from_path() {
        let slip = slip_with_body("openai/deployments/gpt-4/chat/completions", "{}");
        assert_eq!(slip.virtual_deployment.as_deref(), Some("gpt-4"));
    }

    #[test]
    fn deployment_extraction_is_case_sensitive() {
        assert_eq!(extract_virtual_deployment("openai/Deployments/gpt-4/x"), None);
        assert_eq!(
            extract_virtual_deployment("openai/deployments/GPT-4/x").as_deref(),
            Some("GPT-4")
        );
    }

    #[test]
    fn no_deployment_in_path() {
        let slip = slip_with_body("openai/models", "{}");
        assert_eq!(slip.virtual_deployment, None);
    }

    #[test]
    fn detects_non_streaming_request() {
        assert!(slip_with_body("p", r#"{"messages": []}"#).is_non_streaming_response_requested);
        assert!(slip_with_body("p", r#"{"stream": false}"#).is_non_streaming_response_requested);
        assert!(!slip_with_body("p", r#"{"stream": true}"#).is_non_streaming_response_requested);
        assert!(!slip_with_body("p", r#"{"stream": "True"}"#).is_non_streaming_response_requested);
    }

    #[test]
    fn unparseable_body_counts_as_streaming() {
        let slip = slip_with_body("p", "not json");
        assert!(slip.body_json.is_none());
        assert!(!slip.is_non_streaming_response_requested);
    }

    #[test]
    fn roundtrip_measurement_requires_start_time() {
        let mut slip = slip_with_body("p", "{}");
        slip.measure_roundtrip();
        assert_eq!(slip.aoai_roundtrip_time_ms, None);

        slip.aoai_request_start_time_ms = Some(now_ms() - 5);
        slip.measure_roundtrip();
        assert!(slip.aoai_roundtrip_time_ms.unwrap() >= 5);
    }

    #[test]
    fn region_read_from_target_headers() {
        let mut slip = slip_with_body("p", "{}");
        assert_eq!(slip.aoai_region(), None);
        let mut headers = HeaderMap::new();
        headers.insert("x-ms-region", "West Europe".parse().unwrap());
        slip.headers_from_target = Some(headers);
        assert_eq!(slip.aoai_region().as_deref(), Some("West Europe"));
    }
}
