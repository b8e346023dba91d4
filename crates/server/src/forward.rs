//! Response forwarding: buffered bodies and line-wise event streams.

use aogate_core::error::GatewayError;
use aogate_core::slip::RoutingSlip;
use aogate_plugin::PluginBus;
use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::StreamExt;

/// Split a byte stream into lines without terminators, tolerating `\n` and
/// `\r\n`. A trailing remainder without newline is flushed when the stream
/// ends. Empty lines are preserved, they carry the event-stream framing.
pub fn lines<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, GatewayError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct LineState<S> {
        stream: Pin<Box<S>>,
        buffer: String,
        upstream_done: bool,
    }

    futures::stream::unfold(
        LineState {
            stream: Box::pin(byte_stream),
            buffer: String::new(),
            upstream_done: false,
        },
        |mut state| async move {
            loop {
                if let Some(pos) = state.buffer.find('\n') {
                    let mut line = state.buffer[..pos].to_string();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    state.buffer = state.buffer[pos + 1..].to_string();
                    return Some((Ok(line), state));
                }

                if state.upstream_done {
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let line = std::mem::take(&mut state.buffer);
                    return Some((Ok(line), state));
                }

                match state.stream.next().await {
                    Some(Ok(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => state.buffer.push_str(text),
                        Err(e) => {
                            return Some((
                                Err(GatewayError::Network(format!(
                                    "invalid UTF-8 in upstream stream: {e}"
                                ))),
                                state,
                            ));
                        }
                    },
                    Some(Err(e)) => {
                        return Some((Err(GatewayError::Network(e.to_string())), state));
                    }
                    None => {
                        state.upstream_done = true;
                    }
                }
            }
        },
    )
}

/// Forward a buffered (non event-stream) upstream response.
///
/// The body is read in full, the roundtrip is measured, and when the body
/// parses as JSON the body-dict event fires before the response is written.
pub async fn buffered_response(
    upstream: reqwest::Response,
    slip: &mut RoutingSlip,
    bus: &PluginBus,
) -> Result<Response, GatewayError> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    let body = upstream.bytes().await?;
    slip.measure_roundtrip();

    if let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&body) {
        slip.body_dict_from_target = Some(parsed);
        bus.on_body_dict_from_target_available(slip).await?;
    }

    // A body-bearing response with both headers would confuse clients once
    // the proxy re-frames the transfer.
    if headers.contains_key(TRANSFER_ENCODING) && headers.contains_key(CONTENT_LENGTH) {
        headers.remove(CONTENT_LENGTH);
    }

    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = headers;
    }
    builder
        .body(Body::from(body))
        .map_err(|e| GatewayError::Internal(format!("response build failed: {e}")))
}

/// Forward an event-stream response line by line.
///
/// Every upstream line is passed through verbatim with a `\r\n` terminator,
/// `[DONE]` included. Lines carrying a `data: ` payload (other than
/// `[DONE]`) fire the per-event plugin hook; after the upstream closes, the
/// roundtrip is measured and the end-of-stream hook fires exactly once.
pub fn stream_response(
    upstream: reqwest::Response,
    slip: RoutingSlip,
    bus: Arc<PluginBus>,
) -> Result<Response, GatewayError> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    // The streamed body is re-framed by the server.
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);

    struct ForwardState<L> {
        lines: Pin<Box<L>>,
        slip: RoutingSlip,
        bus: Arc<PluginBus>,
        finished: bool,
    }

    let line_stream = lines(upstream.bytes_stream());
    let body_stream = futures::stream::unfold(
        ForwardState {
            lines: Box::pin(line_stream),
            slip,
            bus,
            finished: false,
        },
        |mut state| async move {
            if state.finished {
                return None;
            }
            match state.lines.next().await {
                Some(Ok(line)) => {
                    state.slip.data_from_target = None;
                    if let Some(payload) = line.strip_prefix("data: ")
                        && payload != "[DONE]"
                    {
                        state.slip.data_from_target = Some(payload.to_string());
                        state.slip.data_events_from_target += 1;
                        if let Err(e) = state
                            .bus
                            .on_data_event_from_target_received(&mut state.slip)
                            .await
                        {
                            tracing::warn!("plugin failed during stream: {e}");
                            state.finished = true;
                            return Some((Err(e), state));
                        }
                    }
                    let chunk = Bytes::from(format!("{line}\r\n"));
                    Some((Ok(chunk), state))
                }
                Some(Err(e)) => {
                    state.finished = true;
                    Some((Err(e), state))
                }
                None => {
                    state.slip.measure_roundtrip();
                    if let Err(e) = state
                        .bus
                        .on_end_of_target_response_stream_reached(&mut state.slip)
                        .await
                    {
                        tracing::warn!("plugin failed at end of stream: {e}");
                    }
                    None
                }
            }
        },
    );

    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = headers;
    }
    builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| GatewayError::Internal(format!("response build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    async fn collect(
        chunks: Vec<&'static str>,
    ) -> Vec<String> {
        let byte_stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, Infallible>(Bytes::from_static(chunk.as_bytes()))),
        );
        lines(byte_stream)
            .map(|line| line.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn splits_lines_across_chunk_boundaries() {
        let lines = collect(vec!["data: he", "llo\n\nda", "ta: [DONE]\n"]).await;
        assert_eq!(lines, vec!["data: hello", "", "data: [DONE]"]);
    }

    #[tokio::test]
    async fn strips_carriage_returns() {
        let lines = collect(vec!["a\r\nb\r\n"]).await;
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn flushes_trailing_remainder() {
        let lines = collect(vec!["no newline at end"]).await;
        assert_eq!(lines, vec!["no newline at end"]);
    }

    #[tokio::test]
    async fn preserves_empty_lines_between_events() {
        let lines = collect(vec!["data: a\n\ndata: b\n\n"]).await;
        assert_eq!(lines, vec!["data: a", "", "data: b", ""]);
    }
}
