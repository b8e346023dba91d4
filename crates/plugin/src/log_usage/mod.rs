//! Usage logging: one record per finished request, appended to an
//! interchangeable sink. Sink failures are logged and never fail the
//! proxied request.

pub mod console;
pub mod csv_file;
pub mod log_analytics;

use crate::Plugin;
use crate::token_counting::TokenCounts;
use aogate_core::error::GatewayError;
use aogate_core::slip::RoutingSlip;
use async_trait::async_trait;
use serde::Serialize;

/// One usage record. Serializes in PascalCase for the logs ingestion API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UsageRecord {
    pub client: Option<String>,
    pub request_received_utc: String,
    pub is_streaming: bool,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(rename = "AoaiRoundtripTimeMS")]
    pub aoai_roundtrip_time_ms: Option<i64>,
    pub aoai_region: Option<String>,
    pub aoai_endpoint_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aoai_virtual_deployment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aoai_standin_deployment: Option<String>,
}

impl UsageRecord {
    pub fn build(slip: &RoutingSlip, counts: &TokenCounts, is_streaming: bool) -> Self {
        Self {
            client: slip.client.clone(),
            request_received_utc: slip.request_received_utc.to_rfc3339(),
            is_streaming,
            prompt_tokens: counts.prompt_tokens,
            completion_tokens: counts.completion_tokens,
            total_tokens: counts.total_tokens,
            aoai_roundtrip_time_ms: slip.aoai_roundtrip_time_ms,
            aoai_region: slip.aoai_region(),
            aoai_endpoint_name: slip.aoai_endpoint.clone(),
            aoai_virtual_deployment: slip.aoai_virtual_deployment.clone(),
            aoai_standin_deployment: slip.aoai_standin_deployment.clone(),
        }
    }
}

/// Destination for usage records.
#[async_trait]
pub trait UsageSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Startup preparation (create files, check credentials).
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn print_configuration(&self) {}

    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

/// The usage-logging plugin: computes token counts when they become
/// available and appends one record per request to its sink.
pub struct LogUsage {
    sink: Box<dyn UsageSink>,
}

impl LogUsage {
    pub fn new(sink: Box<dyn UsageSink>) -> Self {
        Self { sink }
    }

    async fn append(&self, slip: &RoutingSlip, counts: &TokenCounts, is_streaming: bool) {
        let record = UsageRecord::build(slip, counts, is_streaming);
        if let Err(e) = self.sink.append(&record).await {
            tracing::warn!("usage sink '{}' failed to append: {e}", self.sink.name());
        }
    }
}

#[async_trait]
impl Plugin for LogUsage {
    fn name(&self) -> &str {
        self.sink.name()
    }

    async fn on_plugin_instantiated(&mut self) -> Result<(), GatewayError> {
        self.sink
            .prepare()
            .await
            .map_err(|e| GatewayError::Config(format!("{} setup failed: {e}", self.sink.name())))
    }

    fn on_print_configuration(&self) {
        self.sink.print_configuration();
    }

    async fn on_body_dict_from_target_available(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        if let Some(counts) = TokenCounts::from_target_body(slip) {
            self.append(slip, &counts, false).await;
        }
        Ok(())
    }

    async fn on_end_of_target_response_stream_reached(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        let counts = TokenCounts::from_stream(slip);
        self.append(slip, &counts, true).await;
        Ok(())
    }
}
