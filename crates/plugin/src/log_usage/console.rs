use super::{UsageRecord, UsageSink};
use async_trait::async_trait;

/// Writes usage records to the process log.
#[derive(Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl UsageSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "LogUsageToConsole"
    }

    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()> {
        tracing::info!(
            client = record.client.as_deref().unwrap_or("-"),
            request_received_utc = %record.request_received_utc,
            is_streaming = record.is_streaming,
            prompt_tokens = record.prompt_tokens,
            completion_tokens = record.completion_tokens,
            total_tokens = record.total_tokens,
            aoai_roundtrip_time_ms = record.aoai_roundtrip_time_ms.unwrap_or(-1),
            aoai_region = record.aoai_region.as_deref().unwrap_or("-"),
            aoai_endpoint_name = record.aoai_endpoint_name.as_deref().unwrap_or("-"),
            "usage"
        );
        Ok(())
    }
}
