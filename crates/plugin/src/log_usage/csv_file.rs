use super::{UsageRecord, UsageSink};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const COLUMNS: &[&str] = &[
    "request_received_utc",
    "client",
    "is_streaming",
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "aoai_roundtrip_time_ms",
    "aoai_region",
    "aoai_endpoint_name",
    "aoai_virtual_deployment",
    "aoai_standin_deployment",
];

/// Appends usage records to a timestamped CSV file.
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(log_dir: Option<&str>) -> Self {
        let dir = log_dir.unwrap_or("./logs");
        let file_name = format!(
            "{}.usage.csv",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        );
        Self {
            path: Path::new(dir).join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn csv_field(value: Option<&str>) -> String {
    let value = value.unwrap_or("");
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[async_trait]
impl UsageSink for CsvFileSink {
    fn name(&self) -> &'static str {
        "LogUsageToCsvFile"
    }

    async fn prepare(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, COLUMNS.join(",")).await?;
        Ok(())
    }

    fn print_configuration(&self) {
        tracing::info!("usage CSV file: {}", self.path.display());
    }

    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let line = format!(
            "\n{},{},{},{},{},{},{},{},{},{},{}",
            record.request_received_utc,
            csv_field(record.client.as_deref()),
            if record.is_streaming { 1 } else { 0 },
            record.prompt_tokens,
            record.completion_tokens,
            record.total_tokens,
            record
                .aoai_roundtrip_time_ms
                .map(|ms| ms.to_string())
                .unwrap_or_default(),
            csv_field(record.aoai_region.as_deref()),
            csv_field(record.aoai_endpoint_name.as_deref()),
            csv_field(record.aoai_virtual_deployment.as_deref()),
            csv_field(record.aoai_standin_deployment.as_deref()),
        );
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
