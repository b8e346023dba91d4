//! Uploads usage records to an Azure Monitor Logs ingestion endpoint (data
//! collection rule + stream), authenticating with client-secret credentials.

use super::{UsageRecord, UsageSink};
use aogate_core::config::LogAnalyticsConfig;
use aogate_core::slip::now_ms;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

struct CachedToken {
    value: String,
    expires_at_ms: i64,
}

pub struct LogAnalyticsSink {
    config: LogAnalyticsConfig,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
}

impl LogAnalyticsSink {
    pub fn new(config: LogAnalyticsConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            token: RwLock::new(None),
        }
    }

    /// Bearer token for the monitor scope, cached until shortly before
    /// expiry.
    async fn bearer_token(&self) -> anyhow::Result<String> {
        if let Some(token) = self.token.read().await.as_ref()
            && token.expires_at_ms > now_ms() + 60_000
        {
            return Ok(token.value.clone());
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.config.credential_tenant_id
        );
        let response: TokenResponse = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.credential_client_id.as_str()),
                (
                    "client_secret",
                    self.config.credential_client_secret.as_str(),
                ),
                ("scope", "https://monitor.azure.com/.default"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        *self.token.write().await = Some(CachedToken {
            value: response.access_token.clone(),
            expires_at_ms: now_ms() + response.expires_in * 1000,
        });
        Ok(response.access_token)
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/dataCollectionRules/{}/streams/{}?api-version=2023-01-01",
            self.config.log_ingestion_endpoint.trim_end_matches('/'),
            self.config.data_collection_rule_id,
            self.config.stream_name,
        )
    }
}

#[async_trait]
impl UsageSink for LogAnalyticsSink {
    fn name(&self) -> &'static str {
        "LogUsageToLogAnalytics"
    }

    fn print_configuration(&self) {
        tracing::info!(
            log_ingestion_endpoint = %self.config.log_ingestion_endpoint,
            data_collection_rule_id = %self.config.data_collection_rule_id,
            stream_name = %self.config.stream_name,
            "log analytics sink"
        );
    }

    async fn append(&self, record: &UsageRecord) -> anyhow::Result<()> {
        let token = self.bearer_token().await?;
        self.http
            .post(self.upload_url())
            .bearer_auth(token)
            .json(&[record])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_url_joins_rule_and_stream() {
        let sink = LogAnalyticsSink::new(LogAnalyticsConfig {
            log_ingestion_endpoint: "https://dce.westeurope.ingest.monitor.azure.com/".into(),
            data_collection_rule_id: "dcr-123".into(),
            stream_name: "Custom-AzureOpenAIUsage_CL".into(),
            credential_tenant_id: "tenant".into(),
            credential_client_id: "client".into(),
            credential_client_secret: "secret".into(),
        });
        assert_eq!(
            sink.upload_url(),
            "https://dce.westeurope.ingest.monitor.azure.com/dataCollectionRules/dcr-123/streams/Custom-AzureOpenAIUsage_CL?api-version=2023-01-01"
        );
    }
}
