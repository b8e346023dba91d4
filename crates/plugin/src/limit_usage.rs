//! Token-budget rate limiter: each client gets a fresh budget of
//! `max_tokens_per_minute_in_k * 1000` tokens per UTC minute and is rejected
//! with 429 once the budget is exhausted.

use crate::Plugin;
use crate::token_counting::TokenCounts;
use aogate_core::config::Config;
use aogate_core::error::{GatewayError, ImmediateResponse};
use aogate_core::kv::KvStore;
use aogate_core::slip::RoutingSlip;
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

pub struct LimitUsage {
    /// Max tokens per minute per client, resolved once from configuration.
    max_tpms: HashMap<String, Option<i64>>,
    store: Arc<dyn KvStore>,
}

fn current_minute() -> i64 {
    Utc::now().timestamp() / 60
}

impl LimitUsage {
    pub fn new(config: &Config, store: Arc<dyn KvStore>) -> Self {
        let max_tpms = config
            .clients
            .iter()
            .map(|client| {
                (
                    client.name.clone(),
                    client
                        .max_tokens_per_minute_in_k
                        .map(|in_k| (in_k * 1000.0) as i64),
                )
            })
            .collect();
        Self { max_tpms, store }
    }

    fn max_tpm(&self, client: &str) -> Result<i64, GatewayError> {
        match self.max_tpms.get(client) {
            Some(Some(max_tpm)) => Ok(*max_tpm),
            _ => Err(ImmediateResponse::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "Configuration for client '{client}' misses a 'max_tokens_per_minute_in_k' \
                     setting. This needs to be set when the LimitUsage plugin is enabled."
                ),
            )
            .into()),
        }
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, GatewayError> {
        let value = self
            .store
            .get(key)
            .await
            .map_err(|e| GatewayError::Internal(format!("rate-limit store unavailable: {e}")))?;
        Ok(value.and_then(|value| value.parse().ok()))
    }

    async fn set_i64(&self, key: &str, value: i64) -> Result<(), GatewayError> {
        self.store
            .set(key, &value.to_string())
            .await
            .map_err(|e| GatewayError::Internal(format!("rate-limit store unavailable: {e}")))
    }

    /// Admission check for the given minute. Resets the bucket on minute
    /// rollover; the reset is idempotent, so concurrent requests racing into
    /// a new minute write the same values.
    async fn ensure_budget(&self, client: &str, minute: i64) -> Result<(), GatewayError> {
        let minute_key = format!("LimitUsage-{client}-minute");
        let budget_key = format!("LimitUsage-{client}-budget");

        if self.get_i64(&minute_key).await? != Some(minute) {
            self.set_i64(&minute_key, minute).await?;
            self.set_i64(&budget_key, self.max_tpm(client)?).await?;
        }

        let cached_minute = self.get_i64(&minute_key).await?;
        let budget = self.get_i64(&budget_key).await?.unwrap_or(0);
        if cached_minute == Some(minute) && budget <= 0 {
            return Err(ImmediateResponse::text(
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many requests for client '{client}'. Try again later."),
            )
            .into());
        }
        Ok(())
    }

    /// Debit the budget once the final token count is known. The budget may
    /// go negative; the next request in the same minute is then rejected.
    /// Accounting failures are logged, never surfaced: the response has
    /// already been served.
    async fn debit(&self, client: &str, total_tokens: i64) {
        let budget_key = format!("LimitUsage-{client}-budget");
        let result = async {
            let budget = self.get_i64(&budget_key).await?.unwrap_or(0);
            self.set_i64(&budget_key, budget - total_tokens).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("usage debit for client '{client}' failed: {e}");
        }
    }
}

#[async_trait]
impl Plugin for LimitUsage {
    fn name(&self) -> &str {
        "LimitUsage"
    }

    async fn on_client_identified(&self, slip: &mut RoutingSlip) -> Result<(), GatewayError> {
        let Some(client) = slip.client.clone() else {
            return Ok(());
        };
        self.ensure_budget(&client, current_minute()).await
    }

    async fn on_body_dict_from_target_available(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        if let Some(client) = slip.client.clone()
            && let Some(counts) = TokenCounts::from_target_body(slip)
        {
            self.debit(&client, counts.total_tokens).await;
        }
        Ok(())
    }

    async fn on_end_of_target_response_stream_reached(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        if let Some(client) = slip.client.clone() {
            let counts = TokenCounts::from_stream(slip);
            self.debit(&client, counts.total_tokens).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aogate_core::kv::MemoryKvStore;

    fn limiter() -> LimitUsage {
        let config = Config::from_yaml(
            r#"
clients:
  - name: limited
    key: k1
    max_tokens_per_minute_in_k: 1
  - name: unlimited-but-unset
    key: k2
"#,
        )
        .unwrap();
        LimitUsage::new(&config, Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn budget_is_consumed_within_a_minute() {
        let limiter = limiter();
        let minute = 27_000_000;

        limiter.ensure_budget("limited", minute).await.unwrap();
        limiter.debit("limited", 800).await;

        // 200 tokens left, still admitted.
        limiter.ensure_budget("limited", minute).await.unwrap();
        limiter.debit("limited", 300).await;

        // Budget is now -100, the next request in the same minute is rejected.
        let err = limiter.ensure_budget("limited", minute).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn minute_rollover_resets_the_budget() {
        let limiter = limiter();
        let minute = 27_000_000;

        limiter.ensure_budget("limited", minute).await.unwrap();
        limiter.debit("limited", 2_000).await;
        assert!(limiter.ensure_budget("limited", minute).await.is_err());

        // First request of the next minute gets a fresh 1000-token budget.
        limiter.ensure_budget("limited", minute + 1).await.unwrap();
        limiter.debit("limited", 999).await;
        limiter.ensure_budget("limited", minute + 1).await.unwrap();
    }

    #[tokio::test]
    async fn exactly_exhausted_budget_rejects() {
        let limiter = limiter();
        let minute = 27_000_000;
        limiter.ensure_budget("limited", minute).await.unwrap();
        limiter.debit("limited", 1_000).await;
        assert!(limiter.ensure_budget("limited", minute).await.is_err());
    }

    #[tokio::test]
    async fn missing_setting_is_a_configuration_error() {
        let limiter = limiter();
        let err = limiter
            .ensure_budget("unlimited-but-unset", 27_000_000)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn clients_have_independent_buckets() {
        let config = Config::from_yaml(
            r#"
clients:
  - name: a
    key: ka
    max_tokens_per_minute_in_k: 1
  - name: b
    key: kb
    max_tokens_per_minute_in_k: 1
"#,
        )
        .unwrap();
        let limiter = LimitUsage::new(&config, Arc::new(MemoryKvStore::new()));
        let minute = 27_000_000;

        limiter.ensure_budget("a", minute).await.unwrap();
        limiter.debit("a", 5_000).await;
        assert!(limiter.ensure_budget("a", minute).await.is_err());
        assert!(limiter.ensure_budget("b", minute).await.is_ok());
    }
}
