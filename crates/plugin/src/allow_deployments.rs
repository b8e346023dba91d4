//! Blocks access to deployments that are not allow-listed for the client.

use crate::Plugin;
use aogate_core::config::{Config, DeploymentsAllowed};
use aogate_core::error::{GatewayError, ImmediateResponse};
use aogate_core::slip::RoutingSlip;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;
use std::collections::HashMap;

pub struct AllowDeployments {
    /// Allowed deployments per client; `None` marks a client that misses the
    /// setting entirely, which is a configuration error at request time.
    clients: HashMap<String, Option<DeploymentsAllowed>>,
}

impl AllowDeployments {
    pub fn new(config: &Config) -> Self {
        let clients = config
            .clients
            .iter()
            .map(|client| (client.name.clone(), client.deployments_allowed.clone()))
            .collect();
        Self { clients }
    }
}

#[async_trait]
impl Plugin for AllowDeployments {
    fn name(&self) -> &str {
        "AllowDeployments"
    }

    async fn on_client_identified(&self, slip: &mut RoutingSlip) -> Result<(), GatewayError> {
        let Some(client) = slip.client.as_deref() else {
            return Ok(());
        };

        let allowed = match self.clients.get(client) {
            Some(Some(allowed)) => allowed,
            _ => {
                return Err(ImmediateResponse::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({
                        "error": format!(
                            "Configuration for client '{client}' misses a valid \
                             'deployments_allowed' setting. This needs to be set when the \
                             AllowDeployments plugin is enabled."
                        )
                    }),
                )
                .into());
            }
        };

        let requested = slip.virtual_deployment.as_deref().unwrap_or("");
        if !allowed.contains(requested) {
            return Err(ImmediateResponse::json(
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": format!(
                        "Access to requested deployment '{requested}' is denied. The \
                         configuration for client '{client}' misses a 'deployments_allowed' \
                         setting which includes that deployment."
                    )
                }),
            )
            .into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method};
    use bytes::Bytes;

    fn plugin() -> AllowDeployments {
        let config = Config::from_yaml(
            r#"
clients:
  - name: listed
    key: k1
    deployments_allowed: [gpt-4, gpt-35-turbo]
  - name: csv
    key: k2
    deployments_allowed: "embedding-ada, gpt-4"
  - name: unconfigured
    key: k3
"#,
        )
        .unwrap();
        AllowDeployments::new(&config)
    }

    fn slip(client: Option<&str>, path: &str) -> RoutingSlip {
        let mut slip = RoutingSlip::new(
            Method::POST,
            path.to_string(),
            None,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        );
        slip.client = client.map(|c| c.to_string());
        slip
    }

    #[tokio::test]
    async fn allows_listed_deployment() {
        let mut slip = slip(Some("listed"), "openai/deployments/gpt-4/chat/completions");
        assert!(plugin().on_client_identified(&mut slip).await.is_ok());
    }

    #[tokio::test]
    async fn allows_deployment_from_csv_setting() {
        let mut slip = slip(Some("csv"), "openai/deployments/embedding-ada/embeddings");
        assert!(plugin().on_client_identified(&mut slip).await.is_ok());
    }

    #[tokio::test]
    async fn denies_unlisted_deployment() {
        let mut slip = slip(Some("listed"), "openai/deployments/gpt-5/chat/completions");
        let err = plugin().on_client_identified(&mut slip).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_setting_is_a_configuration_error() {
        let mut slip = slip(Some("unconfigured"), "openai/deployments/gpt-4/x");
        let err = plugin().on_client_identified(&mut slip).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn anonymous_requests_pass_through() {
        let mut slip = slip(None, "openai/deployments/gpt-4/x");
        assert!(plugin().on_client_identified(&mut slip).await.is_ok());
    }
}
