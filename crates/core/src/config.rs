use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ─── Config ────────────────────────────────────────────────────────────────

/// Validated proxy configuration. Immutable after startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub clients: Vec<ClientConfig>,
    pub plugins: Vec<PluginConfig>,
    pub aoai: AoaiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub uses_entra_id_auth: bool,
    #[serde(default)]
    pub deployments_allowed: Option<DeploymentsAllowed>,
    #[serde(default)]
    pub max_tokens_per_minute_in_k: Option<f64>,
}

/// A client's allowed deployments, either as a list or a comma-separated
/// string ("gpt-35-turbo, gpt-4").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeploymentsAllowed {
    List(Vec<String>),
    Csv(String),
}

impl DeploymentsAllowed {
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            Self::Csv(value) => value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, deployment: &str) -> bool {
        match self {
            Self::List(items) => items.iter().any(|item| item == deployment),
            Self::Csv(value) => value.split(',').any(|item| item.trim() == deployment),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AoaiConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub mock_response: Option<MockResponseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub non_streaming_fraction: Option<f64>,
    #[serde(default)]
    pub virtual_deployments: Option<Vec<VirtualDeploymentConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDeploymentConfig {
    pub name: String,
    pub standins: Vec<StandinConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandinConfig {
    pub name: String,
    #[serde(default)]
    pub non_streaming_fraction: Option<f64>,
}

/// Synthetic response served instead of contacting any backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResponseConfig {
    pub json: serde_json::Value,
    #[serde(default)]
    pub ms_to_wait_before_return: Option<u64>,
}

// ─── Plugin configuration ──────────────────────────────────────────────────

/// Ordered plugin list; the variant tag is the plugin name in the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum PluginConfig {
    AllowDeployments,
    LimitUsage {
        #[serde(default)]
        redis: Option<RedisConfig>,
    },
    LogUsageToConsole,
    LogUsageToCsvFile {
        #[serde(default)]
        log_dir: Option<String>,
    },
    LogUsageToLogAnalytics(LogAnalyticsConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogAnalyticsConfig {
    pub log_ingestion_endpoint: String,
    pub data_collection_rule_id: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    pub credential_tenant_id: String,
    pub credential_client_id: String,
    pub credential_client_secret: String,
}

fn default_stream_name() -> String {
    "Custom-AzureOpenAIUsage_CL".to_string()
}

// ─── Loading & validation ──────────────────────────────────────────────────

impl Config {
    /// Parse a YAML (or JSON) configuration string and validate it.
    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_env_var(name: &str) -> Result<Self, anyhow::Error> {
        let contents = std::env::var(name).map_err(|_| {
            anyhow::anyhow!("environment variable '{name}' with the configuration does not exist")
        })?;
        Self::from_yaml(&contents)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        let mut names = HashSet::new();
        let mut keys = HashSet::new();
        let mut entra_clients = 0usize;
        for client in &self.clients {
            anyhow::ensure!(!client.name.is_empty(), "client names must not be empty");
            anyhow::ensure!(
                names.insert(client.name.as_str()),
                "client name '{}' is configured more than once",
                client.name
            );
            if let Some(ref key) = client.key {
                anyhow::ensure!(
                    keys.insert(key.as_str()),
                    "client '{}' reuses a key already assigned to another client",
                    client.name
                );
            }
            if client.uses_entra_id_auth {
                entra_clients += 1;
            }
            anyhow::ensure!(
                client.key.is_some() || client.uses_entra_id_auth,
                "client '{}' needs a key or uses_entra_id_auth: true",
                client.name
            );
        }
        anyhow::ensure!(
            entra_clients <= 1,
            "at most one client may set uses_entra_id_auth: true"
        );

        let mut last_flat_fraction = None;
        for endpoint in &self.aoai.endpoints {
            anyhow::ensure!(!endpoint.name.is_empty(), "endpoint names must not be empty");
            if let Some(ref virtual_deployments) = endpoint.virtual_deployments {
                for virtual_deployment in virtual_deployments {
                    anyhow::ensure!(
                        !virtual_deployment.standins.is_empty(),
                        "virtual deployment '{}' of endpoint '{}' has no standins",
                        virtual_deployment.name,
                        endpoint.name
                    );
                    for standin in &virtual_deployment.standins {
                        validate_fraction(
                            standin.non_streaming_fraction,
                            &format!(
                                "standin '{}' of virtual deployment '{}'",
                                standin.name, virtual_deployment.name
                            ),
                        )?;
                    }
                    // The last standin must take every non-streaming request,
                    // otherwise requests could be rejected by chance alone.
                    let last = virtual_deployment
                        .standins
                        .last()
                        .and_then(|s| s.non_streaming_fraction);
                    anyhow::ensure!(
                        last.is_none() || last == Some(1.0),
                        "the last standin of virtual deployment '{}' must have non_streaming_fraction 1",
                        virtual_deployment.name
                    );
                }
            } else {
                validate_fraction(
                    endpoint.non_streaming_fraction,
                    &format!("endpoint '{}'", endpoint.name),
                )?;
                last_flat_fraction = Some(endpoint.non_streaming_fraction);
            }
        }
        if let Some(fraction) = last_flat_fraction {
            anyhow::ensure!(
                fraction.is_none() || fraction == Some(1.0),
                "the last endpoint must have non_streaming_fraction 1"
            );
        }

        Ok(())
    }

    // ─── Accessors ─────────────────────────────────────────────────────────

    pub fn client(&self, name: &str) -> Option<&ClientConfig> {
        self.clients.iter().find(|client| client.name == name)
    }

    pub fn client_for_key(&self, key: &str) -> Option<&ClientConfig> {
        self.clients
            .iter()
            .find(|client| client.key.as_deref() == Some(key))
    }

    pub fn entra_id_client(&self) -> Option<&ClientConfig> {
        self.clients.iter().find(|client| client.uses_entra_id_auth)
    }
}

fn validate_fraction(fraction: Option<f64>, what: &str) -> Result<(), anyhow::Error> {
    if let Some(fraction) = fraction {
        anyhow::ensure!(
            (0.0..=1.0).contains(&fraction),
            "non_streaming_fraction of {what} must be within [0, 1]"
        );
    }
    Ok(())
}
