pub mod allow_deployments;
pub mod limit_usage;
pub mod log_usage;
pub mod token_counting;

use aogate_core::config::{Config, PluginConfig};
use aogate_core::error::GatewayError;
use aogate_core::kv::{KvStore, MemoryKvStore, RedisKvStore};
use aogate_core::slip::RoutingSlip;
use async_trait::async_trait;
use std::sync::Arc;

/// A pipeline observer. Each lifecycle event has a default no-op so a plugin
/// only implements the stages it cares about; returning
/// [`GatewayError::Immediate`] short-circuits the event and the request.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Runs once at startup, before the first request is accepted.
    async fn on_plugin_instantiated(&mut self) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Logs plugin-specific configuration at startup.
    fn on_print_configuration(&self) {}

    async fn on_new_request_received(&self, _slip: &mut RoutingSlip) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn on_client_identified(&self, _slip: &mut RoutingSlip) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn on_headers_from_target_received(
        &self,
        _slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Non-streaming responses only, after the body parsed as JSON.
    async fn on_body_dict_from_target_available(
        &self,
        _slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Streaming responses only, once per `data:` payload (except `[DONE]`).
    async fn on_data_event_from_target_received(
        &self,
        _slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Streaming responses only, exactly once after the upstream closes.
    async fn on_end_of_target_response_stream_reached(
        &self,
        _slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// Ordered plugin pipeline. Events fan out to every plugin in configuration
/// order; the first error aborts the remaining plugins for that event.
pub struct PluginBus {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginBus {
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    pub fn on_print_configuration(&self) {
        for plugin in &self.plugins {
            tracing::info!("plugin enabled: {}", plugin.name());
            plugin.on_print_configuration();
        }
    }

    pub async fn on_new_request_received(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        for plugin in &self.plugins {
            plugin.on_new_request_received(slip).await?;
        }
        Ok(())
    }

    pub async fn on_client_identified(&self, slip: &mut RoutingSlip) -> Result<(), GatewayError> {
        for plugin in &self.plugins {
            plugin.on_client_identified(slip).await?;
        }
        Ok(())
    }

    pub async fn on_headers_from_target_received(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        for plugin in &self.plugins {
            plugin.on_headers_from_target_received(slip).await?;
        }
        Ok(())
    }

    pub async fn on_body_dict_from_target_available(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        for plugin in &self.plugins {
            plugin.on_body_dict_from_target_available(slip).await?;
        }
        Ok(())
    }

    pub async fn on_data_event_from_target_received(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        for plugin in &self.plugins {
            plugin.on_data_event_from_target_received(slip).await?;
        }
        Ok(())
    }

    pub async fn on_end_of_target_response_stream_reached(
        &self,
        slip: &mut RoutingSlip,
    ) -> Result<(), GatewayError> {
        for plugin in &self.plugins {
            plugin.on_end_of_target_response_stream_reached(slip).await?;
        }
        Ok(())
    }
}

/// Build the plugin pipeline from configuration, in declared order, and run
/// the startup hooks. Sinks that need remote resources (Redis, token
/// endpoints) connect here so misconfiguration fails the process early.
pub async fn build_bus(config: &Config) -> Result<PluginBus, GatewayError> {
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();
    for plugin_config in &config.plugins {
        let plugin: Box<dyn Plugin> = match plugin_config {
            PluginConfig::AllowDeployments => {
                Box::new(allow_deployments::AllowDeployments::new(config))
            }
            PluginConfig::LimitUsage { redis } => {
                let store: Arc<dyn KvStore> = match redis {
                    Some(redis) => {
                        Arc::new(RedisKvStore::connect(&redis.host, &redis.password).await?)
                    }
                    None => Arc::new(MemoryKvStore::new()),
                };
                Box::new(limit_usage::LimitUsage::new(config, store))
            }
            PluginConfig::LogUsageToConsole => Box::new(log_usage::LogUsage::new(Box::new(
                log_usage::console::ConsoleSink::new(),
            ))),
            PluginConfig::LogUsageToCsvFile { log_dir } => Box::new(log_usage::LogUsage::new(
                Box::new(log_usage::csv_file::CsvFileSink::new(log_dir.as_deref())),
            )),
            PluginConfig::LogUsageToLogAnalytics(la) => Box::new(log_usage::LogUsage::new(
                Box::new(log_usage::log_analytics::LogAnalyticsSink::new(la.clone())),
            )),
        };
        plugins.push(plugin);
    }
    for plugin in &mut plugins {
        plugin.on_plugin_instantiated().await?;
    }
    Ok(PluginBus::new(plugins))
}
