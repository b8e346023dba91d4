//! Application assembly and serving.

use aogate_core::config::Config;
use aogate_server::registry::EndpointRegistry;
use aogate_server::{AppState, build_router};
use anyhow::Context;
use std::sync::Arc;

pub struct Application {
    router: axum::Router,
    port: u16,
}

impl Application {
    /// Build the application: expand the endpoint registry, construct the
    /// plugin pipeline, and log the effective configuration.
    pub async fn build(config: Config, port: u16) -> anyhow::Result<Self> {
        let registry =
            EndpointRegistry::from_config(&config).context("failed to build endpoint registry")?;
        let plugins = aogate_plugin::build_bus(&config)
            .await
            .context("failed to build plugin pipeline")?;

        let client_names: Vec<&str> = config
            .clients
            .iter()
            .map(|client| client.name.as_str())
            .collect();
        tracing::info!("clients identified by API key: {}", client_names.join(", "));
        if let Some(entra) = config.entra_id_client() {
            tracing::info!("Entra ID requests map to client '{}'", entra.name);
        }
        if config.aoai.mock_response.is_some() {
            tracing::info!("mock response enabled, no backend will be contacted");
        } else {
            for endpoint in &config.aoai.endpoints {
                tracing::info!("endpoint '{}' at {}", endpoint.name, endpoint.url);
            }
        }
        plugins.on_print_configuration();

        let state = AppState {
            config: Arc::new(config),
            registry: Arc::new(registry),
            plugins: Arc::new(plugins),
        };
        Ok(Self {
            router: build_router(state),
            port,
        })
    }

    /// Bind and serve until ctrl-c or SIGTERM.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("serving incoming requests on {addr}");
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("signal handler installs")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
