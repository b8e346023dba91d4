pub mod dispatch;
pub mod forward;
pub mod handler;
pub mod identify;
pub mod registry;

use aogate_core::config::Config;
use aogate_plugin::PluginBus;
use axum::Router;
use axum::routing::get;
use registry::EndpointRegistry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<EndpointRegistry>,
    pub plugins: Arc<PluginBus>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/powerproxy/health/liveness", get(handler::liveness))
        .route("/", get(handler::proxy).post(handler::proxy))
        .route("/{*path}", get(handler::proxy).post(handler::proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
