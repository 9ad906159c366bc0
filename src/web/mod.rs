//! HTTP API: webhook and heartbeat ingestion plus read endpoints.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Persistence;
use crate::scheduler::Executor;
use crate::uptime::UptimeAggregator;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn Persistence>,
    /// Writes through the API queue alert evaluation like scheduled ones.
    pub executor: Arc<Executor>,
    pub uptime: Arc<UptimeAggregator>,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<dyn Persistence>, executor: Arc<Executor>) -> Self {
        let uptime = Arc::new(UptimeAggregator::new(store.clone()));
        Self {
            state: AppState {
                config,
                store,
                executor,
                uptime,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            // Ingestion
            .route("/api/webhook", post(handlers::handle_webhook))
            .route(
                "/api/heartbeat/{tag}/{secret}",
                get(handlers::handle_heartbeat).post(handlers::handle_heartbeat),
            )
            // Reads
            .route("/api/monitors", get(handlers::handle_get_monitors))
            .route("/api/alerts", get(handlers::handle_get_alerts))
            .route("/api/uptime", get(handlers::handle_get_uptime))
            // Incidents and maintenance windows
            .route("/api/overrides", post(handlers::handle_create_override))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alert::{AlertEngine, ChannelSender, Dispatcher, HttpSender};
    use crate::probe::CheckContext;
    use crate::scheduler::Pools;

    /// State wired to `store` with no notification channels reachable.
    pub(crate) fn state(store: Arc<dyn Persistence>) -> AppState {
        let cfg = ServerConfig::default();
        let sender: Arc<dyn ChannelSender> = Arc::new(HttpSender::new(reqwest::Client::new()));
        let alerts = Arc::new(AlertEngine::new(store.clone(), Arc::new(Dispatcher::new(sender)), None));
        let ctx = CheckContext {
            http: reqwest::Client::new(),
            store: store.clone(),
            check_timeout: cfg.check_timeout,
            socket_timeout: cfg.socket_timeout,
            resolver: cfg.resolver.clone(),
        };
        let executor = Arc::new(Executor::new(ctx, store.clone(), alerts, Pools::from_config(&cfg), &cfg));
        Server::new(cfg, store, executor).state
    }

    pub(crate) fn router(store: Arc<dyn Persistence>) -> Router {
        Server { state: state(store) }.routes()
    }
}
