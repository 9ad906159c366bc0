//! uptrail - uptime monitoring server.

use uptrail::alert::{AlertEngine, ChannelSender, Dispatcher, GithubTracker, HttpSender, IncidentTracker};
use uptrail::config::ServerConfig;
use uptrail::db::{MonitorDefinition, Persistence, Store};
use uptrail::probe::CheckContext;
use uptrail::scheduler::{Executor, Pools, RetentionManager, Scheduler};
use uptrail::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("uptrail=info".parse()?))
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("Starting uptrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    let store: Arc<dyn Persistence> = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    if let Some(path) = &cfg.monitors_file {
        let count = load_monitors(store.as_ref(), path)?;
        tracing::info!("Loaded {} monitor definitions from {}", count, path);
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("uptrail/", env!("CARGO_PKG_VERSION")))
        .timeout(cfg.check_timeout)
        .build()?;

    let sender: Arc<dyn ChannelSender> = Arc::new(HttpSender::new(http.clone()));
    let dispatcher = Arc::new(Dispatcher::new(sender).with_timeout(cfg.alert_timeout));
    let incidents = cfg.github.as_ref().map(|gh| {
        tracing::info!("Tracking incidents in {}", gh.repo);
        Arc::new(GithubTracker::new(http.clone(), &gh.api_base, &gh.repo, &gh.token)) as Arc<dyn IncidentTracker>
    });
    let alerts = Arc::new(AlertEngine::new(store.clone(), dispatcher, incidents));

    let ctx = CheckContext {
        http,
        store: store.clone(),
        check_timeout: cfg.check_timeout,
        socket_timeout: cfg.socket_timeout,
        resolver: cfg.resolver.clone(),
    };
    let executor = Arc::new(Executor::new(ctx, store.clone(), alerts, Pools::from_config(&cfg), &cfg));

    let scheduler = Arc::new(Scheduler::new(store.clone(), executor.clone(), cfg.refresh_interval));
    scheduler.start().await?;

    let retention = RetentionManager::new(store.clone(), cfg.retention_days);
    retention.start();

    let server = Server::new(cfg, store, executor);
    server.start().await?;

    Ok(())
}

/// Upsert every definition in a JSON array file.
fn load_monitors(store: &dyn Persistence, path: &str) -> Result<usize, BoxError> {
    let raw = std::fs::read_to_string(path)?;
    let monitors: Vec<MonitorDefinition> = serde_json::from_str(&raw)?;
    for monitor in &monitors {
        store.upsert_monitor(monitor)?;
    }
    Ok(monitors.len())
}
