//! Retention manager for cleaning up old observations.

use crate::db::Persistence;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Deletes observations older than the retention horizon.
pub struct RetentionManager {
    store: Arc<dyn Persistence>,
    retention_days: i64,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn Persistence>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let retention_days = self.retention_days;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(3600));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(store.as_ref(), retention_days);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete everything older than `retention_days`. Returns the number of rows removed.
pub fn process_retention(store: &dyn Persistence, retention_days: i64) -> usize {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days);

    match store.delete_observations_before(cutoff) {
        Ok(0) => 0,
        Ok(deleted) => {
            tracing::info!("RetentionManager: deleted {} observations before {}", deleted, cutoff);
            deleted
        }
        Err(e) => {
            tracing::error!("RetentionManager: failed to delete observations: {}", e);
            0
        }
    }
}
