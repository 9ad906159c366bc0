//! Scheduler module: per-monitor timing loops feeding the execution pipeline.

mod execute;
mod merge;
mod queue;
mod retention;
mod timing;

pub use execute::*;
pub use merge::*;
pub use queue::*;
pub use retention::*;
pub use timing::*;

use crate::db::{MonitorDefinition, MonitorFilter, Persistence};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

struct Running {
    monitor: MonitorDefinition,
    stop: broadcast::Sender<()>,
}

/// The main scheduler that runs one loop per active monitor.
pub struct Scheduler {
    store: Arc<dyn Persistence>,
    executor: Arc<Executor>,
    running: Arc<RwLock<HashMap<String, Running>>>,
    refresh_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Persistence>, executor: Arc<Executor>, refresh_interval: Duration) -> Self {
        Self {
            store,
            executor,
            running: Arc::new(RwLock::new(HashMap::new())),
            refresh_interval,
        }
    }

    /// Start monitoring and keep the monitor set in sync with the store.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::db::DbError> {
        let count = self.sync_monitors().await?;
        tracing::info!("Starting scheduler with {} monitors", count);

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = scheduler.sync_monitors().await {
                    tracing::error!("Scheduler: failed to refresh monitors: {}", e);
                }
            }
        });

        Ok(())
    }

    /// Start new or changed monitors and stop removed or inactive ones.
    /// Returns the number of monitors running afterwards.
    pub async fn sync_monitors(&self) -> Result<usize, crate::db::DbError> {
        let monitors = self.store.get_monitors(&MonitorFilter::active())?;
        let wanted: HashMap<String, MonitorDefinition> =
            monitors.into_iter().map(|m| (m.tag.clone(), m)).collect();

        let stale: Vec<String> = {
            let running = self.running.read().await;
            running
                .iter()
                .filter(|(tag, r)| wanted.get(*tag) != Some(&r.monitor))
                .map(|(tag, _)| tag.clone())
                .collect()
        };
        for tag in stale {
            self.remove_monitor(&tag).await;
        }

        for monitor in wanted.into_values() {
            self.add_monitor(monitor).await;
        }

        Ok(self.running.read().await.len())
    }

    /// Add a monitor to be scheduled. No-op if it is already running.
    pub async fn add_monitor(&self, monitor: MonitorDefinition) {
        let timing = match Timing::parse(&monitor.schedule) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(monitor = %monitor.tag, "not scheduling monitor: {}", e);
                return;
            }
        };

        let mut running = self.running.write().await;
        if running.contains_key(&monitor.tag) {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        running.insert(
            monitor.tag.clone(),
            Running {
                monitor: monitor.clone(),
                stop: stop_tx.clone(),
            },
        );
        drop(running);

        tracing::info!("Scheduler: Adding monitor {}", monitor.tag);

        let executor = self.executor.clone();
        tokio::spawn(run_monitor_loop(monitor, timing, executor, stop_tx.subscribe()));
    }

    /// Stop scheduling a monitor.
    pub async fn remove_monitor(&self, tag: &str) {
        let mut running = self.running.write().await;

        if let Some(r) = running.remove(tag) {
            let _ = r.stop.send(());
            self.executor.forget(tag);
            tracing::info!("Scheduler: Removed monitor {}", tag);
        }
    }

    pub async fn running_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.running.read().await.keys().cloned().collect();
        tags.sort();
        tags
    }
}

/// Fire the monitor at each due minute until stopped.
async fn run_monitor_loop(
    monitor: MonitorDefinition,
    timing: Timing,
    executor: Arc<Executor>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut after = Utc::now();
    loop {
        let next = match timing.next_after(after) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(monitor = %monitor.tag, "schedule stopped: {}", e);
                break;
            }
        };

        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = sleep_until(next) => {
                let executor = executor.clone();
                let m = monitor.clone();
                spawn_logged(&monitor.tag, async move {
                    executor.execute(m, next).await;
                });
                after = resume_after(next, Utc::now());
            }
        }
    }
}

/// Where to look for the next fire after firing `fired`. The wall clock may
/// read slightly before `fired` once the timer elapses; searching from `fired`
/// keeps the same minute from firing twice, while a clock far ahead skips the
/// minutes already missed.
fn resume_after(fired: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    fired.max(now)
}

async fn sleep_until(at: DateTime<Utc>) {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(wait).await;
}

/// Spawn one execution and log it if it panics.
fn spawn_logged<F>(tag: &str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let tag = tag.to_string();
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                tracing::error!(monitor = %tag, "execution panicked: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertEngine, ChannelSender, Dispatcher, HttpSender};
    use crate::config::ServerConfig;
    use crate::db::Store;
    use crate::probe::CheckContext;

    fn scheduler(store: Arc<Store>) -> Arc<Scheduler> {
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
        Arc::new(Scheduler::new(store, executor, cfg.refresh_interval))
    }

    fn upsert(store: &Store, json: &str) -> MonitorDefinition {
        let m: MonitorDefinition = serde_json::from_str(json).unwrap();
        store.upsert_monitor(&m).unwrap();
        m
    }

    #[tokio::test]
    async fn test_sync_monitors_follows_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sched = scheduler(store.clone());

        upsert(&store, r#"{"tag": "a", "type": "API", "url": "http://a"}"#);
        let mut b = upsert(&store, r#"{"tag": "b", "type": "API", "url": "http://b"}"#);
        upsert(&store, r#"{"tag": "c", "type": "API", "url": "http://c", "active": false}"#);
        upsert(&store, r#"{"tag": "bad", "type": "API", "url": "http://x", "schedule": {"cron": "nope"}}"#);

        assert_eq!(sched.sync_monitors().await.unwrap(), 2);
        assert_eq!(sched.running_tags().await, vec!["a", "b"]);

        b.active = false;
        store.upsert_monitor(&b).unwrap();
        sched.sync_monitors().await.unwrap();
        assert_eq!(sched.running_tags().await, vec!["a"]);
    }

    #[test]
    fn test_lagging_clock_does_not_refire_minute() {
        use chrono::TimeZone;

        let timing = Timing::parse(&crate::db::Schedule::Every(1)).unwrap();
        let fired = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let lagging = fired - chrono::Duration::milliseconds(200);

        let next = timing.next_after(resume_after(fired, lagging)).unwrap();
        assert_eq!(next, fired + chrono::Duration::minutes(1));

        // After a long stall the missed minutes are skipped
        let late = fired + chrono::Duration::minutes(10) + chrono::Duration::seconds(5);
        let next = timing.next_after(resume_after(fired, late)).unwrap();
        assert_eq!(next, fired + chrono::Duration::minutes(11));
    }

    #[tokio::test]
    async fn test_changed_monitor_is_restarted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sched = scheduler(store.clone());

        let mut a = upsert(&store, r#"{"tag": "a", "type": "API", "url": "http://a"}"#);
        sched.sync_monitors().await.unwrap();

        a.schedule = crate::db::Schedule::Every(5);
        store.upsert_monitor(&a).unwrap();
        sched.sync_monitors().await.unwrap();

        let running = sched.running.read().await;
        assert_eq!(running["a"].monitor.schedule, crate::db::Schedule::Every(5));
    }
}
