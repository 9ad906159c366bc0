//! One monitor execution: check, classify, merge, write, then queue alerts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::merge::write_merged;
use super::queue::TaskPool;
use crate::alert::AlertEngine;
use crate::config::ServerConfig;
use crate::db::{MonitorDefinition, MonitorKind, MonitorSpec, Observation, Persistence};
use crate::eval::{Evaluation, Evaluator};
use crate::probe::{run_check, CheckContext, CheckError};

/// The three background pools.
#[derive(Clone)]
pub struct Pools {
    /// Delayed retries of timed-out checks.
    pub retry: TaskPool,
    /// Alert evaluation after observation writes.
    pub alert: TaskPool,
    /// Single worker: GROUP derivation and write.
    pub serial: TaskPool,
}

impl Pools {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            retry: TaskPool::new("retry", cfg.retry_workers, cfg.queue_capacity, cfg.retry_timeout),
            alert: TaskPool::new("alert", cfg.alert_workers, cfg.queue_capacity, cfg.alert_timeout),
            serial: TaskPool::new("serial", 1, cfg.queue_capacity, cfg.serial_timeout),
        }
    }
}

/// Which monitor types get a second attempt after a timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub types: Vec<MonitorKind>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn applies(&self, kind: MonitorKind, err: &CheckError) -> bool {
        err.is_timeout() && self.types.contains(&kind)
    }
}

pub struct Executor {
    ctx: CheckContext,
    evaluator: Evaluator,
    store: Arc<dyn Persistence>,
    alerts: Arc<AlertEngine>,
    pools: Pools,
    retry: RetryPolicy,
    alert_delay: Duration,
    group_delay: Duration,
}

impl Executor {
    pub fn new(
        ctx: CheckContext,
        store: Arc<dyn Persistence>,
        alerts: Arc<AlertEngine>,
        pools: Pools,
        cfg: &ServerConfig,
    ) -> Self {
        Self {
            ctx,
            evaluator: Evaluator::new(),
            store,
            alerts,
            pools,
            retry: RetryPolicy {
                types: cfg.retry_types.clone(),
                backoff: cfg.retry_backoff,
            },
            alert_delay: cfg.alert_delay,
            group_delay: cfg.group_delay,
        }
    }

    /// Run one execution of `monitor` for tick `ts`.
    pub async fn execute(self: &Arc<Self>, monitor: MonitorDefinition, ts: DateTime<Utc>) {
        if let MonitorSpec::Group(settings) = &monitor.spec {
            // Let children write their observations for this tick first
            let delay = settings.delay_ms.map(Duration::from_millis).unwrap_or(self.group_delay);
            tokio::time::sleep(delay).await;

            let this = self.clone();
            let tag = monitor.tag.clone();
            if let Err(e) = self.pools.serial.submit(async move { this.check_and_write(&monitor, ts).await }) {
                tracing::warn!(monitor = %tag, "group derivation skipped: {}", e);
            }
            return;
        }

        self.check_and_write(&monitor, ts).await;
    }

    async fn check_and_write(self: &Arc<Self>, monitor: &MonitorDefinition, ts: DateTime<Utc>) {
        let start = Instant::now();
        let evaluation = match run_check(monitor, ts, &self.ctx).await {
            Ok(raw) => self.evaluator.classify(monitor, &raw),
            Err(e) if self.retry.applies(monitor.kind(), &e) => {
                tracing::info!(monitor = %monitor.tag, "check timed out, retrying in {:?}", self.retry.backoff);
                let this = self.clone();
                let monitor = monitor.clone();
                self.pools.retry.submit_after(self.retry.backoff, async move {
                    this.retry_and_write(&monitor, ts).await;
                });
                return;
            }
            Err(e) => Some(self.evaluator.classify_error(monitor, &e, elapsed_ms(start))),
        };

        self.write(monitor, ts, evaluation);
    }

    /// Second and final attempt: another timeout is DOWN.
    async fn retry_and_write(&self, monitor: &MonitorDefinition, ts: DateTime<Utc>) {
        let start = Instant::now();
        let evaluation = match run_check(monitor, ts, &self.ctx).await {
            Ok(raw) => self.evaluator.classify(monitor, &raw),
            Err(e) => Some(self.evaluator.classify_error(monitor, &e, elapsed_ms(start))),
        };
        self.write(monitor, ts, evaluation);
    }

    fn write(&self, monitor: &MonitorDefinition, ts: DateTime<Utc>, evaluation: Option<Evaluation>) {
        match write_merged(self.store.as_ref(), &monitor.tag, ts, evaluation) {
            Ok(Some(obs)) => self.observation_written(&obs),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(monitor = %monitor.tag, "failed to write observation: {}", e);
            }
        }
    }

    /// Queue alert evaluation for a freshly written observation.
    pub fn observation_written(&self, obs: &Observation) {
        let alerts = self.alerts.clone();
        let tag = obs.monitor_tag.clone();
        self.pools.alert.submit_after(self.alert_delay, async move {
            if let Err(e) = alerts.evaluate(&tag).await {
                tracing::error!(monitor = %tag, "alert evaluation failed: {}", e);
            }
        });
    }

    /// Drop per-monitor state held for a stopped monitor.
    pub fn forget(&self, tag: &str) {
        self.evaluator.forget(tag);
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
