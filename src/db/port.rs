//! Persistence port consumed by the engine.
//!
//! The scheduler, alert engine and uptime aggregator only see this trait; the
//! SQLite [`Store`](super::Store) is the production implementation and is
//! constructed once in `main`.

use chrono::{DateTime, Utc};

use super::models::*;
use super::DbError;

pub trait Persistence: Send + Sync {
    // --- Monitors ---

    fn get_monitors(&self, filter: &MonitorFilter) -> Result<Vec<MonitorDefinition>, DbError>;

    fn get_monitor(&self, tag: &str) -> Result<Option<MonitorDefinition>, DbError>;

    fn upsert_monitor(&self, monitor: &MonitorDefinition) -> Result<(), DbError>;

    // --- Observations ---

    /// Insert or overwrite the observation keyed by `(monitor_tag, timestamp)`.
    fn insert_observation(&self, point: &Observation) -> Result<(), DbError>;

    fn get_observation(
        &self,
        tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Observation>, DbError>;

    fn get_latest_observation(&self, tag: &str) -> Result<Option<Observation>, DbError>;

    /// Latest observation that counts toward alert thresholds (non-manual).
    fn get_latest_counted_observation(&self, tag: &str) -> Result<Option<Observation>, DbError>;

    fn get_latest_observation_by_origin(
        &self,
        tag: &str,
        origin: Origin,
    ) -> Result<Option<Observation>, DbError>;

    /// True when the most recent `count` non-manual observations all have a
    /// status in `statuses`. Fewer than `count` observations yields false.
    fn consecutive_status_holds(
        &self,
        tag: &str,
        statuses: &[Status],
        count: u32,
    ) -> Result<bool, DbError>;

    fn delete_observations_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError>;

    // --- Alerts ---

    /// Insert a new alert row and return its id. Fails with
    /// [`DbError::Conflict`] if a TRIGGERED row already exists for the key.
    fn insert_alert(&self, alert: &ActiveAlert) -> Result<i64, DbError>;

    fn get_active_alert(
        &self,
        tag: &str,
        class: AlertClass,
    ) -> Result<Option<ActiveAlert>, DbError>;

    fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<ActiveAlert>, DbError>;

    fn update_alert_state(
        &self,
        id: i64,
        state: AlertState,
        at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Count the observation at `observed_at` into the alert and return the
    /// new health check count. Returns `None` when an observation at or after
    /// `observed_at` was already counted.
    fn increment_health_checks(
        &self,
        id: i64,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<u32>, DbError>;

    fn set_alert_incident(&self, id: i64, incident_ref: &str) -> Result<(), DbError>;

    // --- Manual overrides ---

    fn insert_override(&self, ov: &ManualOverride) -> Result<i64, DbError>;

    fn get_active_overrides(
        &self,
        tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<ManualOverride>, DbError>;

    // --- Aggregation ---

    /// Status counts for `num_intervals` consecutive buckets of
    /// `interval_seconds` starting at `start`, summed across `tags`.
    fn get_status_counts_by_interval(
        &self,
        tags: &[String],
        start: DateTime<Utc>,
        interval_seconds: i64,
        num_intervals: usize,
    ) -> Result<Vec<AggregationBucket>, DbError>;
}
