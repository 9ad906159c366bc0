//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::port::Persistence;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Conflicting row: {0}")]
    Conflict(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }
}

impl Persistence for Store {
    // --- Monitors ---

    fn get_monitors(&self, filter: &MonitorFilter) -> Result<Vec<MonitorDefinition>, DbError> {
        let definitions: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT definition FROM monitors
                 WHERE (?1 IS NULL OR tag = ?1)
                   AND (?2 IS NULL OR kind = ?2)
                   AND (?3 IS NULL OR active = ?3)
                 ORDER BY tag ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        filter.tag.as_deref(),
                        filter.kind.map(|k| k.as_str()),
                        filter.active,
                    ],
                    |row| row.get(0),
                )?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            rows
        };

        definitions
            .iter()
            .map(|d| serde_json::from_str(d).map_err(DbError::from))
            .collect()
    }

    fn get_monitor(&self, tag: &str) -> Result<Option<MonitorDefinition>, DbError> {
        let definition: Option<String> = self
            .conn()?
            .query_row(
                "SELECT definition FROM monitors WHERE tag = ?1",
                params![tag],
                |row| row.get(0),
            )
            .optional()?;

        match definition {
            Some(d) => Ok(Some(serde_json::from_str(&d)?)),
            None => Ok(None),
        }
    }

    fn upsert_monitor(&self, monitor: &MonitorDefinition) -> Result<(), DbError> {
        let definition = serde_json::to_string(monitor)?;
        self.conn()?.execute(
            "INSERT INTO monitors (tag, kind, active, definition, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(tag) DO UPDATE SET
             kind=excluded.kind, active=excluded.active,
             definition=excluded.definition, updated_at=excluded.updated_at",
            params![
                monitor.tag,
                monitor.kind().as_str(),
                monitor.active,
                definition,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    // --- Observations ---

    fn insert_observation(&self, point: &Observation) -> Result<(), DbError> {
        self.conn()?.execute(
            "INSERT INTO observations (monitor_tag, timestamp, status, latency, origin)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(monitor_tag, timestamp) DO UPDATE SET
             status=excluded.status, latency=excluded.latency, origin=excluded.origin",
            params![
                point.monitor_tag,
                point.timestamp.timestamp(),
                point.status.as_str(),
                point.latency.max(0.0),
                point.origin.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get_observation(
        &self,
        tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Observation>, DbError> {
        let obs = self
            .conn()?
            .query_row(
                "SELECT monitor_tag, timestamp, status, latency, origin FROM observations
                 WHERE monitor_tag = ?1 AND timestamp = ?2",
                params![tag, timestamp.timestamp()],
                row_to_observation,
            )
            .optional()?;
        Ok(obs)
    }

    fn get_latest_observation(&self, tag: &str) -> Result<Option<Observation>, DbError> {
        let obs = self
            .conn()?
            .query_row(
                "SELECT monitor_tag, timestamp, status, latency, origin FROM observations
                 WHERE monitor_tag = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![tag],
                row_to_observation,
            )
            .optional()?;
        Ok(obs)
    }

    fn get_latest_counted_observation(&self, tag: &str) -> Result<Option<Observation>, DbError> {
        let obs = self
            .conn()?
            .query_row(
                "SELECT monitor_tag, timestamp, status, latency, origin FROM observations
                 WHERE monitor_tag = ?1 AND origin != 'MANUAL' ORDER BY timestamp DESC LIMIT 1",
                params![tag],
                row_to_observation,
            )
            .optional()?;
        Ok(obs)
    }

    fn get_latest_observation_by_origin(
        &self,
        tag: &str,
        origin: Origin,
    ) -> Result<Option<Observation>, DbError> {
        let obs = self
            .conn()?
            .query_row(
                "SELECT monitor_tag, timestamp, status, latency, origin FROM observations
                 WHERE monitor_tag = ?1 AND origin = ?2 ORDER BY timestamp DESC LIMIT 1",
                params![tag, origin.as_str()],
                row_to_observation,
            )
            .optional()?;
        Ok(obs)
    }

    fn consecutive_status_holds(
        &self,
        tag: &str,
        statuses: &[Status],
        count: u32,
    ) -> Result<bool, DbError> {
        if count == 0 {
            return Err(DbError::Invalid("count must be at least 1".to_string()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status FROM observations
             WHERE monitor_tag = ?1 AND origin != 'MANUAL'
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let recent = stmt
            .query_map(params![tag, count], |row| {
                let s: String = row.get(0)?;
                parse_column::<Status>(0, &s)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(recent.len() == count as usize && recent.iter().all(|s| statuses.contains(s)))
    }

    fn delete_observations_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let deleted = self.conn()?.execute(
            "DELETE FROM observations WHERE timestamp < ?1",
            params![cutoff.timestamp()],
        )?;
        Ok(deleted)
    }

    // --- Alerts ---

    fn insert_alert(&self, alert: &ActiveAlert) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO alerts (monitor_tag, status_class, state, health_checks, incident_ref,
                                 triggered_at, resolved_at, updated_at, last_observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?8)",
            params![
                alert.monitor_tag,
                alert.status_class.as_str(),
                alert.state.as_str(),
                alert.health_checks,
                alert.incident_ref,
                alert.triggered_at.timestamp(),
                alert.resolved_at.map(|t| t.timestamp()),
                alert.last_observed_at.map(|t| t.timestamp()),
            ],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(DbError::Conflict(format!(
                    "alert already triggered for {} ({})",
                    alert.monitor_tag,
                    alert.status_class.as_str()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_active_alert(
        &self,
        tag: &str,
        class: AlertClass,
    ) -> Result<Option<ActiveAlert>, DbError> {
        let alert = self
            .conn()?
            .query_row(
                "SELECT id, monitor_tag, status_class, state, health_checks, incident_ref,
                        triggered_at, resolved_at, last_observed_at
                 FROM alerts
                 WHERE monitor_tag = ?1 AND status_class = ?2 AND state = 'TRIGGERED'",
                params![tag, class.as_str()],
                row_to_alert,
            )
            .optional()?;
        Ok(alert)
    }

    fn get_alerts(&self, filter: &AlertFilter) -> Result<Vec<ActiveAlert>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, monitor_tag, status_class, state, health_checks, incident_ref,
                    triggered_at, resolved_at, last_observed_at
             FROM alerts
             WHERE (?1 IS NULL OR monitor_tag = ?1)
               AND (?2 IS NULL OR status_class = ?2)
               AND (?3 IS NULL OR state = ?3)
             ORDER BY triggered_at DESC, id DESC",
        )?;
        let alerts = stmt
            .query_map(
                params![
                    filter.monitor_tag.as_deref(),
                    filter.status_class.map(|c| c.as_str()),
                    filter.state.map(|s| s.as_str()),
                ],
                row_to_alert,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(alerts)
    }

    fn update_alert_state(
        &self,
        id: i64,
        state: AlertState,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let updated = self.conn()?.execute(
            "UPDATE alerts SET state = ?1,
                 resolved_at = CASE WHEN ?1 = 'RESOLVED' THEN ?2 ELSE resolved_at END,
                 updated_at = ?2
             WHERE id = ?3",
            params![state.as_str(), at.timestamp(), id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn increment_health_checks(
        &self,
        id: i64,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<u32>, DbError> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "UPDATE alerts SET health_checks = health_checks + 1, last_observed_at = ?2,
                     updated_at = ?3
                 WHERE id = ?1 AND (last_observed_at IS NULL OR last_observed_at < ?2)
                 RETURNING health_checks",
                params![id, observed_at.timestamp(), Utc::now().timestamp()],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        if count.is_none() {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM alerts WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(DbError::NotFound);
            }
        }
        Ok(count)
    }

    fn set_alert_incident(&self, id: i64, incident_ref: &str) -> Result<(), DbError> {
        let updated = self.conn()?.execute(
            "UPDATE alerts SET incident_ref = ?1, updated_at = ?2 WHERE id = ?3",
            params![incident_ref, Utc::now().timestamp(), id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Manual overrides ---

    fn insert_override(&self, ov: &ManualOverride) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO overrides (monitor_tag, kind, status, title, start_ts, end_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                ov.monitor_tag,
                ov.kind.as_str(),
                ov.status.as_str(),
                ov.title,
                ov.start.timestamp(),
                ov.end.map(|t| t.timestamp()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_active_overrides(
        &self,
        tag: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<ManualOverride>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, monitor_tag, kind, status, title, start_ts, end_ts FROM overrides
             WHERE monitor_tag = ?1 AND start_ts <= ?2 AND (end_ts IS NULL OR end_ts > ?2)
             ORDER BY start_ts ASC",
        )?;
        let overrides = stmt
            .query_map(params![tag, timestamp.timestamp()], |row| {
                let kind: String = row.get(2)?;
                let status: String = row.get(3)?;
                Ok(ManualOverride {
                    id: row.get(0)?,
                    monitor_tag: row.get(1)?,
                    kind: parse_column(2, &kind)?,
                    status: parse_column(3, &status)?,
                    title: row.get(4)?,
                    start: from_epoch(row.get(5)?),
                    end: row.get::<_, Option<i64>>(6)?.map(from_epoch),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(overrides)
    }

    // --- Aggregation ---

    fn get_status_counts_by_interval(
        &self,
        tags: &[String],
        start: DateTime<Utc>,
        interval_seconds: i64,
        num_intervals: usize,
    ) -> Result<Vec<AggregationBucket>, DbError> {
        if interval_seconds <= 0 {
            return Err(DbError::Invalid("interval must be positive".to_string()));
        }

        let start_ts = start.timestamp();
        let end_ts = (num_intervals as i64)
            .checked_mul(interval_seconds)
            .and_then(|span| start_ts.checked_add(span))
            .ok_or_else(|| DbError::Invalid("interval window out of range".to_string()))?;
        let mut buckets: Vec<AggregationBucket> = (0..num_intervals)
            .map(|i| AggregationBucket::empty(from_epoch(start_ts + i as i64 * interval_seconds)))
            .collect();

        if tags.is_empty() || num_intervals == 0 {
            return Ok(buckets);
        }

        let placeholders = (0..tags.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT (timestamp - ?1) / ?2 AS bucket,
                    SUM(CASE WHEN status = 'UP' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'DOWN' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'DEGRADED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'MAINTENANCE' THEN 1 ELSE 0 END),
                    AVG(latency)
             FROM observations
             WHERE timestamp >= ?1 AND timestamp < ?3 AND status != 'NO_DATA'
               AND monitor_tag IN ({})
             GROUP BY bucket",
            placeholders
        );

        let mut values = vec![
            Value::Integer(start_ts),
            Value::Integer(interval_seconds),
            Value::Integer(end_ts),
        ];
        values.extend(tags.iter().map(|t| Value::Text(t.clone())));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (index, up, down, degraded, maintenance, avg) in rows {
            if let Some(bucket) = usize::try_from(index).ok().and_then(|i| buckets.get_mut(i)) {
                bucket.count_of_up = up as u64;
                bucket.count_of_down = down as u64;
                bucket.count_of_degraded = degraded as u64;
                bucket.count_of_maintenance = maintenance as u64;
                bucket.avg_latency = avg.unwrap_or(0.0);
            }
        }

        Ok(buckets)
    }
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let status: String = row.get(2)?;
    let origin: String = row.get(4)?;
    Ok(Observation {
        monitor_tag: row.get(0)?,
        timestamp: from_epoch(row.get(1)?),
        status: parse_column(2, &status)?,
        latency: row.get(3)?,
        origin: parse_column(4, &origin)?,
    })
}

fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<ActiveAlert> {
    let class: String = row.get(2)?;
    let state: String = row.get(3)?;
    Ok(ActiveAlert {
        id: row.get(0)?,
        monitor_tag: row.get(1)?,
        status_class: parse_column(2, &class)?,
        state: parse_column(3, &state)?,
        health_checks: row.get(4)?,
        incident_ref: row.get(5)?,
        triggered_at: from_epoch(row.get(6)?),
        resolved_at: row.get::<_, Option<i64>>(7)?.map(from_epoch),
        last_observed_at: row.get::<_, Option<i64>>(8)?.map(from_epoch),
    })
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
