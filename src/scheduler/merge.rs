//! Status merge: decide the single observation written for a tick.
//!
//! Precedence, highest first: active manual override, real-time evaluation,
//! configured default status. A row already ingested for the minute through
//! the webhook or heartbeat API is kept over a real-time or default result.

use chrono::{DateTime, Utc};

use crate::db::{DbError, ManualOverride, Observation, Origin, Persistence, Status};
use crate::eval::Evaluation;

/// Pick the observation for `(tag, ts)` from the available inputs.
///
/// `existing` is the origin of a row already stored for the key, if any.
pub fn merge_status(
    tag: &str,
    ts: DateTime<Utc>,
    realtime: Option<Evaluation>,
    overrides: &[ManualOverride],
    default_status: Option<Status>,
    existing: Option<Origin>,
) -> Option<Observation> {
    let observation = |status: Status, latency: f64, origin: Origin| Observation {
        monitor_tag: tag.to_string(),
        timestamp: ts,
        status,
        latency,
        origin,
    };

    let manual = overrides
        .iter()
        .filter(|o| o.monitor_tag == tag && o.covers(ts))
        .max_by_key(|o| o.status.override_rank());
    if let Some(ov) = manual {
        let latency = realtime.map(|e| e.latency).unwrap_or(0.0);
        return Some(observation(ov.status, latency, Origin::Manual));
    }

    if matches!(existing, Some(Origin::Signal | Origin::Webhook)) {
        return None;
    }

    if let Some(eval) = realtime {
        return Some(observation(eval.status, eval.latency, Origin::Realtime));
    }

    match default_status {
        Some(status) if existing.is_none() => Some(observation(status, 0.0, Origin::DefaultStatus)),
        _ => None,
    }
}

/// Merge and persist the result of one execution.
///
/// The monitor is re-read first; a monitor removed or deactivated while the
/// check ran gets no observation.
pub fn write_merged(
    store: &dyn Persistence,
    tag: &str,
    ts: DateTime<Utc>,
    realtime: Option<Evaluation>,
) -> Result<Option<Observation>, DbError> {
    let monitor = match store.get_monitor(tag)? {
        Some(m) if m.active => m,
        _ => {
            tracing::debug!(monitor = tag, "monitor gone or inactive, discarding result");
            return Ok(None);
        }
    };

    let overrides = store.get_active_overrides(tag, ts)?;
    let existing = store.get_observation(tag, ts)?.map(|obs| obs.origin);

    let merged = merge_status(
        tag,
        ts,
        realtime,
        &overrides,
        monitor.default_status,
        existing,
    );

    if let Some(obs) = &merged {
        store.insert_observation(obs)?;
        tracing::debug!(monitor = tag, status = %obs.status, origin = obs.origin.as_str(), "observation written");
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MonitorDefinition, OverrideKind, Store};
    use chrono::TimeZone;

    fn tick() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn ov(status: Status, kind: OverrideKind) -> ManualOverride {
        ManualOverride {
            id: 0,
            monitor_tag: "api".to_string(),
            kind,
            status,
            title: "planned".to_string(),
            start: tick() - chrono::Duration::hours(1),
            end: None,
        }
    }

    fn up() -> Option<Evaluation> {
        Some(Evaluation { status: Status::Up, latency: 25.0 })
    }

    #[test]
    fn test_manual_override_beats_realtime() {
        let obs = merge_status(
            "api",
            tick(),
            up(),
            &[ov(Status::Maintenance, OverrideKind::Maintenance)],
            None,
            Some(Origin::Webhook),
        )
        .unwrap();
        assert_eq!(obs.status, Status::Maintenance);
        assert_eq!(obs.origin, Origin::Manual);
        assert_eq!(obs.latency, 25.0);
    }

    #[test]
    fn test_overlapping_overrides_rank() {
        let overrides = [
            ov(Status::Maintenance, OverrideKind::Maintenance),
            ov(Status::Down, OverrideKind::Incident),
            ov(Status::Degraded, OverrideKind::Incident),
        ];
        let obs = merge_status("api", tick(), up(), &overrides, None, None).unwrap();
        assert_eq!(obs.status, Status::Down);
    }

    #[test]
    fn test_default_status_only_without_data() {
        let obs = merge_status("api", tick(), None, &[], Some(Status::Down), None).unwrap();
        assert_eq!((obs.status, obs.origin), (Status::Down, Origin::DefaultStatus));

        assert!(merge_status("api", tick(), None, &[], Some(Status::Down), Some(Origin::Realtime)).is_none());
        assert!(merge_status("api", tick(), None, &[], None, None).is_none());

        let realtime = merge_status("api", tick(), up(), &[], Some(Status::Down), None).unwrap();
        assert_eq!(realtime.origin, Origin::Realtime);
    }

    #[test]
    fn test_write_merged_discards_inactive_monitor() {
        let store = Store::open_in_memory().unwrap();
        let mut monitor: MonitorDefinition =
            serde_json::from_str(r#"{"tag": "api", "type": "API", "url": "http://x"}"#).unwrap();
        monitor.active = false;
        store.upsert_monitor(&monitor).unwrap();

        assert!(write_merged(&store, "api", tick(), up()).unwrap().is_none());
        assert!(write_merged(&store, "missing", tick(), up()).unwrap().is_none());
        assert!(store.get_observation("api", tick()).unwrap().is_none());

        monitor.active = true;
        store.upsert_monitor(&monitor).unwrap();
        let written = write_merged(&store, "api", tick(), up()).unwrap().unwrap();
        assert_eq!(store.get_observation("api", tick()).unwrap(), Some(written));
    }

    #[test]
    fn test_ingested_row_survives_scheduled_write() {
        for origin in [Origin::Signal, Origin::Webhook] {
            assert!(merge_status("api", tick(), up(), &[], Some(Status::Down), Some(origin)).is_none());
        }
        // A retried or repeated check still replaces its own row
        let again = merge_status("api", tick(), up(), &[], None, Some(Origin::Realtime)).unwrap();
        assert_eq!(again.origin, Origin::Realtime);

        let store = Store::open_in_memory().unwrap();
        let monitor: MonitorDefinition =
            serde_json::from_str(r#"{"tag": "api", "type": "API", "url": "http://x"}"#).unwrap();
        store.upsert_monitor(&monitor).unwrap();
        store
            .insert_observation(&Observation {
                monitor_tag: "api".into(),
                timestamp: tick(),
                status: Status::Degraded,
                latency: 80.0,
                origin: Origin::Webhook,
            })
            .unwrap();

        assert!(write_merged(&store, "api", tick(), up()).unwrap().is_none());
        let kept = store.get_observation("api", tick()).unwrap().unwrap();
        assert_eq!((kept.status, kept.origin), (Status::Degraded, Origin::Webhook));
    }
}
