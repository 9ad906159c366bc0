//! Group probe: collects the statuses of child monitors.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::{CheckError, ChildStatus, RawResult};
use crate::db::{GroupSettings, Persistence};

/// Read each child's observation for tick `ts`, falling back to the child's
/// latest observation when the tick has not been written yet. Fallbacks
/// older than `max_child_age_minutes` are treated as no data.
pub fn read_group(
    store: &dyn Persistence,
    settings: &GroupSettings,
    ts: DateTime<Utc>,
) -> Result<RawResult, CheckError> {
    let mut children = Vec::with_capacity(settings.monitors.len());
    let oldest = ChronoDuration::try_minutes(settings.max_child_age_minutes.max(0))
        .and_then(|age| ts.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    for tag in &settings.monitors {
        let observation = match store.get_observation(tag, ts) {
            Ok(Some(obs)) => Some(obs),
            Ok(None) => store
                .get_latest_observation(tag)
                .map_err(storage)?
                .filter(|obs| obs.timestamp >= oldest),
            Err(e) => return Err(storage(e)),
        };

        children.push(ChildStatus {
            tag: tag.clone(),
            status: observation.as_ref().map(|o| o.status),
            latency: observation.map(|o| o.latency).unwrap_or(0.0),
        });
    }

    Ok(RawResult::Group { children })
}

fn storage(e: crate::db::DbError) -> CheckError {
    CheckError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Observation, Origin, Status, Store};
    use chrono::TimeZone;

    fn write(store: &Store, tag: &str, ts: DateTime<Utc>, status: Status, latency: f64) {
        store
            .insert_observation(&Observation {
                monitor_tag: tag.to_string(),
                timestamp: ts,
                status,
                latency,
                origin: Origin::Realtime,
            })
            .unwrap();
    }

    #[test]
    fn test_read_group_prefers_tick_then_latest() {
        let store = Store::open_in_memory().unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let earlier = tick - chrono::Duration::minutes(5);

        write(&store, "web", tick, Status::Up, 12.0);
        write(&store, "web", earlier, Status::Down, 0.0);
        write(&store, "db", earlier, Status::Degraded, 40.0);

        let settings = GroupSettings {
            monitors: vec!["web".into(), "db".into(), "cache".into()],
            delay_ms: None,
            max_child_age_minutes: 10,
        };
        let RawResult::Group { children } = read_group(&store, &settings, tick).unwrap() else {
            panic!("expected group result");
        };

        assert_eq!(children[0].status, Some(Status::Up));
        assert_eq!(children[0].latency, 12.0);
        assert_eq!(children[1].status, Some(Status::Degraded));
        assert_eq!(children[2].status, None);
    }

    #[test]
    fn test_stale_child_has_no_data() {
        let store = Store::open_in_memory().unwrap();
        let tick = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        write(&store, "web", tick - chrono::Duration::minutes(10), Status::Down, 0.0);
        write(&store, "db", tick - chrono::Duration::hours(3), Status::Down, 0.0);

        let settings = GroupSettings {
            monitors: vec!["web".into(), "db".into()],
            delay_ms: None,
            max_child_age_minutes: 10,
        };
        let RawResult::Group { children } = read_group(&store, &settings, tick).unwrap() else {
            panic!("expected group result");
        };

        assert_eq!(children[0].status, Some(Status::Down));
        assert_eq!(children[1].status, None);

        let unbounded = GroupSettings { max_child_age_minutes: i64::MAX, ..settings };
        let RawResult::Group { children } = read_group(&store, &unbounded, tick).unwrap() else {
            panic!("expected group result");
        };
        assert_eq!(children[1].status, Some(Status::Down));
    }
}
