//! Passive heartbeat reader.

use super::{CheckError, RawResult};
use crate::db::{HeartbeatSettings, Origin, Persistence};

/// Look up the most recent heartbeat signal for `tag`.
///
/// Signals are written by the heartbeat endpoint; this never contacts
/// the monitored system.
pub fn read_heartbeat(
    store: &dyn Persistence,
    tag: &str,
    settings: &HeartbeatSettings,
) -> Result<RawResult, CheckError> {
    let latest = store
        .get_latest_observation_by_origin(tag, Origin::Signal)
        .map_err(|e| CheckError::Storage(e.to_string()))?;

    Ok(RawResult::Heartbeat {
        last_signal: latest.map(|o| o.timestamp),
        window_minutes: settings.expect_within_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Observation, Status, Store};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_read_heartbeat_ignores_other_origins() {
        let store = Store::open_in_memory().unwrap();
        let settings = HeartbeatSettings {
            secret: "s3cret".to_string(),
            expect_within_minutes: 5,
        };

        let signal_ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        store
            .insert_observation(&Observation {
                monitor_tag: "cron-job".to_string(),
                timestamp: signal_ts,
                status: Status::Up,
                latency: 0.0,
                origin: Origin::Signal,
            })
            .unwrap();
        store
            .insert_observation(&Observation {
                monitor_tag: "cron-job".to_string(),
                timestamp: signal_ts + chrono::Duration::minutes(3),
                status: Status::Down,
                latency: 0.0,
                origin: Origin::DefaultStatus,
            })
            .unwrap();

        match read_heartbeat(&store, "cron-job", &settings).unwrap() {
            RawResult::Heartbeat { last_signal, window_minutes } => {
                assert_eq!(last_signal, Some(signal_ts));
                assert_eq!(window_minutes, 5);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_read_heartbeat_without_signal() {
        let store = Store::open_in_memory().unwrap();
        let settings = HeartbeatSettings {
            secret: "x".to_string(),
            expect_within_minutes: 10,
        };
        assert!(matches!(
            read_heartbeat(&store, "silent", &settings).unwrap(),
            RawResult::Heartbeat { last_signal: None, .. }
        ));
    }
}
