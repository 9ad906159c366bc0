//! Minute alignment and due-time computation for schedules.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use crate::db::Schedule;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression {0}: {1}")]
    Cron(String, String),
    #[error("interval must be at least one minute")]
    ZeroInterval,
    #[error("schedule has no upcoming fire time")]
    Exhausted,
}

/// Truncate a timestamp to the start of its window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds.max(1));
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

/// Floor to the start of the minute.
pub fn floor_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_window(dt, 60)
}

/// A parsed schedule, ready to compute fire times.
pub enum Timing {
    Every(i64),
    Cron(Box<cron::Schedule>),
}

impl Timing {
    pub fn parse(schedule: &Schedule) -> Result<Self, ScheduleError> {
        match schedule {
            Schedule::Every(0) => Err(ScheduleError::ZeroInterval),
            Schedule::Every(n) => Ok(Timing::Every(*n as i64)),
            Schedule::Cron(expr) => cron::Schedule::from_str(expr)
                .map(|s| Timing::Cron(Box::new(s)))
                .map_err(|e| ScheduleError::Cron(expr.clone(), e.to_string())),
        }
    }

    /// First minute strictly after `after` at which the schedule fires.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match self {
            Timing::Every(n) => {
                let mut minute = floor_minute(after).timestamp() / 60 + 1;
                let rem = minute.rem_euclid(*n);
                if rem != 0 {
                    minute += n - rem;
                }
                DateTime::from_timestamp(minute * 60, 0).ok_or(ScheduleError::Exhausted)
            }
            Timing::Cron(schedule) => {
                // Several cron fires inside one minute collapse into one tick
                let floor = floor_minute(after) + ChronoDuration::seconds(59);
                schedule
                    .after(&floor)
                    .next()
                    .map(floor_minute)
                    .ok_or(ScheduleError::Exhausted)
            }
        }
    }

    /// Whether the schedule fires during minute `ts`.
    pub fn is_due(&self, ts: DateTime<Utc>) -> bool {
        let minute = floor_minute(ts);
        self.next_after(minute - ChronoDuration::seconds(1))
            .map(|next| next == minute)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_truncate_to_window() {
        assert_eq!(truncate_to_window(at(10, 37, 45), 60), at(10, 37, 0));
        assert_eq!(truncate_to_window(at(10, 37, 45), 300), at(10, 35, 0));
        assert_eq!(truncate_to_window(at(10, 37, 45), 3600), at(10, 0, 0));
    }

    #[test]
    fn test_every_aligns_to_epoch_minutes() {
        let every5 = Timing::parse(&Schedule::Every(5)).unwrap();
        assert_eq!(every5.next_after(at(10, 37, 45)).unwrap(), at(10, 40, 0));
        assert_eq!(every5.next_after(at(10, 40, 0)).unwrap(), at(10, 45, 0));
        assert!(every5.is_due(at(10, 45, 30)));
        assert!(!every5.is_due(at(10, 46, 0)));

        let every1 = Timing::parse(&Schedule::Every(1)).unwrap();
        assert_eq!(every1.next_after(at(10, 37, 0)).unwrap(), at(10, 38, 0));
    }

    #[test]
    fn test_cron_schedule() {
        let quarter = Timing::parse(&Schedule::Cron("0 */15 * * * *".into())).unwrap();
        assert_eq!(quarter.next_after(at(10, 37, 45)).unwrap(), at(10, 45, 0));
        assert!(quarter.is_due(at(11, 0, 0)));
        assert!(!quarter.is_due(at(11, 1, 0)));

        // Every 10 seconds still means one tick per minute
        let busy = Timing::parse(&Schedule::Cron("*/10 * * * * *".into())).unwrap();
        assert_eq!(busy.next_after(at(10, 37, 5)).unwrap(), at(10, 38, 0));
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(matches!(Timing::parse(&Schedule::Every(0)), Err(ScheduleError::ZeroInterval)));
        assert!(matches!(
            Timing::parse(&Schedule::Cron("not cron".into())),
            Err(ScheduleError::Cron(_, _))
        ));
    }
}
