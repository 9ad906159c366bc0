//! Classification of raw measurements into statuses.

mod rule;

pub use rule::*;

use chrono::Utc;

use crate::db::{MonitorDefinition, MonitorSpec, Status};
use crate::probe::{CheckError, RawResult};

/// A classified measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub status: Status,
    /// Milliseconds.
    pub latency: f64,
}

/// Turns raw results into evaluations, applying a monitor's `eval_rule`
/// when one is configured.
#[derive(Default)]
pub struct Evaluator {
    rules: RuleEngine,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a raw result. `None` means the monitor has no real-time
    /// status for this tick.
    pub fn classify(&self, monitor: &MonitorDefinition, raw: &RawResult) -> Option<Evaluation> {
        let Some(script) = monitor.eval_rule.as_deref() else {
            return classify_default(&monitor.spec, raw);
        };

        let latency = measured_latency(raw);
        match self.rules.evaluate(&monitor.tag, script, raw, latency) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::error!(monitor = %monitor.tag, "eval rule failed: {}", e);
                Some(Evaluation { status: Status::Down, latency })
            }
        }
    }

    /// A check that failed outright is DOWN with the time it took to fail.
    pub fn classify_error(&self, monitor: &MonitorDefinition, err: &CheckError, elapsed_ms: f64) -> Evaluation {
        tracing::warn!(monitor = %monitor.tag, "check failed: {}", err);
        Evaluation {
            status: Status::Down,
            latency: elapsed_ms,
        }
    }

    /// Drop any compiled rule held for `tag`.
    pub fn forget(&self, tag: &str) {
        self.rules.forget(tag);
    }
}

/// Latency carried by the raw result, before classification.
pub fn measured_latency(raw: &RawResult) -> f64 {
    match raw {
        RawResult::Http { response_time, .. }
        | RawResult::Dns { response_time, .. }
        | RawResult::Certificate { response_time, .. }
        | RawResult::Sql { response_time, .. } => *response_time,
        RawResult::Probes(probes) => mean(probes.iter().map(|p| p.latency)),
        RawResult::Heartbeat { .. } => 0.0,
        RawResult::Group { children } => mean(
            children
                .iter()
                .filter(|c| has_data(c.status))
                .map(|c| c.latency),
        ),
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn has_data(status: Option<Status>) -> bool {
    matches!(status, Some(s) if s != Status::NoData)
}

fn normalize_record(value: &str) -> String {
    value.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Built-in per-type policies.
pub fn classify_default(spec: &MonitorSpec, raw: &RawResult) -> Option<Evaluation> {
    let latency = measured_latency(raw);
    let up_if = |ok: bool| Evaluation {
        status: if ok { Status::Up } else { Status::Down },
        latency,
    };

    match raw {
        RawResult::Http { status_code, .. } => {
            Some(up_if(*status_code == 429 || (200..=399).contains(status_code)))
        }
        RawResult::Probes(probes) => Some(up_if(!probes.is_empty() && probes.iter().all(|p| p.alive()))),
        RawResult::Dns { records, .. } => {
            let expected: &[String] = match spec {
                MonitorSpec::Dns(s) => &s.expected,
                _ => &[],
            };
            let found: Vec<String> = records.iter().map(|r| normalize_record(r)).collect();
            let ok = !found.is_empty()
                && expected.iter().all(|e| found.contains(&normalize_record(e)));
            Some(up_if(ok))
        }
        RawResult::Certificate { valid, hours_remaining, .. } => {
            let (degraded_at, down_at) = match spec {
                MonitorSpec::Ssl(s) => (s.degraded_remaining_hours, s.down_remaining_hours),
                _ => (168, 24),
            };
            let status = if !valid || *hours_remaining <= down_at {
                Status::Down
            } else if *hours_remaining <= degraded_at {
                Status::Degraded
            } else {
                Status::Up
            };
            Some(Evaluation { status, latency })
        }
        RawResult::Sql { ok, .. } => Some(up_if(*ok)),
        RawResult::Heartbeat { last_signal, window_minutes } => {
            let last = (*last_signal)?;
            let age = Utc::now() - last;
            chrono::Duration::try_minutes(*window_minutes)
                .map_or(true, |window| age <= window)
                .then_some(Evaluation {
                    status: Status::Up,
                    latency: 0.0,
                })
        }
        RawResult::Group { children } => {
            let statuses: Vec<Status> = children
                .iter()
                .filter(|c| has_data(c.status))
                .filter_map(|c| c.status)
                .collect();
            if statuses.is_empty() {
                return None;
            }
            let status = if statuses.contains(&Status::Down) {
                Status::Down
            } else if statuses.contains(&Status::Degraded) {
                Status::Degraded
            } else {
                Status::Up
            };
            Some(Evaluation { status, latency })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DnsSettings, GroupSettings, SslSettings};
    use crate::probe::{ChildStatus, ProbeOutcome, ProbeState};

    fn monitor(json: &str) -> MonitorDefinition {
        serde_json::from_str(json).unwrap()
    }

    fn http(code: u16) -> RawResult {
        RawResult::Http {
            status_code: code,
            response_time: 80.0,
            body: String::new(),
        }
    }

    fn group(statuses: &[Option<Status>]) -> RawResult {
        RawResult::Group {
            children: statuses
                .iter()
                .enumerate()
                .map(|(i, s)| ChildStatus {
                    tag: format!("child-{}", i),
                    status: *s,
                    latency: 10.0 * (i + 1) as f64,
                })
                .collect(),
        }
    }

    fn group_spec() -> MonitorSpec {
        MonitorSpec::Group(GroupSettings { monitors: vec![], delay_ms: None, max_child_age_minutes: 10 })
    }

    #[test]
    fn test_api_status_codes() {
        let m = monitor(r#"{"tag": "api", "type": "API", "url": "http://x"}"#);
        let ev = Evaluator::new();
        assert_eq!(ev.classify(&m, &http(200)).unwrap().status, Status::Up);
        assert_eq!(ev.classify(&m, &http(399)).unwrap().status, Status::Up);
        assert_eq!(ev.classify(&m, &http(429)).unwrap().status, Status::Up);
        assert_eq!(ev.classify(&m, &http(404)).unwrap().status, Status::Down);
        assert_eq!(ev.classify(&m, &http(503)).unwrap().latency, 80.0);
    }

    #[test]
    fn test_probes_all_must_succeed() {
        let spec = MonitorSpec::Tcp(crate::db::TcpSettings {
            host: "h".into(),
            port: 1,
            count: 2,
            timeout_ms: None,
        });
        let open = ProbeOutcome { state: ProbeState::Open, latency: 10.0 };
        let lost = ProbeOutcome { state: ProbeState::Timeout, latency: 2000.0 };

        let up = classify_default(&spec, &RawResult::Probes(vec![open.clone(), open.clone()])).unwrap();
        assert_eq!(up.status, Status::Up);
        assert_eq!(up.latency, 10.0);

        let down = classify_default(&spec, &RawResult::Probes(vec![open, lost])).unwrap();
        assert_eq!(down.status, Status::Down);
        assert_eq!(classify_default(&spec, &RawResult::Probes(vec![])).unwrap().status, Status::Down);
    }

    #[test]
    fn test_group_precedence() {
        let spec = group_spec();
        let s = |v: &[Option<Status>]| classify_default(&spec, &group(v)).map(|e| e.status);

        assert_eq!(s(&[Some(Status::Up), Some(Status::Degraded), Some(Status::Up)]), Some(Status::Degraded));
        assert_eq!(s(&[Some(Status::Up), Some(Status::Down), Some(Status::Degraded)]), Some(Status::Down));
        assert_eq!(s(&[Some(Status::Up), None]), Some(Status::Up));
        assert_eq!(s(&[None, Some(Status::NoData)]), None);
    }

    #[test]
    fn test_group_latency_ignores_children_without_data() {
        let eval = classify_default(&group_spec(), &group(&[Some(Status::Up), None, Some(Status::Up)])).unwrap();
        // 10 and 30
        assert_eq!(eval.latency, 20.0);
    }

    #[test]
    fn test_dns_expected_values() {
        let spec = MonitorSpec::Dns(DnsSettings {
            name: "example.com".into(),
            record_type: "CNAME".into(),
            nameserver: None,
            expected: vec!["Edge.Example.NET.".into()],
            timeout_ms: None,
        });
        let raw = |records: &[&str]| RawResult::Dns {
            records: records.iter().map(|r| r.to_string()).collect(),
            response_time: 5.0,
            server: "1.1.1.1:53".into(),
            authoritative: true,
        };
        assert_eq!(classify_default(&spec, &raw(&["edge.example.net"])).unwrap().status, Status::Up);
        assert_eq!(classify_default(&spec, &raw(&["other.example.net"])).unwrap().status, Status::Down);
        assert_eq!(classify_default(&spec, &raw(&[])).unwrap().status, Status::Down);
    }

    #[test]
    fn test_ssl_thresholds() {
        let spec = MonitorSpec::Ssl(SslSettings {
            host: "h".into(),
            port: 443,
            degraded_remaining_hours: 168,
            down_remaining_hours: 24,
            timeout_ms: None,
        });
        let cert = |valid: bool, hours: i64| RawResult::Certificate {
            valid,
            hours_remaining: hours,
            response_time: 30.0,
        };
        let s = |raw| classify_default(&spec, &raw).unwrap().status;
        assert_eq!(s(cert(true, 1000)), Status::Up);
        assert_eq!(s(cert(true, 168)), Status::Degraded);
        assert_eq!(s(cert(true, 24)), Status::Down);
        assert_eq!(s(cert(false, 1000)), Status::Down);
    }

    #[test]
    fn test_heartbeat_window() {
        let spec = MonitorSpec::Heartbeat(crate::db::HeartbeatSettings {
            secret: "s".into(),
            expect_within_minutes: 5,
        });
        let recent = RawResult::Heartbeat {
            last_signal: Some(Utc::now() - chrono::Duration::minutes(2)),
            window_minutes: 5,
        };
        let stale = RawResult::Heartbeat {
            last_signal: Some(Utc::now() - chrono::Duration::minutes(30)),
            window_minutes: 5,
        };
        let never = RawResult::Heartbeat { last_signal: None, window_minutes: 5 };

        assert_eq!(
            classify_default(&spec, &recent),
            Some(Evaluation { status: Status::Up, latency: 0.0 })
        );
        assert!(classify_default(&spec, &stale).is_none());
        assert!(classify_default(&spec, &never).is_none());

        let unbounded = RawResult::Heartbeat {
            last_signal: Some(Utc::now() - chrono::Duration::days(400)),
            window_minutes: i64::MAX,
        };
        assert!(classify_default(&spec, &unbounded).is_some());
    }

    #[test]
    fn test_failing_rule_is_down_with_measured_latency() {
        let m = monitor(
            r#"{"tag": "api", "type": "API", "url": "http://x", "eval_rule": "throw \"boom\""}"#,
        );
        let eval = Evaluator::new().classify(&m, &http(200)).unwrap();
        assert_eq!(eval, Evaluation { status: Status::Down, latency: 80.0 });
    }

    #[test]
    fn test_rule_overrides_default() {
        let m = monitor(
            r#"{"tag": "api", "type": "API", "url": "http://x",
                "eval_rule": "if status_code == 404 { #{ status: \"UP\", latency: 1 } } else { #{ status: \"DOWN\" } }"}"#,
        );
        let eval = Evaluator::new().classify(&m, &http(404)).unwrap();
        assert_eq!(eval, Evaluation { status: Status::Up, latency: 1.0 });
    }

    #[test]
    fn test_check_error_is_down() {
        let m = monitor(r#"{"tag": "api", "type": "API", "url": "http://x"}"#);
        let err = CheckError::Timeout(std::time::Duration::from_secs(10));
        let eval = Evaluator::new().classify_error(&m, &err, 10_000.0);
        assert_eq!(eval.status, Status::Down);
        assert_eq!(eval.latency, 10_000.0);
    }
}
