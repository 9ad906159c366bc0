//! Probe module: one checker per monitor type.
//!
//! Checkers only measure. They return unclassified [`RawResult`]s and never
//! write observations; classification happens in [`crate::eval`].

mod dns;
mod group;
mod heartbeat;
mod http;
mod ping;
mod sql;
mod ssl;
mod tcp;

pub use dns::*;
pub use group::*;
pub use heartbeat::*;
pub use http::*;
pub use ping::*;
pub use sql::*;
pub use ssl::*;
pub use tcp::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{MonitorDefinition, MonitorSpec, Persistence, Status};

/// Probe error types.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl CheckError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CheckError::Timeout(_))
    }
}

/// Outcome of a single socket-level probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeState {
    Open,
    Timeout,
    Error,
}

/// One ICMP echo or TCP connect attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub state: ProbeState,
    /// Milliseconds until reply, or until the attempt gave up.
    pub latency: f64,
}

impl ProbeOutcome {
    pub fn alive(&self) -> bool {
        self.state == ProbeState::Open
    }
}

/// A child's status as seen by a group check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildStatus {
    pub tag: String,
    pub status: Option<Status>,
    pub latency: f64,
}

/// Unclassified measurement data.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Http {
        status_code: u16,
        /// Milliseconds.
        response_time: f64,
        body: String,
    },
    Probes(Vec<ProbeOutcome>),
    Dns {
        records: Vec<String>,
        response_time: f64,
        server: String,
        authoritative: bool,
    },
    Certificate {
        valid: bool,
        hours_remaining: i64,
        response_time: f64,
    },
    Sql {
        ok: bool,
        rows: usize,
        response_time: f64,
        error: Option<String>,
    },
    Heartbeat {
        last_signal: Option<DateTime<Utc>>,
        window_minutes: i64,
    },
    Group {
        children: Vec<ChildStatus>,
    },
}

/// Shared resources for checkers, built once at startup.
#[derive(Clone)]
pub struct CheckContext {
    pub http: reqwest::Client,
    pub store: Arc<dyn Persistence>,
    /// Generic per-check timeout.
    pub check_timeout: Duration,
    /// Per-attempt timeout for raw socket probes.
    pub socket_timeout: Duration,
    /// Recursive resolver used for DNS discovery and fallback.
    pub resolver: String,
}

impl CheckContext {
    /// Effective timeout for one attempt of the given monitor's check.
    pub fn attempt_timeout(&self, spec: &MonitorSpec) -> Duration {
        if let Some(ms) = spec.timeout_ms() {
            return Duration::from_millis(ms);
        }
        match spec {
            MonitorSpec::Ping(_) | MonitorSpec::Tcp(_) => self.socket_timeout,
            _ => self.check_timeout,
        }
    }

    /// Upper bound on the whole check, covering every attempt.
    fn overall_timeout(&self, spec: &MonitorSpec) -> Duration {
        let attempt = self.attempt_timeout(spec);
        let attempts = match spec {
            MonitorSpec::Ping(s) => s.count.max(1),
            MonitorSpec::Tcp(s) => s.count.max(1),
            // Discovery, authoritative query and fallback.
            MonitorSpec::Dns(_) => 4,
            _ => 1,
        };
        attempt * attempts + Duration::from_secs(1)
    }
}

/// Run the check for a monitor at tick `ts`.
pub async fn run_check(
    monitor: &MonitorDefinition,
    ts: DateTime<Utc>,
    ctx: &CheckContext,
) -> Result<RawResult, CheckError> {
    let attempt = ctx.attempt_timeout(&monitor.spec);
    let overall = ctx.overall_timeout(&monitor.spec);

    let check = async {
        match &monitor.spec {
            MonitorSpec::Api(s) => run_http_check(&ctx.http, s, attempt).await,
            MonitorSpec::Ping(s) => run_ping_check(s, attempt).await,
            MonitorSpec::Tcp(s) => Ok(run_tcp_check(s, attempt).await),
            MonitorSpec::Dns(s) => run_dns_check(s, &ctx.resolver, attempt).await,
            MonitorSpec::Ssl(s) => run_ssl_check(s, attempt).await,
            MonitorSpec::Sql(s) => Ok(run_sql_check(s, attempt).await),
            MonitorSpec::Heartbeat(s) => read_heartbeat(ctx.store.as_ref(), &monitor.tag, s),
            MonitorSpec::Group(s) => read_group(ctx.store.as_ref(), s, ts),
        }
    };

    match tokio::time::timeout(overall, check).await {
        Ok(result) => result,
        Err(_) => Err(CheckError::Timeout(overall)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PingSettings, SqlSettings, Store};

    fn context() -> CheckContext {
        CheckContext {
            http: reqwest::Client::new(),
            store: Arc::new(Store::open_in_memory().unwrap()),
            check_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(2),
            resolver: "8.8.8.8:53".to_string(),
        }
    }

    #[test]
    fn test_attempt_timeout_by_type() {
        let ctx = context();
        let ping = MonitorSpec::Ping(PingSettings {
            host: "127.0.0.1".into(),
            count: 3,
            timeout_ms: None,
        });
        assert_eq!(ctx.attempt_timeout(&ping), Duration::from_secs(2));
        assert_eq!(ctx.overall_timeout(&ping), Duration::from_secs(7));

        let sql = MonitorSpec::Sql(SqlSettings {
            connection: "sqlite://:memory:".into(),
            query: "SELECT 1".into(),
            timeout_ms: Some(250),
        });
        assert_eq!(ctx.attempt_timeout(&sql), Duration::from_millis(250));
    }

    #[test]
    fn test_probe_outcome_alive() {
        let ok = ProbeOutcome { state: ProbeState::Open, latency: 1.0 };
        let lost = ProbeOutcome { state: ProbeState::Timeout, latency: 2000.0 };
        assert!(ok.alive());
        assert!(!lost.alive());
    }
}
