//! TCP connect probe.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::{ProbeOutcome, ProbeState, RawResult};
use crate::db::TcpSettings;

/// Attempt `count` TCP connections to `host:port`.
///
/// Every attempt yields an outcome (`open`, `timeout` or `error`); the check
/// itself never fails.
pub async fn run_tcp_check(settings: &TcpSettings, timeout: Duration) -> RawResult {
    let count = settings.count.max(1);
    let mut outcomes = Vec::with_capacity(count as usize);

    for _ in 0..count {
        outcomes.push(connect_once(&settings.host, settings.port, timeout).await);
    }

    RawResult::Probes(outcomes)
}

async fn connect_once(host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, TcpStream::connect((host, port))).await;
    let latency = start.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(Ok(_stream)) => ProbeOutcome { state: ProbeState::Open, latency },
        Ok(Err(e)) => {
            tracing::debug!(host, port, "tcp connect failed: {}", e);
            ProbeOutcome { state: ProbeState::Error, latency }
        }
        Err(_) => ProbeOutcome {
            state: ProbeState::Timeout,
            latency: timeout.as_secs_f64() * 1000.0,
        },
    }
}
