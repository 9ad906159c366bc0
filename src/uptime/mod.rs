//! Windowed uptime and latency aggregation.

mod formula;

pub use formula::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::{AggregationBucket, DbError, Persistence, UptimeFormula};

/// Upper bound on buckets per query.
pub const MAX_BUCKETS: usize = 10_000;
/// Upper bound on a single bucket width (one leap year).
pub const MAX_INTERVAL_SECONDS: i64 = 366 * 86_400;

/// Rendered in place of a percentage when there is nothing to divide by.
pub const NO_DATA: &str = "-";

#[derive(Error, Debug)]
pub enum UptimeError {
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    #[error("invalid formula: {0}")]
    Formula(#[from] FormulaError),
    #[error("invalid query: {0}")]
    Invalid(String),
}

/// Uptime over a window, plus the buckets it was computed from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeSummary {
    pub tags: Vec<String>,
    pub start: DateTime<Utc>,
    pub interval_seconds: i64,
    pub uptime: String,
    pub avg_latency: Option<f64>,
    pub buckets: Vec<AggregationBucket>,
}

/// Sum the counts of all buckets and average latency over buckets with data.
pub fn summarize_buckets(buckets: &[AggregationBucket]) -> (Counts, Option<f64>) {
    let mut counts = Counts::default();
    let mut latency_sum = 0.0;
    let mut with_data = 0usize;

    for b in buckets {
        counts.up += b.count_of_up as f64;
        counts.down += b.count_of_down as f64;
        counts.degraded += b.count_of_degraded as f64;
        counts.maintenance += b.count_of_maintenance as f64;
        if b.total() > 0 {
            latency_sum += b.avg_latency;
            with_data += 1;
        }
    }

    let avg = (with_data > 0).then(|| latency_sum / with_data as f64);
    (counts, avg)
}

/// Uptime percentage, or `None` when either side divides by zero.
pub fn compute_uptime(formula: &UptimeFormula, counts: &Counts) -> Result<Option<f64>, FormulaError> {
    let numerator = evaluate(&formula.numerator, counts)?;
    let denominator = evaluate(&formula.denominator, counts)?;

    Ok(match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d * 100.0),
        _ => None,
    })
}

/// `0`, `100` and multiples of ten print as integers; anything else with up
/// to four decimals, trailing zeros trimmed.
pub fn format_percentage(value: Option<f64>) -> String {
    let Some(v) = value else {
        return NO_DATA.to_string();
    };
    let fixed = format!("{:.4}", v);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Reject bucket widths and counts outside `1..=MAX_INTERVAL_SECONDS` and
/// `1..=MAX_BUCKETS`.
pub fn check_window(interval_seconds: i64, count: usize) -> Result<(), UptimeError> {
    if !(1..=MAX_INTERVAL_SECONDS).contains(&interval_seconds) {
        return Err(UptimeError::Invalid(format!(
            "interval must be between 1 and {} seconds",
            MAX_INTERVAL_SECONDS
        )));
    }
    if !(1..=MAX_BUCKETS).contains(&count) {
        return Err(UptimeError::Invalid(format!("count must be between 1 and {}", MAX_BUCKETS)));
    }
    Ok(())
}

/// Read-path aggregator over the persistence port.
pub struct UptimeAggregator {
    store: Arc<dyn Persistence>,
}

impl UptimeAggregator {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Summarize `count` intervals from `start`. With a single tag the
    /// monitor's own formula applies; otherwise the default one.
    pub fn summarize(
        &self,
        tags: &[String],
        start: DateTime<Utc>,
        interval_seconds: i64,
        count: usize,
    ) -> Result<UptimeSummary, UptimeError> {
        if tags.is_empty() {
            return Err(UptimeError::Invalid("at least one tag is required".to_string()));
        }
        check_window(interval_seconds, count)?;

        let formula = match tags {
            [tag] => self
                .store
                .get_monitor(tag)?
                .map(|m| m.uptime_formula)
                .unwrap_or_default(),
            _ => UptimeFormula::default(),
        };

        let buckets = self
            .store
            .get_status_counts_by_interval(tags, start, interval_seconds, count)?;
        let (counts, avg_latency) = summarize_buckets(&buckets);
        let uptime = compute_uptime(&formula, &counts)?;

        Ok(UptimeSummary {
            tags: tags.to_vec(),
            start,
            interval_seconds,
            uptime: format_percentage(uptime),
            avg_latency,
            buckets,
        })
    }
}
