//! Database model types.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alert::ChannelConfig;

/// Classification of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    Degraded,
    Maintenance,
    NoData,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "UP",
            Status::Down => "DOWN",
            Status::Degraded => "DEGRADED",
            Status::Maintenance => "MAINTENANCE",
            Status::NoData => "NO_DATA",
        }
    }

    /// Rank used when several manual overrides overlap: higher wins.
    pub fn override_rank(&self) -> u8 {
        match self {
            Status::Down => 3,
            Status::Degraded => 2,
            Status::Maintenance => 1,
            Status::Up | Status::NoData => 0,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(Status::Up),
            "DOWN" => Ok(Status::Down),
            "DEGRADED" => Ok(Status::Degraded),
            "MAINTENANCE" => Ok(Status::Maintenance),
            "NO_DATA" => Ok(Status::NoData),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Provenance of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    Realtime,
    Manual,
    DefaultStatus,
    Signal,
    Webhook,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Realtime => "REALTIME",
            Origin::Manual => "MANUAL",
            Origin::DefaultStatus => "DEFAULT_STATUS",
            Origin::Signal => "SIGNAL",
            Origin::Webhook => "WEBHOOK",
        }
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REALTIME" => Ok(Origin::Realtime),
            "MANUAL" => Ok(Origin::Manual),
            "DEFAULT_STATUS" => Ok(Origin::DefaultStatus),
            "SIGNAL" => Ok(Origin::Signal),
            "WEBHOOK" => Ok(Origin::Webhook),
            other => Err(format!("unknown origin: {}", other)),
        }
    }
}

/// A single minute-aligned status observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub monitor_tag: String,
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    /// Latency in milliseconds.
    pub latency: f64,
    pub origin: Origin,
}

/// Check type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorKind {
    Api,
    Ping,
    Tcp,
    Dns,
    Ssl,
    Sql,
    Heartbeat,
    Group,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Api => "API",
            MonitorKind::Ping => "PING",
            MonitorKind::Tcp => "TCP",
            MonitorKind::Dns => "DNS",
            MonitorKind::Ssl => "SSL",
            MonitorKind::Sql => "SQL",
            MonitorKind::Heartbeat => "HEARTBEAT",
            MonitorKind::Group => "GROUP",
        }
    }
}

impl FromStr for MonitorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "API" => Ok(MonitorKind::Api),
            "PING" => Ok(MonitorKind::Ping),
            "TCP" => Ok(MonitorKind::Tcp),
            "DNS" => Ok(MonitorKind::Dns),
            "SSL" => Ok(MonitorKind::Ssl),
            "SQL" => Ok(MonitorKind::Sql),
            "HEARTBEAT" => Ok(MonitorKind::Heartbeat),
            "GROUP" => Ok(MonitorKind::Group),
            other => Err(format!("unknown monitor type: {}", other)),
        }
    }
}

/// When a monitor fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// Every N minutes, aligned to the epoch minute.
    Every(u32),
    /// Cron expression with a leading seconds field, e.g. `0 */5 * * * *`.
    Cron(String),
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Every(1)
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_ping_count() -> u32 {
    3
}

fn default_tcp_count() -> u32 {
    1
}

fn default_ssl_port() -> u16 {
    443
}

fn default_degraded_hours() -> i64 {
    168
}

fn default_down_hours() -> i64 {
    24
}

fn default_sql_query() -> String {
    "SELECT 1".to_string()
}

fn default_child_age() -> i64 {
    10
}

fn default_heartbeat_window() -> i64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSettings {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSettings {
    pub host: String,
    #[serde(default = "default_ping_count")]
    pub count: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_tcp_count")]
    pub count: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSettings {
    pub name: String,
    pub record_type: String,
    /// Authoritative nameserver to query; discovered via NS lookup when absent.
    #[serde(default)]
    pub nameserver: Option<String>,
    #[serde(default)]
    pub expected: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SslSettings {
    pub host: String,
    #[serde(default = "default_ssl_port")]
    pub port: u16,
    #[serde(default = "default_degraded_hours")]
    pub degraded_remaining_hours: i64,
    #[serde(default = "default_down_hours")]
    pub down_remaining_hours: i64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlSettings {
    /// `sqlite://path`, `postgres://...` or `mysql://...`
    pub connection: String,
    #[serde(default = "default_sql_query")]
    pub query: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    pub secret: String,
    #[serde(default = "default_heartbeat_window")]
    pub expect_within_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub monitors: Vec<String>,
    /// Overrides the configured group execution delay.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// A child whose newest observation is older than this counts as
    /// having no data.
    #[serde(default = "default_child_age")]
    pub max_child_age_minutes: i64,
}

/// Type-specific monitor settings, tagged by monitor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum MonitorSpec {
    Api(ApiSettings),
    Ping(PingSettings),
    Tcp(TcpSettings),
    Dns(DnsSettings),
    Ssl(SslSettings),
    Sql(SqlSettings),
    Heartbeat(HeartbeatSettings),
    Group(GroupSettings),
}

impl MonitorSpec {
    pub fn kind(&self) -> MonitorKind {
        match self {
            MonitorSpec::Api(_) => MonitorKind::Api,
            MonitorSpec::Ping(_) => MonitorKind::Ping,
            MonitorSpec::Tcp(_) => MonitorKind::Tcp,
            MonitorSpec::Dns(_) => MonitorKind::Dns,
            MonitorSpec::Ssl(_) => MonitorKind::Ssl,
            MonitorSpec::Sql(_) => MonitorKind::Sql,
            MonitorSpec::Heartbeat(_) => MonitorKind::Heartbeat,
            MonitorSpec::Group(_) => MonitorKind::Group,
        }
    }

    /// Per-check timeout override in milliseconds, if the monitor sets one.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            MonitorSpec::Api(s) => s.timeout_ms,
            MonitorSpec::Ping(s) => s.timeout_ms,
            MonitorSpec::Tcp(s) => s.timeout_ms,
            MonitorSpec::Dns(s) => s.timeout_ms,
            MonitorSpec::Ssl(s) => s.timeout_ms,
            MonitorSpec::Sql(s) => s.timeout_ms,
            MonitorSpec::Heartbeat(_) | MonitorSpec::Group(_) => None,
        }
    }
}

/// Status class an alert rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertClass {
    Down,
    Degraded,
}

impl AlertClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertClass::Down => "DOWN",
            AlertClass::Degraded => "DEGRADED",
        }
    }

    /// Observation statuses that satisfy this class. DOWN also satisfies DEGRADED.
    pub fn matching_statuses(&self) -> &'static [Status] {
        match self {
            AlertClass::Down => &[Status::Down],
            AlertClass::Degraded => &[Status::Down, Status::Degraded],
        }
    }
}

impl FromStr for AlertClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DOWN" => Ok(AlertClass::Down),
            "DEGRADED" => Ok(AlertClass::Degraded),
            other => Err(format!("unknown alert class: {}", other)),
        }
    }
}

fn default_threshold() -> u32 {
    1
}

/// Threshold rule attached to a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub status_class: AlertClass,
    #[serde(default = "default_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_threshold")]
    pub success_threshold: u32,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub create_incident: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_numerator() -> String {
    "up + maintenance + degraded".to_string()
}

fn default_denominator() -> String {
    "up + down + degraded + maintenance".to_string()
}

/// Numerator and denominator expressions for the published uptime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeFormula {
    #[serde(default = "default_numerator")]
    pub numerator: String,
    #[serde(default = "default_denominator")]
    pub denominator: String,
}

impl Default for UptimeFormula {
    fn default() -> Self {
        Self {
            numerator: default_numerator(),
            denominator: default_denominator(),
        }
    }
}

fn default_active() -> bool {
    true
}

/// A monitor configuration. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorDefinition {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub spec: MonitorSpec,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub default_status: Option<Status>,
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
    #[serde(default)]
    pub uptime_formula: UptimeFormula,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Classification override script.
    #[serde(default)]
    pub eval_rule: Option<String>,
}

impl MonitorDefinition {
    pub fn kind(&self) -> MonitorKind {
        self.spec.kind()
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.tag
        } else {
            &self.name
        }
    }
}

/// Lifecycle state of an alert instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Triggered,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Triggered => "TRIGGERED",
            AlertState::Resolved => "RESOLVED",
        }
    }
}

impl FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRIGGERED" => Ok(AlertState::Triggered),
            "RESOLVED" => Ok(AlertState::Resolved),
            other => Err(format!("unknown alert state: {}", other)),
        }
    }
}

/// A persisted alert instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub id: i64,
    pub monitor_tag: String,
    pub status_class: AlertClass,
    pub state: AlertState,
    pub health_checks: u32,
    pub incident_ref: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Newest observation already counted into `health_checks`.
    #[serde(default)]
    pub last_observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverrideKind {
    Incident,
    Maintenance,
}

impl OverrideKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideKind::Incident => "INCIDENT",
            OverrideKind::Maintenance => "MAINTENANCE",
        }
    }
}

impl FromStr for OverrideKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INCIDENT" => Ok(OverrideKind::Incident),
            "MAINTENANCE" => Ok(OverrideKind::Maintenance),
            other => Err(format!("unknown override kind: {}", other)),
        }
    }
}

/// An incident or maintenance window imposing a status on a monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    #[serde(default)]
    pub id: i64,
    pub monitor_tag: String,
    pub kind: OverrideKind,
    pub status: Status,
    #[serde(default)]
    pub title: String,
    pub start: DateTime<Utc>,
    /// Open-ended when absent.
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl ManualOverride {
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && self.end.map_or(true, |end| ts < end)
    }
}

/// Status counts for one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationBucket {
    pub ts: DateTime<Utc>,
    pub count_of_up: u64,
    pub count_of_down: u64,
    pub count_of_degraded: u64,
    pub count_of_maintenance: u64,
    pub avg_latency: f64,
}

impl AggregationBucket {
    pub fn empty(ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            count_of_up: 0,
            count_of_down: 0,
            count_of_degraded: 0,
            count_of_maintenance: 0,
            avg_latency: 0.0,
        }
    }

    pub fn total(&self) -> u64 {
        self.count_of_up + self.count_of_down + self.count_of_degraded + self.count_of_maintenance
    }
}

/// Monitor query filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MonitorFilter {
    pub tag: Option<String>,
    pub kind: Option<MonitorKind>,
    pub active: Option<bool>,
}

impl MonitorFilter {
    pub fn active() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    pub fn matches(&self, monitor: &MonitorDefinition) -> bool {
        self.tag.as_ref().map_or(true, |t| *t == monitor.tag)
            && self.kind.map_or(true, |k| k == monitor.kind())
            && self.active.map_or(true, |a| a == monitor.active)
    }
}

/// Alert query filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub monitor_tag: Option<String>,
    pub status_class: Option<AlertClass>,
    pub state: Option<AlertState>,
}
