//! Configuration module for uptrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::db::MonitorKind;

/// GitHub repository used to track incidents.
#[derive(Debug, Clone, PartialEq)]
pub struct GithubConfig {
    pub api_base: String,
    /// `owner/name`
    pub repo: String,
    pub token: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "uptrail.db")
    pub db_path: String,
    /// JSON file of monitor definitions upserted at startup
    pub monitors_file: Option<String>,
    /// Timeout for a whole check (default: 10s)
    pub check_timeout: Duration,
    /// Timeout per raw socket probe (default: 2s)
    pub socket_timeout: Duration,
    /// Recursive resolver for DNS checks (default: 8.8.8.8:53)
    pub resolver: String,
    /// Monitor types whose timed-out checks are retried once (default: API)
    pub retry_types: Vec<MonitorKind>,
    pub retry_backoff: Duration,
    pub retry_workers: usize,
    pub retry_timeout: Duration,
    pub alert_workers: usize,
    pub alert_timeout: Duration,
    /// Delay between an observation write and its alert evaluation
    pub alert_delay: Duration,
    pub serial_timeout: Duration,
    pub queue_capacity: usize,
    /// Default wait before a GROUP monitor derives its status
    pub group_delay: Duration,
    /// How often the scheduler re-reads the monitor set
    pub refresh_interval: Duration,
    /// Observations older than this are deleted (default: 90 days)
    pub retention_days: i64,
    pub github: Option<GithubConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "uptrail.db".to_string(),
            monitors_file: None,
            check_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(2),
            resolver: "8.8.8.8:53".to_string(),
            retry_types: vec![MonitorKind::Api],
            retry_backoff: Duration::from_millis(500),
            retry_workers: 10,
            retry_timeout: Duration::from_secs(120),
            alert_workers: 10,
            alert_timeout: Duration::from_secs(10),
            alert_delay: Duration::from_secs(1),
            serial_timeout: Duration::from_secs(120),
            queue_capacity: 1000,
            group_delay: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(60),
            retention_days: 90,
            github: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `UPTRAIL_*` environment variables.
    pub fn load() -> Self {
        Self::load_from(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Unparseable values
    /// are logged and ignored.
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let parsed = |key: &str| -> Option<u64> { parse_var(&lookup, key) };
        let millis = |key: &str| parsed(key).map(Duration::from_millis);
        let secs = |key: &str| parsed(key).map(Duration::from_secs);

        if let Some(port) = parse_var(&lookup, "UPTRAIL_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(path) = lookup("UPTRAIL_DB_PATH") {
            cfg.db_path = path;
        }
        cfg.monitors_file = lookup("UPTRAIL_MONITORS_FILE").filter(|p| !p.is_empty());

        if let Some(d) = millis("UPTRAIL_CHECK_TIMEOUT_MS") {
            cfg.check_timeout = d;
        }
        if let Some(d) = millis("UPTRAIL_SOCKET_TIMEOUT_MS") {
            cfg.socket_timeout = d;
        }
        if let Some(resolver) = lookup("UPTRAIL_RESOLVER") {
            cfg.resolver = resolver;
        }

        if let Some(types) = lookup("UPTRAIL_RETRY_TYPES") {
            cfg.retry_types = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .filter_map(|t| match MonitorKind::from_str(t) {
                    Ok(kind) => Some(kind),
                    Err(e) => {
                        tracing::warn!("ignoring UPTRAIL_RETRY_TYPES entry: {}", e);
                        None
                    }
                })
                .collect();
        }
        if let Some(d) = millis("UPTRAIL_RETRY_BACKOFF_MS") {
            cfg.retry_backoff = d;
        }
        if let Some(n) = parse_var(&lookup, "UPTRAIL_RETRY_WORKERS") {
            cfg.retry_workers = n;
        }
        if let Some(n) = parse_var(&lookup, "UPTRAIL_ALERT_WORKERS") {
            cfg.alert_workers = n;
        }
        if let Some(d) = millis("UPTRAIL_ALERT_DELAY_MS") {
            cfg.alert_delay = d;
        }
        if let Some(n) = parse_var(&lookup, "UPTRAIL_QUEUE_CAPACITY") {
            cfg.queue_capacity = n;
        }
        if let Some(d) = millis("UPTRAIL_GROUP_DELAY_MS") {
            cfg.group_delay = d;
        }
        if let Some(d) = secs("UPTRAIL_REFRESH_SECS") {
            cfg.refresh_interval = d;
        }
        if let Some(days) = parse_var(&lookup, "UPTRAIL_RETENTION_DAYS") {
            cfg.retention_days = days;
        }

        if let (Some(repo), Some(token)) = (lookup("UPTRAIL_GITHUB_REPO"), lookup("UPTRAIL_GITHUB_TOKEN")) {
            cfg.github = Some(GithubConfig {
                api_base: lookup("UPTRAIL_GITHUB_API").unwrap_or_else(|| "https://api.github.com".to_string()),
                repo,
                token,
            });
        }

        cfg
    }

    pub fn retries(&self, kind: MonitorKind) -> bool {
        self.retry_types.contains(&kind)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::load_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "uptrail.db");
        assert_eq!(cfg.retention_days, 90);
        assert!(cfg.retries(MonitorKind::Api));
        assert!(!cfg.retries(MonitorKind::Tcp));
    }

    #[test]
    fn test_env_overrides() {
        let cfg = load(&[
            ("UPTRAIL_HTTP_PORT", "9090"),
            ("UPTRAIL_RETRY_TYPES", "api, tcp,bogus"),
            ("UPTRAIL_GROUP_DELAY_MS", "2500"),
            ("UPTRAIL_RETENTION_DAYS", "30"),
            ("UPTRAIL_MONITORS_FILE", "monitors.json"),
        ]);
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.retry_types, vec![MonitorKind::Api, MonitorKind::Tcp]);
        assert_eq!(cfg.group_delay, Duration::from_millis(2500));
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.monitors_file.as_deref(), Some("monitors.json"));
        assert!(cfg.github.is_none());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let cfg = load(&[("UPTRAIL_HTTP_PORT", "not-a-port"), ("UPTRAIL_RETRY_BACKOFF_MS", "-1")]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.retry_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_github_requires_repo_and_token() {
        assert!(load(&[("UPTRAIL_GITHUB_REPO", "acme/status")]).github.is_none());

        let cfg = load(&[("UPTRAIL_GITHUB_REPO", "acme/status"), ("UPTRAIL_GITHUB_TOKEN", "t")]);
        assert_eq!(
            cfg.github,
            Some(GithubConfig {
                api_base: "https://api.github.com".to_string(),
                repo: "acme/status".to_string(),
                token: "t".to_string(),
            })
        );
    }
}
