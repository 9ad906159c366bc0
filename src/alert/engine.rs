//! Alert state machine per `(monitor, status class)`.
//!
//! NONE -> TRIGGERED when the last `failure_threshold` non-manual observations
//! match the class; TRIGGERED -> RESOLVED when the last `success_threshold`
//! are UP. Every transition is persisted before notifications go out.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{format_duration, AlertEvent, AlertMessage, Dispatcher, IncidentTracker};
use crate::db::{
    ActiveAlert, AlertClass, AlertRule, AlertState, DbError, MonitorDefinition, Persistence, Status,
};

const INCIDENT_LABEL: &str = "incident";

/// What happened to one alert key during an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Triggered { class: AlertClass, id: i64 },
    Continued { class: AlertClass, health_checks: u32 },
    Resolved { class: AlertClass, id: i64 },
}

pub struct AlertEngine {
    store: Arc<dyn Persistence>,
    dispatcher: Arc<Dispatcher>,
    incidents: Option<Arc<dyn IncidentTracker>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn Persistence>,
        dispatcher: Arc<Dispatcher>,
        incidents: Option<Arc<dyn IncidentTracker>>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            incidents,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, tag: &str) -> Arc<Mutex<()>> {
        self.locks.entry(tag.to_string()).or_default().clone()
    }

    /// Evaluate every alert rule of a monitor against its latest observations.
    pub async fn evaluate(&self, tag: &str) -> Result<Vec<Transition>, DbError> {
        let lock = self.lock_for(tag);
        let _guard = lock.lock().await;

        let Some(monitor) = self.store.get_monitor(tag)? else {
            return Ok(Vec::new());
        };

        let mut transitions = Vec::new();
        for rule in &monitor.alerts {
            if let Some(t) = self.evaluate_rule(&monitor, rule).await? {
                transitions.push(t);
            }
        }
        Ok(transitions)
    }

    async fn evaluate_rule(
        &self,
        monitor: &MonitorDefinition,
        rule: &AlertRule,
    ) -> Result<Option<Transition>, DbError> {
        let tag = monitor.tag.as_str();
        let class = rule.status_class;

        let Some(alert) = self.store.get_active_alert(tag, class)? else {
            return self.maybe_trigger(monitor, rule).await;
        };

        let recovered = self
            .store
            .consecutive_status_holds(tag, &[Status::Up], rule.success_threshold.max(1))?;
        if recovered {
            return self.resolve(monitor, rule, alert).await.map(Some);
        }

        let Some(latest) = self.store.get_latest_counted_observation(tag)? else {
            return Ok(None);
        };
        if !class.matching_statuses().contains(&latest.status) {
            return Ok(None);
        }

        if rule.create_incident && alert.incident_ref.is_none() {
            self.open_incident(monitor, rule, &alert).await?;
        }

        // Several writes in one minute queue several evaluations; count each
        // observation once.
        match self.store.increment_health_checks(alert.id, latest.timestamp)? {
            Some(health_checks) => Ok(Some(Transition::Continued { class, health_checks })),
            None => Ok(None),
        }
    }

    async fn maybe_trigger(
        &self,
        monitor: &MonitorDefinition,
        rule: &AlertRule,
    ) -> Result<Option<Transition>, DbError> {
        let threshold = rule.failure_threshold.max(1);
        let class = rule.status_class;
        if !self
            .store
            .consecutive_status_holds(&monitor.tag, class.matching_statuses(), threshold)?
        {
            return Ok(None);
        }

        let last_observed_at = self
            .store
            .get_latest_counted_observation(&monitor.tag)?
            .map(|obs| obs.timestamp);
        let mut alert = ActiveAlert {
            id: 0,
            monitor_tag: monitor.tag.clone(),
            status_class: class,
            state: AlertState::Triggered,
            health_checks: threshold,
            incident_ref: None,
            triggered_at: Utc::now(),
            resolved_at: None,
            last_observed_at,
        };
        alert.id = match self.store.insert_alert(&alert) {
            Ok(id) => id,
            Err(DbError::Conflict(msg)) => {
                tracing::debug!(monitor = %monitor.tag, "{}", msg);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(monitor = %monitor.tag, class = class.as_str(), "alert triggered");
        self.dispatcher
            .spawn(rule.channels.clone(), message(AlertEvent::Triggered, monitor, rule, &alert));

        if rule.create_incident {
            self.open_incident(monitor, rule, &alert).await?;
        }
        Ok(Some(Transition::Triggered { class, id: alert.id }))
    }

    async fn resolve(
        &self,
        monitor: &MonitorDefinition,
        rule: &AlertRule,
        mut alert: ActiveAlert,
    ) -> Result<Transition, DbError> {
        let now = Utc::now();
        self.store.update_alert_state(alert.id, AlertState::Resolved, now)?;
        alert.state = AlertState::Resolved;
        alert.resolved_at = Some(now);

        tracing::info!(monitor = %monitor.tag, class = alert.status_class.as_str(), "alert resolved");
        self.dispatcher
            .spawn(rule.channels.clone(), message(AlertEvent::Resolved, monitor, rule, &alert));

        if let (Some(tracker), Some(issue)) = (&self.incidents, &alert.incident_ref) {
            let downtime = format_duration(now - alert.triggered_at);
            let comment = format!("Resolved after {} of downtime.", downtime);
            let labels = vec![INCIDENT_LABEL.to_string(), "resolved".to_string()];

            // Best effort: the alert is already resolved
            if let Err(e) = tracker.add_comment(issue, &comment).await {
                tracing::warn!(monitor = %monitor.tag, issue = %issue, "failed to comment on incident: {}", e);
            }
            if let Err(e) = tracker.update_labels(issue, &labels).await {
                tracing::warn!(monitor = %monitor.tag, issue = %issue, "failed to relabel incident: {}", e);
            }
            if let Err(e) = tracker.close_issue(issue).await {
                tracing::warn!(monitor = %monitor.tag, issue = %issue, "failed to close incident: {}", e);
            }
        }

        Ok(Transition::Resolved { class: alert.status_class, id: alert.id })
    }

    /// Open an incident for a triggered alert. Failures are logged and retried
    /// on a later tick.
    async fn open_incident(
        &self,
        monitor: &MonitorDefinition,
        rule: &AlertRule,
        alert: &ActiveAlert,
    ) -> Result<(), DbError> {
        let Some(tracker) = &self.incidents else {
            return Ok(());
        };

        let title = format!("{} is {}", monitor.display_name(), alert.status_class.as_str());
        let mut body = format!(
            "Monitor `{}` reported {} for {} consecutive checks since {}.",
            monitor.tag,
            alert.status_class.as_str(),
            alert.health_checks,
            alert.triggered_at.to_rfc3339()
        );
        if let Some(desc) = &rule.description {
            body.push_str("\n\n");
            body.push_str(desc);
        }
        let labels = vec![
            INCIDENT_LABEL.to_string(),
            format!("status:{}", alert.status_class.as_str().to_ascii_lowercase()),
        ];

        match tracker.create_issue(&title, &body, &labels).await {
            Ok(issue) => {
                self.store.set_alert_incident(alert.id, &issue)?;
                tracing::info!(monitor = %monitor.tag, issue = %issue, "incident opened");
            }
            Err(e) => {
                tracing::warn!(monitor = %monitor.tag, "failed to open incident, will retry: {}", e);
            }
        }
        Ok(())
    }
}

fn message(event: AlertEvent, monitor: &MonitorDefinition, rule: &AlertRule, alert: &ActiveAlert) -> AlertMessage {
    AlertMessage {
        event,
        monitor_tag: monitor.tag.clone(),
        monitor_name: monitor.display_name().to_string(),
        status_class: alert.status_class,
        description: rule.description.clone(),
        health_checks: alert.health_checks,
        triggered_at: alert.triggered_at,
        resolved_at: alert.resolved_at,
        incident_ref: alert.incident_ref.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::incident::tests::RecordingTracker;
    use crate::alert::notify::tests::RecordingSender;
    use crate::db::{AlertFilter, Observation, Origin, Store};
    use chrono::{DateTime, TimeZone};
    use std::time::Duration;

    struct Harness {
        store: Arc<Store>,
        sender: Arc<RecordingSender>,
        tracker: Arc<RecordingTracker>,
        engine: AlertEngine,
        minute: u32,
    }

    impl Harness {
        fn new(rules: &str) -> Self {
            let store = Arc::new(Store::open_in_memory().unwrap());
            let monitor: MonitorDefinition = serde_json::from_str(&format!(
                r#"{{"tag": "api", "name": "API", "type": "API", "url": "http://x", "alerts": {}}}"#,
                rules
            ))
            .unwrap();
            store.upsert_monitor(&monitor).unwrap();

            let sender = Arc::new(RecordingSender::default());
            let tracker = Arc::new(RecordingTracker::default());
            let engine = AlertEngine::new(
                store.clone(),
                Arc::new(Dispatcher::new(sender.clone())),
                Some(tracker.clone() as Arc<dyn IncidentTracker>),
            );
            Self { store, sender, tracker, engine, minute: 0 }
        }

        fn observe(&mut self, status: Status, origin: Origin) {
            let ts: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::minutes(self.minute as i64);
            self.minute += 1;
            self.store
                .insert_observation(&Observation {
                    monitor_tag: "api".into(),
                    timestamp: ts,
                    status,
                    latency: 10.0,
                    origin,
                })
                .unwrap();
        }

        async fn tick(&mut self, status: Status) -> Vec<Transition> {
            self.observe(status, Origin::Realtime);
            self.engine.evaluate("api").await.unwrap()
        }

        fn triggered(&self) -> Vec<ActiveAlert> {
            self.store
                .get_alerts(&AlertFilter {
                    state: Some(AlertState::Triggered),
                    ..Default::default()
                })
                .unwrap()
        }

        async fn wait_for_deliveries(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(2), async {
                while self.sender.count() < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("notifications were not delivered");
        }
    }

    #[tokio::test]
    async fn test_failure_threshold_triggers_once() {
        let mut h = Harness::new(r#"[{"status_class": "DOWN", "failure_threshold": 3, "channels": [{"kind": "log"}]}]"#);

        assert!(h.tick(Status::Down).await.is_empty());
        assert!(h.tick(Status::Down).await.is_empty());
        let t = h.tick(Status::Down).await;
        assert!(matches!(t[0], Transition::Triggered { class: AlertClass::Down, .. }));

        let alerts = h.triggered();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].health_checks, 3);

        let t = h.tick(Status::Down).await;
        assert_eq!(t, vec![Transition::Continued { class: AlertClass::Down, health_checks: 4 }]);
        assert_eq!(h.triggered().len(), 1);
        assert_eq!(h.triggered()[0].health_checks, 4);

        h.wait_for_deliveries(1).await;
    }

    #[tokio::test]
    async fn test_repeated_evaluation_counts_each_observation_once() {
        let mut h = Harness::new(r#"[{"status_class": "DOWN", "failure_threshold": 3}]"#);
        for _ in 0..3 {
            h.tick(Status::Down).await;
        }
        assert_eq!(h.triggered()[0].health_checks, 3);

        // Extra evaluations queued by webhook or heartbeat writes
        assert!(h.engine.evaluate("api").await.unwrap().is_empty());
        assert!(h.engine.evaluate("api").await.unwrap().is_empty());
        assert_eq!(h.triggered()[0].health_checks, 3);

        let t = h.tick(Status::Down).await;
        assert_eq!(t, vec![Transition::Continued { class: AlertClass::Down, health_checks: 4 }]);
        assert!(h.engine.evaluate("api").await.unwrap().is_empty());

        // A manual row is not a new check
        h.observe(Status::Down, Origin::Manual);
        assert!(h.engine.evaluate("api").await.unwrap().is_empty());
        assert_eq!(h.triggered()[0].health_checks, 4);
    }

    #[tokio::test]
    async fn test_manual_observations_do_not_count() {
        let mut h = Harness::new(r#"[{"status_class": "DOWN", "failure_threshold": 2}]"#);
        h.tick(Status::Down).await;
        h.observe(Status::Down, Origin::Manual);
        assert!(h.engine.evaluate("api").await.unwrap().is_empty());
        assert!(h.triggered().is_empty());
        assert_eq!(h.tick(Status::Down).await.len(), 1);
    }

    #[tokio::test]
    async fn test_down_satisfies_degraded_class() {
        let mut h = Harness::new(r#"[{"status_class": "DEGRADED", "failure_threshold": 2}]"#);
        h.tick(Status::Degraded).await;
        let t = h.tick(Status::Down).await;
        assert!(matches!(t[0], Transition::Triggered { class: AlertClass::Degraded, .. }));
    }

    #[tokio::test]
    async fn test_resolution_notifies_and_closes_incident() {
        let mut h = Harness::new(
            r#"[{"status_class": "DOWN", "failure_threshold": 1, "success_threshold": 2,
                 "create_incident": true,
                 "channels": [{"kind": "slack", "url": "http://s"}, {"kind": "discord", "url": "http://d"}]}]"#,
        );

        h.tick(Status::Down).await;
        let alert = h.triggered().remove(0);
        assert_eq!(alert.incident_ref.as_deref(), Some("1"));
        h.wait_for_deliveries(2).await;

        // One UP is not enough
        assert!(h.tick(Status::Up).await.is_empty());
        let t = h.tick(Status::Up).await;
        assert_eq!(t, vec![Transition::Resolved { class: AlertClass::Down, id: alert.id }]);
        assert!(h.triggered().is_empty());

        h.wait_for_deliveries(4).await;
        let resolved: Vec<_> = h
            .sender
            .delivered
            .lock()
            .unwrap()
            .iter()
            .skip(2)
            .map(|(channel, _)| channel.clone())
            .collect();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains(&"slack".to_string()));

        let comments = h.tracker.comments.lock().unwrap().clone();
        assert_eq!(comments.len(), 1);
        assert!(comments[0].1.starts_with("Resolved after "));
        assert_eq!(h.tracker.closed.lock().unwrap().as_slice(), ["1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_incident_is_retried() {
        let mut h = Harness::new(r#"[{"status_class": "DOWN", "create_incident": true}]"#);
        *h.tracker.fail_create.lock().unwrap() = true;

        h.tick(Status::Down).await;
        assert!(h.triggered()[0].incident_ref.is_none());

        *h.tracker.fail_create.lock().unwrap() = false;
        h.tick(Status::Down).await;
        assert_eq!(h.triggered()[0].incident_ref.as_deref(), Some("1"));
    }
}
