//! Incident tracker collaborator and its GitHub issues implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IncidentError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// An external issue tracker that mirrors alert lifecycles.
#[async_trait]
pub trait IncidentTracker: Send + Sync {
    /// Open an issue and return its reference.
    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<String, IncidentError>;

    async fn update_labels(&self, issue_ref: &str, labels: &[String]) -> Result<(), IncidentError>;

    async fn add_comment(&self, issue_ref: &str, body: &str) -> Result<(), IncidentError>;

    async fn close_issue(&self, issue_ref: &str) -> Result<(), IncidentError>;
}

/// Issues in a GitHub repository. References are issue numbers.
pub struct GithubTracker {
    client: reqwest::Client,
    api_base: String,
    repo: String,
    token: String,
}

#[derive(Deserialize)]
struct CreatedIssue {
    number: u64,
}

impl GithubTracker {
    pub fn new(client: reqwest::Client, api_base: &str, repo: &str, token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/repos/{}/issues{}", self.api_base, self.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "uptrail")
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, IncidentError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(IncidentError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl IncidentTracker for GithubTracker {
    async fn create_issue(&self, title: &str, body: &str, labels: &[String]) -> Result<String, IncidentError> {
        let request = self
            .request(reqwest::Method::POST, self.url(""))
            .json(&json!({ "title": title, "body": body, "labels": labels }));
        let issue: CreatedIssue = self.send(request).await?.json().await?;
        Ok(issue.number.to_string())
    }

    async fn update_labels(&self, issue_ref: &str, labels: &[String]) -> Result<(), IncidentError> {
        let request = self
            .request(reqwest::Method::PUT, self.url(&format!("/{}/labels", issue_ref)))
            .json(&json!({ "labels": labels }));
        self.send(request).await?;
        Ok(())
    }

    async fn add_comment(&self, issue_ref: &str, body: &str) -> Result<(), IncidentError> {
        let request = self
            .request(reqwest::Method::POST, self.url(&format!("/{}/comments", issue_ref)))
            .json(&json!({ "body": body }));
        self.send(request).await?;
        Ok(())
    }

    async fn close_issue(&self, issue_ref: &str) -> Result<(), IncidentError> {
        let request = self
            .request(reqwest::Method::PATCH, self.url(&format!("/{}", issue_ref)))
            .json(&json!({ "state": "closed" }));
        self.send(request).await?;
        Ok(())
    }
}

/// Render a duration as `1d 2h 3m`, `5m 10s` or `42s`. Negative spans are zero.
pub fn format_duration(span: chrono::Duration) -> String {
    let total = span.num_seconds().max(0);
    let (days, hours, minutes, seconds) = (total / 86_400, total % 86_400 / 3600, total % 3600 / 60, total % 60);

    let parts: Vec<String> = [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")]
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| format!("{}{}", n, unit))
        .collect();

    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.join(" ")
    }
}
