//! HTTP probe implementation.

use std::str::FromStr;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;

use super::{CheckError, RawResult};
use crate::db::ApiSettings;

/// Run an HTTP check against the monitor's URL.
///
/// Any response, whatever its status code, is a measurement. Only transport
/// failures are errors; a timeout surfaces as [`CheckError::Timeout`] so the
/// caller can decide whether to retry.
pub async fn run_http_check(
    client: &reqwest::Client,
    settings: &ApiSettings,
    timeout: Duration,
) -> Result<RawResult, CheckError> {
    let url = if settings.url.starts_with("http://") || settings.url.starts_with("https://") {
        settings.url.clone()
    } else {
        format!("http://{}", settings.url)
    };

    let method = Method::from_str(&settings.method.to_ascii_uppercase())
        .map_err(|e| CheckError::Config(format!("invalid method {}: {}", settings.method, e)))?;

    let mut request = client.request(method, &url).timeout(timeout);
    for (key, value) in &settings.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| CheckError::Config(format!("invalid header {}: {}", key, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| CheckError::Config(format!("invalid header value for {}: {}", key, e)))?;
        request = request.header(name, value);
    }
    if let Some(body) = &settings.body {
        request = request.body(body.clone());
    }

    let start = Instant::now();

    let response = request.send().await.map_err(|e| map_reqwest_error(e, timeout))?;
    let status_code = response.status().as_u16();

    // Read the full body so the response time covers the complete transfer
    let body = response
        .text()
        .await
        .map_err(|e| map_reqwest_error(e, timeout))?;

    Ok(RawResult::Http {
        status_code,
        response_time: start.elapsed().as_secs_f64() * 1000.0,
        body,
    })
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> CheckError {
    if e.is_timeout() {
        CheckError::Timeout(timeout)
    } else {
        CheckError::Network(e.to_string())
    }
}
