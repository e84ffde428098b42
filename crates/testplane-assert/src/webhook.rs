//! Out-of-process expectation evaluation
//!
//! An expectation with a webhook URL is evaluated by POSTing
//! `{"function": ..., "params": ...}` and reading `{passed, actual, message}`
//! back. Calls are bounded by a per-call timeout and never retried within one
//! evaluation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use testplane_common::Error;

use crate::registry::FunctionResult;

/// Per-call timeout when none is configured
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Request body sent to a webhook
#[derive(Debug, Serialize)]
pub struct WebhookRequest<'a> {
    /// Function name, used by the webhook as a selector
    pub function: &'a str,
    /// Decoded parameters (`{}` when empty)
    pub params: &'a Value,
}

/// Response body expected from a webhook
#[derive(Debug, Deserialize)]
pub struct WebhookResponse {
    /// Whether the assertion held
    pub passed: bool,
    /// Observed value
    #[serde(default)]
    pub actual: Option<String>,
    /// Explanation
    #[serde(default)]
    pub message: Option<String>,
}

/// Client used to evaluate webhook expectations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    /// Evaluate `function` at `url`. Transport and protocol errors are
    /// reported as failing results, never as errors.
    async fn evaluate(&self, url: &str, function: &str, params: &Value) -> FunctionResult;
}

/// reqwest-backed webhook client
#[derive(Clone)]
pub struct HttpWebhookClient {
    http: reqwest::Client,
}

impl HttpWebhookClient {
    /// Build a client with the given per-call timeout
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context(
                    "webhook",
                    format!("failed to create HTTP client: {e}"),
                )
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn evaluate(&self, url: &str, function: &str, params: &Value) -> FunctionResult {
        let body = WebhookRequest { function, params };
        let response = match self.http.post(url).json(&body).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return FunctionResult::fail(format!("webhook {url} timed out: {e}"));
            }
            Err(e) => return FunctionResult::fail(format!("webhook {url} request failed: {e}")),
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let text = response.text().await.unwrap_or_default();
            debug!(url, function, status = %status, "webhook returned non-OK status");
            return FunctionResult::fail(format!("webhook returned {status}: {text}"));
        }

        match response.json::<WebhookResponse>().await {
            Ok(r) => FunctionResult {
                passed: r.passed,
                actual: r.actual,
                message: r.message,
                value: None,
            },
            Err(e) => FunctionResult::fail(format!("invalid webhook response: {e}")),
        }
    }
}
