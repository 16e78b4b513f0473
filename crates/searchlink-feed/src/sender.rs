//! Posts composed feeds to the appliance.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::composer::FeedType;
use crate::error::FeedError;

/// Wall-clock budget for a single feed POST.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

enum AttemptFailure {
    Transient(String),
    Permanent(String),
}

/// Delivers one feed per call to `http(s)://<appliance>/xmlfeed`.
///
/// Holds no per-push state; concurrent sends each own their retry budget.
#[derive(Clone)]
pub struct FeedSender {
    client: reqwest::Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl FeedSender {
    /// Sender for the configured appliance host.
    pub fn new(appliance_host: &str, secure: bool) -> Result<Self, FeedError> {
        let scheme = if secure { "https" } else { "http" };
        Self::with_endpoint(format!("{scheme}://{appliance_host}/xmlfeed"))
    }

    /// Sender for an explicit endpoint URL.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(FeedError::Client)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Posts one feed, retrying transient failures with exponential
    /// backoff until the budget runs out.
    ///
    /// # Errors
    ///
    /// [`FeedError::Permanent`] on 4xx or an unexpected response body,
    /// [`FeedError::Transient`] once the retry budget is exhausted, and
    /// [`FeedError::Interrupted`] when shutdown is signalled mid-push.
    pub async fn send(
        &self,
        datasource: &str,
        feed_type: FeedType,
        xml: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        let mut shutdown = shutdown.clone();
        let mut delay = self.retry.initial_backoff;
        let mut last_failure = String::new();

        for attempt in 1..=self.retry.max_attempts {
            if *shutdown.borrow() {
                return Err(FeedError::Interrupted);
            }
            match self.attempt(datasource, feed_type, xml).await {
                Ok(()) => {
                    debug!(datasource, attempt, "feed accepted by appliance");
                    return Ok(());
                }
                Err(AttemptFailure::Permanent(message)) => {
                    return Err(FeedError::Permanent { message });
                }
                Err(AttemptFailure::Transient(message)) => {
                    warn!(datasource, attempt, %message, "feed delivery attempt failed");
                    last_failure = message;
                    if attempt == self.retry.max_attempts {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            return Err(FeedError::Interrupted);
                        }
                    }
                    delay = (delay * self.retry.backoff_factor).min(self.retry.max_backoff);
                }
            }
        }

        Err(FeedError::Transient {
            message: last_failure,
            attempts: self.retry.max_attempts,
        })
    }

    async fn attempt(
        &self,
        datasource: &str,
        feed_type: FeedType,
        xml: &str,
    ) -> Result<(), AttemptFailure> {
        let data = Part::text(xml.to_string())
            .mime_str("text/xml")
            .map_err(|e| AttemptFailure::Permanent(format!("invalid feed part: {e}")))?;
        let form = Form::new()
            .text("datasource", datasource.to_string())
            .text("feedtype", feed_type.as_wire_str())
            .part("data", data);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AttemptFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AttemptFailure::Permanent(format!(
                "appliance answered {status}"
            )));
        }
        if !status.is_success() {
            return Err(AttemptFailure::Transient(format!(
                "appliance answered {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AttemptFailure::Transient(format!("reading response body: {e}")))?;
        if body.contains("Success") {
            Ok(())
        } else {
            let head: String = body.chars().take(200).collect();
            Err(AttemptFailure::Permanent(format!(
                "unexpected response body: {head:?}"
            )))
        }
    }
}
