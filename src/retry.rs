//! Retry with exponential backoff for outbound HTTP calls to collaborators.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CollaboratorError;

/// Retry budget and backoff shape shared by every HTTP collaborator client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero means a single attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based): `base × 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// HTTP statuses worth retrying: rate limiting and server-side failures.
pub fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

/// Send a request, retrying transport errors, timeouts, 429 and 5xx.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed
/// by `send`. Non-transient error statuses fail immediately as
/// [`CollaboratorError::Rejected`]; an exhausted budget yields
/// [`CollaboratorError::Unavailable`].
pub async fn send_with_retry<F>(
    service: &'static str,
    policy: &RetryPolicy,
    mut build: F,
) -> Result<reqwest::Response, CollaboratorError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut last_error = String::new();

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            warn!(service, attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying request");
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                debug!(service, status = %status, attempt, "response received");
                if status.is_success() {
                    return Ok(response);
                }
                let body = response.text().await.unwrap_or_default();
                if is_transient_status(status) {
                    last_error = format!("HTTP {status}: {body}");
                    continue;
                }
                return Err(CollaboratorError::Rejected {
                    service,
                    status: status.as_u16(),
                    message: body,
                });
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }
    }

    Err(CollaboratorError::Unavailable {
        service,
        attempts: policy.max_retries + 1,
        message: last_error,
    })
}
