use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ExponentialBackoff, RetryConfig, RetryTrigger};
use crate::error::PipelineError;
use crate::policy::{Next, Policy, sleep_or_cancel};
use crate::request::Request;
use crate::response::Response;

/// Overrides the retry decision for a single attempt outcome.
///
/// Return `Some(true)` to retry, `Some(false)` to stop, or `None` to fall back
/// to [`RetryConfig::retry_on`]. The attempt budget still applies, and
/// cancellation is never retried.
pub trait RetryClassifier: Send + Sync {
    fn classify(&self, outcome: Result<&Response, &PipelineError>) -> Option<bool>;
}

/// Bounded retry with exponential backoff, jitter and server retry hints.
///
/// Each attempt rewinds the body, forwards an independent clone of the
/// request that shares the caller's cancellation signal, and classifies the
/// outcome. Retryable responses are drained before the wait so the
/// connection can be reused. When the budget runs out the last response or
/// error is returned unchanged.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Option<Arc<dyn RetryClassifier>>,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: None,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn is_retryable(&self, outcome: &Result<Response, PipelineError>) -> bool {
        if matches!(
            outcome,
            Err(PipelineError::Canceled | PipelineError::BodyNotReplayable)
        ) {
            return false;
        }

        if let Some(classifier) = &self.classifier
            && let Some(decision) = classifier.classify(outcome.as_ref())
        {
            return decision;
        }

        let trigger = match outcome {
            Ok(response) => RetryTrigger::Status(response.status().as_u16()),
            Err(err) => retry_trigger(err),
        };
        self.config.should_retry(trigger)
    }

    async fn attempt(
        &self,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, PipelineError> {
        match self.config.try_timeout {
            Some(limit) => tokio::time::timeout(limit, next.run(request))
                .await
                .unwrap_or(Err(PipelineError::Timeout(limit))),
            None => next.run(request).await,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("has_classifier", &self.classifier.is_some())
            .finish()
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(&self, request: &mut Request, next: Next<'_>) -> Result<Response, PipelineError> {
        let token = request.cancellation_token().clone();
        let method = request.method().clone();
        let host = request.url().host_str().unwrap_or("unknown").to_owned();

        let mut attempt = 0usize;
        loop {
            if attempt > 0 {
                request.rewind()?;
            }

            let mut try_request = request.clone_with(token.clone());
            let outcome = self.attempt(&mut try_request, next).await;

            if attempt >= self.config.max_retries || !self.is_retryable(&outcome) {
                return outcome;
            }

            let retry_after = match &outcome {
                Ok(response) if !self.config.ignore_retry_after => response.retry_after(),
                _ => None,
            };
            let backoff = retry_after.map_or_else(
                || calculate_backoff(&self.config.backoff, attempt),
                |hint| hint.min(self.config.backoff.max),
            );

            match outcome {
                Ok(response) => {
                    tracing::debug!(
                        retry = attempt + 1,
                        max_retries = self.config.max_retries,
                        status = response.status().as_u16(),
                        method = %method,
                        host = %host,
                        backoff_ms = backoff.as_millis(),
                        retry_after_used = retry_after.is_some(),
                        "Retrying request after status code"
                    );
                    response.drain(self.config.retry_response_drain_limit).await;
                }
                Err(err) => {
                    tracing::debug!(
                        retry = attempt + 1,
                        max_retries = self.config.max_retries,
                        error = %err,
                        method = %method,
                        host = %host,
                        backoff_ms = backoff.as_millis(),
                        "Retrying request after error"
                    );
                }
            }

            sleep_or_cancel(backoff, &token).await?;
            attempt += 1;
        }
    }
}

fn retry_trigger(err: &PipelineError) -> RetryTrigger {
    match err {
        PipelineError::Transport(_) => RetryTrigger::TransportError,
        PipelineError::Timeout(_) => RetryTrigger::Timeout,
        _ => RetryTrigger::NonRetryable,
    }
}

/// Backoff before retry number `attempt + 1`.
///
/// `initial * multiplier^attempt`, capped at `max`, plus 0-25 % jitter when
/// enabled (still capped). Non-finite or negative inputs are sanitized
/// instead of panicking.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    // One day; anything longer is not a retry delay
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };

    let initial_secs = backoff.initial.as_secs_f64();
    let max_secs = backoff.max.as_secs_f64().min(MAX_BACKOFF_SECS);

    let base = initial_secs * multiplier.powi(attempt);
    let clamped = if base.is_finite() {
        base.clamp(0.0, max_secs)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if backoff.jitter {
        let factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(factor)
    } else {
        duration
    };

    duration.min(Duration::from_secs_f64(max_secs))
}
