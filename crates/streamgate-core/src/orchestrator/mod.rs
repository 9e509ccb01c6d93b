//! Retry and degradation across candidate models.
//!
//! Candidates are tried in order. A model gets a second attempt after a fixed
//! backoff when its failure is retryable and enough idle budget is left;
//! otherwise the next candidate is tried immediately. Failures after the
//! client has seen content, context-length errors, cancellation and
//! downstream write failures stop the whole request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use streamgate_common::GatewayConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::timeout::{IdleTimer, IdleTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts_per_model: u32,
    pub backoff: Duration,
    /// A retry is skipped when less idle budget than this is left.
    pub min_retry_budget: Duration,
    pub idle_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_attempts_per_model: config.max_attempts_per_model,
            backoff: config.retry_backoff,
            min_retry_budget: config.min_retry_budget,
            idle_timeout: config.idle_timeout,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_model: 2,
            backoff: Duration::from_secs(5),
            min_retry_budget: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// What one attempt gets to work with.
pub struct AttemptCtx<'a> {
    pub model: &'a str,
    /// 1-based attempt number for this model.
    pub attempt: u32,
    pub tracker: &'a Arc<IdleTracker>,
    pub cancel: &'a CancellationToken,
    pub idle_timeout: Duration,
}

impl AttemptCtx<'_> {
    /// Fresh per-call timer bound to the request's tracker and scope.
    pub fn start_timer(&self) -> IdleTimer {
        IdleTimer::start(self.cancel, self.idle_timeout, self.tracker.clone())
    }
}

#[derive(Debug)]
pub struct AttemptFailure {
    pub error: GatewayError,
    /// Whether the client had already received content when this failed.
    pub committed: bool,
}

impl AttemptFailure {
    pub fn uncommitted(error: GatewayError) -> Self {
        Self {
            error,
            committed: false,
        }
    }
}

#[async_trait]
pub trait AttemptRunner: Send {
    type Output: Send;

    async fn run(&mut self, ctx: AttemptCtx<'_>) -> Result<Self::Output, AttemptFailure>;
}

#[derive(Debug)]
pub struct Served<T> {
    pub model: String,
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct Exhausted {
    pub error: GatewayError,
    /// Last model that was tried, if any.
    pub model: Option<String>,
    pub attempts: u32,
    pub committed: bool,
}

pub struct Orchestrator {
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run<R: AttemptRunner>(
        &self,
        models: &[String],
        tracker: Arc<IdleTracker>,
        cancel: &CancellationToken,
        runner: &mut R,
    ) -> Result<Served<R::Output>, Exhausted> {
        let candidates = dedupe_models(models);
        if candidates.is_empty() {
            return Err(Exhausted {
                error: GatewayError::Client("no candidate model to call".to_string()),
                model: None,
                attempts: 0,
                committed: false,
            });
        }

        let mut attempts = 0u32;
        let mut last_error = None;
        let mut last_model = None;

        for model in candidates {
            let mut attempt = 1u32;
            loop {
                attempts += 1;
                info!(model = %model, attempt, "calling model");
                let ctx = AttemptCtx {
                    model: &model,
                    attempt,
                    tracker: &tracker,
                    cancel,
                    idle_timeout: self.policy.idle_timeout,
                };
                let failure = match runner.run(ctx).await {
                    Ok(value) => {
                        info!(model = %model, attempt, "model succeeded");
                        return Ok(Served {
                            model,
                            value,
                            attempts,
                        });
                    }
                    Err(failure) => failure,
                };

                let terminal = |error: GatewayError, model: String| Exhausted {
                    error,
                    model: Some(model),
                    attempts,
                    committed: failure.committed,
                };
                // Context-length errors surface as such, committed or not.
                if failure.error.is_context_length() {
                    warn!(model = %model, error = %failure.error, committed = failure.committed, "input exceeds context length");
                    return Err(terminal(GatewayError::ContextTooLong, model));
                }
                if failure.committed || failure.error.is_fatal() {
                    warn!(model = %model, error = %failure.error, committed = failure.committed, "attempt failed, not recoverable");
                    return Err(terminal(failure.error.clone(), model));
                }

                let retryable = failure.error.is_retryable();
                warn!(model = %model, attempt, retryable, error = %failure.error, "attempt failed");
                if retryable && attempt < self.policy.max_attempts_per_model {
                    let remaining = tracker.remaining();
                    if remaining >= self.policy.min_retry_budget {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(terminal(GatewayError::Cancelled, model));
                            }
                            _ = tokio::time::sleep(self.policy.backoff) => {}
                        }
                        attempt += 1;
                        continue;
                    }
                    warn!(
                        model = %model,
                        remaining_ms = remaining.as_millis() as u64,
                        "insufficient idle budget for retry"
                    );
                }

                last_error = Some(failure.error);
                last_model = Some(model);
                break;
            }
        }

        Err(Exhausted {
            error: last_error.unwrap_or(GatewayError::ModelServiceUnavailable(
                "every candidate model failed".to_string(),
            )),
            model: last_model,
            attempts,
            committed: false,
        })
    }
}

/// Drops blanks and repeats, keeping first-seen order.
pub fn dedupe_models(models: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    models
        .iter()
        .map(|model| model.trim())
        .filter(|model| !model.is_empty())
        .filter(|model| seen.insert(model.to_string()))
        .map(str::to_string)
        .collect()
}
