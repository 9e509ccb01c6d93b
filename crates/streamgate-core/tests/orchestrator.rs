mod support;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use streamgate_core::error::GatewayError;
use streamgate_core::orchestrator::{
    AttemptCtx, AttemptFailure, AttemptRunner, Orchestrator, RetryPolicy,
};
use streamgate_core::pipeline::{CompletionAttempt, UpstreamTarget};
use streamgate_core::timeout::IdleTracker;
use streamgate_core::upstream::UpstreamReader;
use streamgate_core::usage::TokenCounter;
use streamgate_protocol::chat::ChatCompletionRequest;
use support::{Script, ScriptedUpstream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Runner that replays outcomes and logs `(model, attempt)` per call.
struct ScriptedRunner {
    outcomes: VecDeque<Result<&'static str, AttemptFailure>>,
    calls: Vec<(String, u32)>,
}

impl ScriptedRunner {
    fn new(outcomes: Vec<Result<&'static str, AttemptFailure>>) -> Self {
        Self {
            outcomes: outcomes.into(),
            calls: Vec::new(),
        }
    }

    fn models(&self) -> Vec<&str> {
        self.calls.iter().map(|(model, _)| model.as_str()).collect()
    }
}

#[async_trait]
impl AttemptRunner for ScriptedRunner {
    type Output = &'static str;

    async fn run(&mut self, ctx: AttemptCtx<'_>) -> Result<&'static str, AttemptFailure> {
        self.calls.push((ctx.model.to_string(), ctx.attempt));
        self.outcomes
            .pop_front()
            .unwrap_or_else(|| Err(AttemptFailure::uncommitted(GatewayError::Cancelled)))
    }
}

struct LenCounter;

impl TokenCounter for LenCounter {
    fn count(&self, text: &str) -> u64 {
        text.split_whitespace().count() as u64
    }
}

fn unavailable() -> Result<&'static str, AttemptFailure> {
    Err(AttemptFailure::uncommitted(GatewayError::from_upstream_status(
        503,
        b"service unavailable",
    )))
}

fn models(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn tracker(total: u64) -> Arc<IdleTracker> {
    Arc::new(IdleTracker::new(Duration::from_secs(total)))
}

fn request() -> ChatCompletionRequest {
    serde_json::from_value(serde_json::json!({
        "model": "m",
        "messages": [{"role": "user", "content": "hi"}]
    }))
    .unwrap()
}

fn target() -> UpstreamTarget {
    UpstreamTarget {
        url: "http://upstream.test/v1/chat/completions".to_string(),
        headers: Vec::new(),
        routed: false,
    }
}

#[tokio::test(start_paused = true)]
async fn degrades_through_failing_models_until_one_succeeds() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![
        unavailable(),
        unavailable(),
        unavailable(),
        unavailable(),
        Ok("from m3"),
    ]);

    let served = orchestrator
        .run(
            &models(&["m1", "m2", "m3"]),
            tracker(90),
            &CancellationToken::new(),
            &mut runner,
        )
        .await
        .unwrap();

    assert_eq!(served.model, "m3");
    assert_eq!(served.value, "from m3");
    assert_eq!(served.attempts, 5);
    assert_eq!(runner.models(), vec!["m1", "m1", "m2", "m2", "m3"]);
    assert!(runner.calls.iter().all(|(_, attempt)| *attempt <= 2));
}

#[tokio::test(start_paused = true)]
async fn low_budget_skips_the_retry_and_the_sleep() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![unavailable(), Ok("from m2")]);
    let started = Instant::now();

    let served = orchestrator
        .run(
            &models(&["m1", "m2"]),
            tracker(4),
            &CancellationToken::new(),
            &mut runner,
        )
        .await
        .unwrap();

    assert_eq!(served.model, "m2");
    assert_eq!(runner.models(), vec!["m1", "m2"]);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn low_budget_on_last_model_returns_its_error() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![unavailable()]);

    let exhausted = orchestrator
        .run(&models(&["m1"]), tracker(3), &CancellationToken::new(), &mut runner)
        .await
        .unwrap_err();

    assert_eq!(runner.calls.len(), 1);
    assert!(matches!(exhausted.error, GatewayError::Api(ref api) if api.status == 503));
    assert_eq!(exhausted.model.as_deref(), Some("m1"));
}

#[tokio::test(start_paused = true)]
async fn server_error_is_retried_once_on_the_same_model() {
    let upstream = ScriptedUpstream::new(vec![
        Script::status(500, "boom"),
        Script::Json(r#"{"choices":[{"message":{"content":"hello"}}]}"#.to_string()),
    ]);
    let mut attempt = CompletionAttempt::new(
        UpstreamReader::new(upstream.clone()),
        request(),
        target(),
        Arc::new(LenCounter),
    );
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let started = Instant::now();

    let served = orchestrator
        .run(&models(&["m"]), tracker(90), &CancellationToken::new(), &mut attempt)
        .await
        .unwrap();

    assert_eq!(served.model, "m");
    assert_eq!(served.value.response.content(), "hello");
    assert!(served.value.usage_synthesized);
    assert_eq!(upstream.calls(), 2);
    assert_eq!(upstream.models(), vec!["m", "m"]);
    assert_eq!(started.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn second_model_serves_after_first_fails_twice() {
    let upstream = ScriptedUpstream::new(vec![
        Script::status(500, "boom"),
        Script::status(500, "boom again"),
        Script::Json(
            r#"{"choices":[{"message":{"content":"from m2"}}],"usage":{"prompt_tokens":1,"completion_tokens":2,"total_tokens":3}}"#
                .to_string(),
        ),
    ]);
    let mut attempt = CompletionAttempt::new(
        UpstreamReader::new(upstream.clone()),
        request(),
        target(),
        Arc::new(LenCounter),
    );
    let orchestrator = Orchestrator::new(RetryPolicy::default());

    let served = orchestrator
        .run(
            &models(&["m1", "m2"]),
            tracker(90),
            &CancellationToken::new(),
            &mut attempt,
        )
        .await
        .unwrap();

    assert_eq!(served.model, "m2");
    assert_eq!(served.value.response.content(), "from m2");
    assert!(!served.value.usage_synthesized);
    assert_eq!(upstream.models(), vec!["m1", "m1", "m2"]);
}

#[tokio::test(start_paused = true)]
async fn context_length_is_terminal() {
    let upstream = ScriptedUpstream::new(vec![Script::status(
        400,
        r#"{"error":{"message":"This model's maximum context length is 8192 tokens","type":"invalid_request_error"}}"#,
    )]);
    let mut attempt = CompletionAttempt::new(
        UpstreamReader::new(upstream.clone()),
        request(),
        target(),
        Arc::new(LenCounter),
    );
    let orchestrator = Orchestrator::new(RetryPolicy::default());

    let exhausted = orchestrator
        .run(
            &models(&["m1", "m2"]),
            tracker(90),
            &CancellationToken::new(),
            &mut attempt,
        )
        .await
        .unwrap_err();

    assert_eq!(exhausted.error, GatewayError::ContextTooLong);
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn committed_failure_stops_everything() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![Err(AttemptFailure {
        error: GatewayError::Network("reset by peer".to_string()),
        committed: true,
    })]);

    let exhausted = orchestrator
        .run(
            &models(&["m1", "m2"]),
            tracker(90),
            &CancellationToken::new(),
            &mut runner,
        )
        .await
        .unwrap_err();

    assert!(exhausted.committed);
    assert_eq!(exhausted.model.as_deref(), Some("m1"));
    assert_eq!(runner.models(), vec!["m1"]);
}

#[tokio::test(start_paused = true)]
async fn committed_context_length_failure_keeps_its_identity() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![Err(AttemptFailure {
        error: GatewayError::from_upstream_status(
            400,
            br#"{"error":{"message":"This model's maximum context length is 8192 tokens"}}"#,
        ),
        committed: true,
    })]);

    let exhausted = orchestrator
        .run(
            &models(&["m1", "m2"]),
            tracker(90),
            &CancellationToken::new(),
            &mut runner,
        )
        .await
        .unwrap_err();

    assert_eq!(exhausted.error, GatewayError::ContextTooLong);
    assert!(exhausted.committed);
    assert_eq!(exhausted.model.as_deref(), Some("m1"));
    assert_eq!(runner.models(), vec!["m1"]);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_moves_on_without_sleeping() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![
        Err(AttemptFailure::uncommitted(GatewayError::from_upstream_status(
            401,
            b"bad key",
        ))),
        Ok("from m2"),
    ]);
    let started = Instant::now();

    let served = orchestrator
        .run(
            &models(&["m1", "m2"]),
            tracker(90),
            &CancellationToken::new(),
            &mut runner,
        )
        .await
        .unwrap();

    assert_eq!(served.model, "m2");
    assert_eq!(runner.models(), vec!["m1", "m2"]);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_ends_the_request() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(vec![unavailable(), Ok("never")]);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let exhausted = orchestrator
        .run(&models(&["m1", "m2"]), tracker(90), &cancel, &mut runner)
        .await
        .unwrap_err();

    assert_eq!(exhausted.error, GatewayError::Cancelled);
    assert_eq!(runner.calls.len(), 1);
}

#[tokio::test]
async fn empty_candidate_list_is_a_client_error() {
    let orchestrator = Orchestrator::new(RetryPolicy::default());
    let mut runner = ScriptedRunner::new(Vec::new());

    let exhausted = orchestrator
        .run(&models(&["", " "]), tracker(90), &CancellationToken::new(), &mut runner)
        .await
        .unwrap_err();

    assert!(matches!(exhausted.error, GatewayError::Client(_)));
    assert_eq!(exhausted.attempts, 0);
}
