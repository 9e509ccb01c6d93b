use std::sync::Arc;
use std::time::Duration;

use streamgate_core::timeout::{FiredReason, IdleTimer, IdleTracker};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test(start_paused = true)]
async fn silent_attempt_fires_attempt_idle() {
    let parent = CancellationToken::new();
    let tracker = Arc::new(IdleTracker::new(secs(90)));
    let timer = IdleTimer::start(&parent, secs(30), tracker.clone());

    timeout(secs(31), timer.scope().cancelled()).await.unwrap();
    assert_eq!(timer.fired_reason(), Some(FiredReason::AttemptIdle));
    assert_eq!(tracker.remaining(), secs(60));
    assert!(!parent.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn shared_budget_runs_out_across_attempts() {
    let parent = CancellationToken::new();
    let tracker = Arc::new(IdleTracker::new(secs(50)));

    let first = IdleTimer::start(&parent, secs(30), tracker.clone());
    first.scope().cancelled().await;
    assert_eq!(first.fired_reason(), Some(FiredReason::AttemptIdle));

    let second = IdleTimer::start(&parent, secs(30), tracker.clone());
    let before = tokio::time::Instant::now();
    second.scope().cancelled().await;
    assert_eq!(before.elapsed(), secs(20));
    assert_eq!(second.fired_reason(), Some(FiredReason::TotalBudget));
    assert!(tracker.is_exhausted());

    let third = IdleTimer::start(&parent, secs(30), tracker);
    assert!(third.is_cancelled());
    assert_eq!(third.fired_reason(), Some(FiredReason::TotalBudget));
}

#[tokio::test(start_paused = true)]
async fn steady_progress_after_first_content_is_never_charged() {
    let parent = CancellationToken::new();
    let tracker = Arc::new(IdleTracker::new(secs(90)));
    let timer = IdleTimer::start(&parent, secs(30), tracker.clone());
    timer.mark_first_content();

    for _ in 0..10 {
        sleep(secs(20)).await;
        assert!(!timer.is_cancelled());
        timer.reset();
    }
    assert_eq!(tracker.remaining(), secs(90));
    assert_eq!(timer.fired_reason(), None);
}

#[tokio::test(start_paused = true)]
async fn gaps_before_first_content_drain_the_budget() {
    let parent = CancellationToken::new();
    let tracker = Arc::new(IdleTracker::new(secs(90)));
    let timer = IdleTimer::start(&parent, secs(30), tracker.clone());

    sleep(secs(10)).await;
    timer.reset();
    sleep(secs(5)).await;
    timer.mark_first_content();
    assert_eq!(tracker.remaining(), secs(75));

    sleep(secs(25)).await;
    timer.reset();
    assert_eq!(tracker.remaining(), secs(75));
    assert!(!timer.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_disarms() {
    let parent = CancellationToken::new();
    let tracker = Arc::new(IdleTracker::new(secs(90)));
    let timer = IdleTimer::start(&parent, secs(30), tracker);

    timer.stop();
    timer.stop();
    timer.reset();
    timer.mark_first_content();
    sleep(secs(120)).await;
    assert!(!timer.is_cancelled());
    assert_eq!(timer.fired_reason(), None);
}

#[tokio::test(start_paused = true)]
async fn parent_cancellation_reaches_the_scope_without_a_reason() {
    let parent = CancellationToken::new();
    let tracker = Arc::new(IdleTracker::new(secs(90)));
    let timer = IdleTimer::start(&parent, secs(30), tracker);

    parent.cancel();
    assert!(timer.is_cancelled());
    assert_eq!(timer.fired_reason(), None);
}
