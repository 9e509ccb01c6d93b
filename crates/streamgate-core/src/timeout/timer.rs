use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::IdleTracker;

/// Why an [`IdleTimer`] cancelled its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiredReason {
    /// No progress within the per-attempt window.
    AttemptIdle,
    /// The request's shared idle budget ran out.
    TotalBudget,
}

/// Resettable countdown for one upstream call.
///
/// The timer owns a child of the caller's cancellation scope. The scope is
/// cancelled when the attempt stays silent for too long, when the shared
/// budget is gone, or when the parent is cancelled. Every method is a no-op
/// once the timer has fired or been stopped.
pub struct IdleTimer {
    shared: Arc<Shared>,
    scope: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    tracker: Arc<IdleTracker>,
    per_attempt: Duration,
    state: Mutex<TimerState>,
    wake: Notify,
}

struct TimerState {
    last_progress: Instant,
    first_content: bool,
    fired: Option<FiredReason>,
    stopped: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deadline(&self, state: &TimerState) -> Instant {
        let window = if state.first_content {
            self.per_attempt
        } else {
            self.per_attempt.min(self.tracker.remaining())
        };
        state.last_progress + window
    }

    /// Moves the progress mark to `now`, charging the gap while the attempt
    /// is still waiting for content.
    fn advance(&self, state: &mut TimerState, now: Instant) {
        if !state.first_content {
            self.tracker
                .consume(now.saturating_duration_since(state.last_progress));
        }
        state.last_progress = now;
    }
}

impl IdleTimer {
    pub fn start(
        parent: &CancellationToken,
        per_attempt: Duration,
        tracker: Arc<IdleTracker>,
    ) -> Self {
        let scope = parent.child_token();
        let shared = Arc::new(Shared {
            tracker,
            per_attempt,
            state: Mutex::new(TimerState {
                last_progress: Instant::now(),
                first_content: false,
                fired: None,
                stopped: false,
            }),
            wake: Notify::new(),
        });

        if shared.tracker.is_exhausted() {
            shared.lock().fired = Some(FiredReason::TotalBudget);
            scope.cancel();
            return Self {
                shared,
                scope,
                task: None,
            };
        }

        let task = tokio::spawn(watch(shared.clone(), scope.clone()));
        Self {
            shared,
            scope,
            task: Some(task),
        }
    }

    /// Scope every operation of this attempt should run under.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub fn cancel(&self) {
        self.scope.cancel();
    }

    /// Records progress and restarts the per-attempt countdown.
    pub fn reset(&self) {
        let mut state = self.shared.lock();
        if state.stopped || state.fired.is_some() {
            return;
        }
        self.shared.advance(&mut state, Instant::now());
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Ends the first-byte phase; later silence no longer drains the budget.
    pub fn mark_first_content(&self) {
        let mut state = self.shared.lock();
        if state.stopped || state.fired.is_some() || state.first_content {
            return;
        }
        self.shared.advance(&mut state, Instant::now());
        state.first_content = true;
        drop(state);
        self.shared.wake.notify_one();
    }

    pub fn fired_reason(&self) -> Option<FiredReason> {
        self.shared.lock().fired
    }

    pub fn stop(&self) {
        let mut state = self.shared.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        drop(state);
        self.shared.wake.notify_one();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn watch(shared: Arc<Shared>, scope: CancellationToken) {
    loop {
        let deadline = {
            let state = shared.lock();
            if state.stopped || state.fired.is_some() {
                return;
            }
            shared.deadline(&state)
        };

        tokio::select! {
            _ = scope.cancelled() => return,
            _ = shared.wake.notified() => continue,
            _ = sleep_until(deadline) => {}
        }

        let mut state = shared.lock();
        if state.stopped || state.fired.is_some() {
            return;
        }
        let now = Instant::now();
        if now < shared.deadline(&state) {
            continue;
        }
        shared.advance(&mut state, now);
        let reason = if shared.tracker.is_exhausted() {
            FiredReason::TotalBudget
        } else {
            FiredReason::AttemptIdle
        };
        state.fired = Some(reason);
        drop(state);

        debug!(
            reason = ?reason,
            remaining_ms = shared.tracker.remaining().as_millis() as u64,
            "idle timer fired"
        );
        scope.cancel();
        return;
    }
}
