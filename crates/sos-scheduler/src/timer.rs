//! Minimal timer: "run once after a delay" and "run periodically from a
//! computed first instant", each returning a cancellation handle.
//!
//! A [`Timer`] behaves like a single timer thread: every task it runs holds
//! the timer's turn mutex, so two tasks of the same timer never overlap.
//! Cancelling the timer also abandons the task currently running at its next
//! await point.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancels one scheduled task without touching the rest of its timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct Timer {
    name: &'static str,
    cancel: CancellationToken,
    turn: Arc<tokio::sync::Mutex<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Timer {
    /// Must be called from within a Tokio runtime.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cancel: CancellationToken::new(),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.child_token();
        let handle = TimerHandle {
            token: token.clone(),
        };
        let turn = Arc::clone(&self.turn);
        let name = self.name;

        self.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            run_turn(name, &turn, &token, task()).await;
        });
        handle
    }

    /// Run `task` after `first_delay`, then every `period`. A run that
    /// overshoots its slot causes the missed slots to be skipped, not
    /// replayed.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        first_delay: Duration,
        period: Duration,
        task: F,
    ) -> TimerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.child_token();
        let handle = TimerHandle {
            token: token.clone(),
        };
        let turn = Arc::clone(&self.turn);
        let name = self.name;
        // interval_at panics on a zero period.
        let period = period.max(Duration::from_millis(1));

        self.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + first_delay, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                if !run_turn(name, &turn, &token, task()).await {
                    return;
                }
            }
        });
        handle
    }

    /// Cancel every pending and running task. Later schedules are no-ops.
    pub fn cancel(&self) {
        debug!(timer = self.name, "timer cancelled");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for every spawned task to finish. Pair with [`Timer::cancel`].
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(tokio::spawn(fut));
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait for the timer's turn, then drive `fut` unless cancelled first.
/// Returns false when the task was cancelled.
async fn run_turn<Fut>(
    name: &'static str,
    turn: &tokio::sync::Mutex<()>,
    token: &CancellationToken,
    fut: Fut,
) -> bool
where
    Fut: Future<Output = ()>,
{
    let _turn = tokio::select! {
        _ = token.cancelled() => return false,
        guard = turn.lock() => guard,
    };
    tokio::select! {
        _ = token.cancelled() => {
            debug!(timer = name, "running task abandoned");
            false
        }
        _ = fut => true,
    }
}
