//! Restart policy for long-running tasks.
//!
//! The bot listener and the worker process are supervised the same way: run, and when
//! the run ends (error or not) wait an exponentially growing delay and run again. A run
//! that stayed healthy for `reset_after` resets the delay.

use std::{future::Future, time::Duration};

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            reset_after: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
        }
    }

    /// Delay before the next attempt; doubles up to `max` on every call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }

    /// Record how long the last run lasted.
    pub fn record_run(&mut self, ran_for: Duration) {
        if ran_for >= self.policy.reset_after {
            self.reset();
        }
    }
}

/// Run `task` until `cancel` fires, restarting it with backoff whenever it returns.
///
/// Failures are logged, never propagated: a supervised task cannot take its host down.
/// Returns the number of restarts performed.
pub async fn supervise<F, Fut>(
    name: &str,
    cancel: CancellationToken,
    policy: BackoffPolicy,
    mut task: F,
) -> usize
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = Backoff::new(policy);
    let mut restarts = 0usize;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = task(cancel.child_token()) => r,
        };
        backoff.record_run(started.elapsed());

        let delay = backoff.next_delay();
        match result {
            Ok(()) => tracing::info!(task = name, delay_ms = delay.as_millis() as u64, "task exited, restarting"),
            Err(e) => tracing::warn!(task = name, delay_ms = delay.as_millis() as u64, error = %e, "task failed, restarting"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        restarts += 1;
    }

    tracing::info!(task = name, restarts, "supervised task stopped");
    restarts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn delays_double_and_cap() {
        let mut b = Backoff::new(BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            reset_after: Duration::from_secs(60),
        });
        let got: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(got, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn healthy_run_resets_delay() {
        let mut b = Backoff::new(BackoffPolicy::default());
        b.next_delay();
        b.next_delay();
        b.record_run(Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        b.record_run(Duration::from_secs(120));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn supervise_restarts_failing_task_with_growing_delays() {
        let cancel = CancellationToken::new();
        let attempts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let attempts2 = attempts.clone();
        let cancel2 = cancel.clone();
        let restarts = supervise("flaky", cancel.clone(), BackoffPolicy::default(), move |_| {
            let attempts = attempts2.clone();
            let cancel = cancel2.clone();
            async move {
                let n = {
                    let mut a = attempts.lock().unwrap();
                    a.push(Instant::now());
                    a.len()
                };
                if n == 4 {
                    cancel.cancel();
                    std::future::pending::<()>().await;
                }
                Err::<(), _>(anyhow::anyhow!("attempt {n} failed"))
            }
        })
        .await;

        let offsets: Vec<u64> = attempts
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7]);
        assert_eq!(restarts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let restarts = supervise("idle", cancel, BackoffPolicy::default(), |_| async {
            Err::<(), _>(anyhow::anyhow!("must not run"))
        })
        .await;
        assert_eq!(restarts, 0);
    }
}
