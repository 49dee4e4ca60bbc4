//! Cancellable scheduled tasks
//!
//! Every timer in the core (the 1 s duration tick, the 2 s quality sampler,
//! the transport event pump) is a [`ScheduledTask`]: a spawned tokio task paired
//! with a [`CancellationToken`]. Cancelling the token, or dropping the handle,
//! is the one and only way a timer stops, so no timer outlives its owner.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a periodic task wants after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    /// Keep ticking
    Continue,
    /// Stop the timer from inside the tick
    Stop,
}

/// Handle to a spawned, cancellable task
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Spawn a one-shot future that stops early when cancelled
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = future => {
                    debug!(task = %task_name, "Task completed");
                }
                _ = cancel.cancelled() => {
                    debug!(task = %task_name, "Task cancelled");
                }
            }
        });

        Self {
            name,
            token,
            handle,
        }
    }

    /// Spawn a periodic task
    ///
    /// The first tick fires one `period` after spawning. `tick` receives the
    /// 1-based tick number. Missed ticks are delivered in a burst so the tick
    /// count always equals the elapsed whole periods.
    pub fn periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            let mut count = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(task = %task_name, ticks = count, "Timer cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        count += 1;
                        if tick(count).await == TickControl::Stop {
                            debug!(task = %task_name, ticks = count, "Timer stopped itself");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            token,
            handle,
        }
    }

    /// Task name used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cancellation; the task stops at its next suspension point
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the underlying task has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_once_per_period() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        let task = ScheduledTask::periodic("test", Duration::from_secs(1), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TickControl::Continue
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_can_stop_timer() {
        let task = ScheduledTask::periodic("stopper", Duration::from_millis(100), |n| async move {
            if n >= 2 {
                TickControl::Stop
            } else {
                TickControl::Continue
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(task.is_finished());
        assert!(!task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        let task = ScheduledTask::periodic("dropped", Duration::from_secs(1), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                TickControl::Continue
            }
        });
        drop(task);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
