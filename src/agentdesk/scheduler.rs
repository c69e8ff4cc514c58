//! Tickable rest countdown between office iterations.
//!
//! The office loop parks here during `Resting`. The countdown emits one tick
//! per second on a broadcast channel and always finishes with a final tick at
//! zero seconds remaining, whether it ran to completion, was skipped by the
//! user, or was cancelled by a stop. No tick is emitted after the wait
//! returns.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// One second of countdown progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestTick {
    pub seconds_remaining: u64,
    pub total_seconds: u64,
}

/// How a countdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestOutcome {
    /// Ran the full duration.
    Completed,
    /// Ended early via [`CountdownScheduler::cancel_rest`] or a duration
    /// override; the caller decides whether to re-wait.
    Skipped,
    /// The run's cancel signal fired.
    Cancelled,
}

/// Countdown with early cancel and duration override.
pub struct CountdownScheduler {
    rest_cancel: Notify,
    override_minutes: Mutex<Option<u64>>,
    ticks: broadcast::Sender<RestTick>,
}

impl Default for CountdownScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CountdownScheduler {
    pub fn new() -> Self {
        let (ticks, _) = broadcast::channel(128);
        Self {
            rest_cancel: Notify::new(),
            override_minutes: Mutex::new(None),
            ticks,
        }
    }

    /// Subscribe to per-second ticks.
    pub fn subscribe(&self) -> broadcast::Receiver<RestTick> {
        self.ticks.subscribe()
    }

    /// End the active countdown now. A no-op when nothing is waiting.
    pub fn cancel_rest(&self) {
        self.rest_cancel.notify_waiters();
    }

    /// Replace the rest duration. The active wait is cancelled; the owner is
    /// expected to pick up the override and re-invoke with the new duration.
    pub fn override_rest_duration(&self, minutes: u64) {
        *self.override_minutes.lock().expect("scheduler lock poisoned") = Some(minutes);
        self.rest_cancel.notify_waiters();
    }

    /// Consume a pending duration override, if any.
    pub fn take_override(&self) -> Option<u64> {
        self.override_minutes.lock().expect("scheduler lock poisoned").take()
    }

    /// Park for `minutes` (clamped to at least one second), ticking once per
    /// second. Completes early on [`cancel_rest`](Self::cancel_rest),
    /// override, or `cancel`.
    pub async fn wait_for_next_iteration(
        &self,
        minutes: u64,
        cancel: &CancellationToken,
    ) -> RestOutcome {
        let total = (minutes * 60).max(1);
        let mut remaining = total;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick resolves immediately; consume it so ticks
        // land on whole-second boundaries.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    remaining -= 1;
                    self.send_tick(remaining, total);
                    if remaining == 0 {
                        return RestOutcome::Completed;
                    }
                }
                _ = self.rest_cancel.notified() => {
                    self.send_tick(0, total);
                    return RestOutcome::Skipped;
                }
                _ = cancel.cancelled() => {
                    self.send_tick(0, total);
                    return RestOutcome::Cancelled;
                }
            }
        }
    }

    fn send_tick(&self, seconds_remaining: u64, total_seconds: u64) {
        let _ = self.ticks.send(RestTick { seconds_remaining, total_seconds });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn natural_completion_ends_with_zero_tick() {
        let scheduler = CountdownScheduler::new();
        let mut ticks = scheduler.subscribe();
        let cancel = CancellationToken::new();

        let outcome = scheduler.wait_for_next_iteration(1, &cancel).await;
        assert_eq!(outcome, RestOutcome::Completed);

        let mut collected = Vec::new();
        while let Ok(tick) = ticks.try_recv() {
            collected.push(tick);
        }
        assert_eq!(collected.len(), 60);
        assert_eq!(collected.first().unwrap().seconds_remaining, 59);
        assert_eq!(collected.last().unwrap().seconds_remaining, 0);
        assert!(collected.iter().all(|t| t.total_seconds == 60));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_minutes_clamps_to_one_second() {
        let scheduler = CountdownScheduler::new();
        let mut ticks = scheduler.subscribe();
        let cancel = CancellationToken::new();

        let outcome = scheduler.wait_for_next_iteration(0, &cancel).await;
        assert_eq!(outcome, RestOutcome::Completed);
        assert_eq!(ticks.try_recv().unwrap(), RestTick { seconds_remaining: 0, total_seconds: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_rest_skips_and_still_ticks_zero() {
        let scheduler = std::sync::Arc::new(CountdownScheduler::new());
        let mut ticks = scheduler.subscribe();
        let cancel = CancellationToken::new();

        let waiter = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.wait_for_next_iteration(5, &cancel).await })
        };
        // Let the waiter reach its select loop.
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.cancel_rest();

        let outcome = waiter.await.unwrap();
        assert_eq!(outcome, RestOutcome::Skipped);

        let mut last = None;
        while let Ok(tick) = ticks.try_recv() {
            last = Some(tick);
        }
        assert_eq!(last.unwrap().seconds_remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancellation_ends_the_wait() {
        let scheduler = std::sync::Arc::new(CountdownScheduler::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.wait_for_next_iteration(10, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), RestOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn override_skips_and_records_new_duration() {
        let scheduler = std::sync::Arc::new(CountdownScheduler::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.wait_for_next_iteration(30, &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        scheduler.override_rest_duration(2);

        assert_eq!(waiter.await.unwrap(), RestOutcome::Skipped);
        assert_eq!(scheduler.take_override(), Some(2));
        assert_eq!(scheduler.take_override(), None);
    }
}
