//! Zombie cleanup for stuck panel discussions.
//!
//! A discussion that stays in `Running` or `Paused` far past its configured
//! duration is assumed to be wedged (a hung provider, a lost UI) and gets
//! force-stopped. The watcher observes phases from the outside on a periodic
//! tick; it never holds panel locks between ticks, every tick error is
//! caught and logged, and the timer itself never dies.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agentdesk::panel::{PanelOrchestrator, PanelPhase};

/// Default time between scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default discussion duration bound; force-stop triggers at twice this.
pub const DEFAULT_MAX_DISCUSSION: Duration = Duration::from_secs(60 * 60);

/// Periodically scans a panel orchestrator and force-stops zombie runs.
pub struct ZombieWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct WatchState {
    last_phase: PanelPhase,
    /// When the watcher last observed the phase change.
    boundary: Instant,
}

impl ZombieWatcher {
    /// Start watching `panel`, scanning every `scan_interval` and stopping
    /// runs stuck longer than `2 * max_discussion`.
    pub fn spawn(
        panel: Arc<PanelOrchestrator>,
        scan_interval: Duration,
        max_discussion: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut state = WatchState {
                    last_phase: panel.current_phase(),
                    boundary: Instant::now(),
                };
                let mut ticker = tokio::time::interval(scan_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let tick = AssertUnwindSafe(Self::scan(
                                &panel,
                                &mut state,
                                max_discussion,
                            ))
                            .catch_unwind()
                            .await;
                            if tick.is_err() {
                                log::error!("zombie watcher tick panicked; continuing");
                            }
                        }
                    }
                }
            })
        };
        Self { cancel, handle }
    }

    async fn scan(
        panel: &Arc<PanelOrchestrator>,
        state: &mut WatchState,
        max_discussion: Duration,
    ) {
        let phase = panel.current_phase();
        if phase != state.last_phase {
            state.last_phase = phase;
            state.boundary = Instant::now();
            return;
        }

        if !matches!(phase, PanelPhase::Running | PanelPhase::Paused) {
            return;
        }

        let stuck_for = state.boundary.elapsed();
        let limit = max_discussion * 2;
        if stuck_for > limit {
            log::warn!(
                "panel session '{}' stuck in {} for {:?} (limit {:?}); force-stopping",
                panel.session_id(),
                phase,
                stuck_for,
                limit
            );
            let panel = panel.clone();
            // Fire and forget; the next scan observes the phase change.
            tokio::spawn(async move {
                panel.stop().await;
            });
            state.boundary = Instant::now();
        }
    }

    /// Stop the watcher task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
