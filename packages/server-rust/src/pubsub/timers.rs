//! Periodic flush and purge tasks for one engine.
//!
//! Each timer is a tokio task that skips the interval's immediate first tick,
//! then runs its job on every tick until the engine is dropped or the timers
//! are stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::engine::PubSubPersistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Flush,
    Purge,
}

impl TimerKind {
    fn name(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Purge => "purge",
        }
    }

    async fn run(self, engine: &PubSubPersistence) {
        match self {
            Self::Flush => {
                // Each member runs its own timer, so the flush stays local.
                if let Err(e) = engine.flush_pending_items_with(false).await {
                    warn!(error = %e, "periodic flush failed");
                }
            }
            Self::Purge => {
                if let Err(e) = engine.purge_expired_items().await {
                    warn!(error = %e, "periodic purge failed");
                }
            }
        }
    }
}

/// Handles to the running timer tasks of one engine.
pub struct PubSubTimers {
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PubSubTimers {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _rx) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the timers for `engine`. Returns `false` if already started.
    ///
    /// The flush timer only runs when `max_items_flush > 0`.
    pub fn start(&self, engine: &Arc<PubSubPersistence>) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let config = engine.config();
        let mut handles = self.handles.lock();
        if config.flush_timer_enabled() {
            handles.push(self.spawn(TimerKind::Flush, config.effective_flush_interval(), engine));
        }
        handles.push(self.spawn(TimerKind::Purge, config.effective_purge_interval(), engine));
        info!(
            flush = config.flush_timer_enabled(),
            flush_interval_secs = config.effective_flush_interval().as_secs(),
            purge_interval_secs = config.effective_purge_interval().as_secs(),
            "pub-sub timers started"
        );
        true
    }

    fn spawn(
        &self,
        kind: TimerKind,
        period: Duration,
        engine: &Arc<PubSubPersistence>,
    ) -> JoinHandle<()> {
        let engine: Weak<PubSubPersistence> = Arc::downgrade(engine);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        debug!(timer = kind.name(), "timer fired");
                        kind.run(&engine).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(timer = kind.name(), "timer stopped");
        })
    }

    /// Number of timer tasks spawned and not yet stopped.
    #[must_use]
    pub fn active(&self) -> usize {
        self.handles.lock().len()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Signals every timer to stop and waits for them to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for PubSubTimers {
    fn default() -> Self {
        Self::new()
    }
}
