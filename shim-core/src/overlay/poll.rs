use super::engine::OverlayEngine;
use crate::config::OverlayConfig;
use crate::host::GlobalScope;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub attempts: u32,
    pub attached: usize,
    pub loader_patched: bool,
}

/// Handle to the polling fallback task.
pub struct PollHandle {
    attempts: Arc<AtomicU32>,
    task: JoinHandle<PollReport>,
}

impl PollHandle {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the budget to run out. `None` if the task was aborted.
    pub async fn finished(self) -> Option<PollReport> {
        self.task.await.ok()
    }
}

/// Retry the loader patch and sweep for maps every interval, up to the budget.
///
/// The first attempt happens one interval after the call; attempts continue
/// after a successful attachment since new maps may still appear.
pub fn start_polling(
    engine: Arc<OverlayEngine>,
    globals: Arc<dyn GlobalScope>,
    config: &OverlayConfig,
) -> PollHandle {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let period = config.poll_interval();
    let budget = config.max_attempts;

    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = PollReport::default();

        while report.attempts < budget {
            ticker.tick().await;
            report.attempts += 1;
            counter.store(report.attempts, Ordering::SeqCst);

            let sweep = engine.tick(globals.as_ref());
            report.attached += sweep.attached;
            debug!(
                "Overlay poll {}/{}: {} maps, {} attached",
                report.attempts, budget, sweep.maps_seen, sweep.attached
            );
        }

        report.loader_patched = engine.loader_patched();
        info!(
            "Overlay polling finished after {} attempts ({} attachments)",
            report.attempts, report.attached
        );
        report
    });

    PollHandle { attempts, task }
}
