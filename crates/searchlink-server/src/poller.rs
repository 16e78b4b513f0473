//! Periodic invocation of the adaptor's incremental hook.
//!
//! Fires every `period`; a tick that lands while the previous poll is
//! still running is skipped and logged. Poll errors are swallowed and
//! logged, they never reach the timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use searchlink_core::AdaptorError;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::gate::ResetGuard;

/// Factory producing one poll execution per firing.
pub type PollFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), AdaptorError>> + Send + Sync>;

/// Timer-driven incremental poller.
pub struct IncrementalPoller {
    handle: JoinHandle<()>,
}

impl IncrementalPoller {
    /// Starts polling; the first firing happens one full period from now.
    pub fn start(period: Duration, poll: PollFn) -> Self {
        let handle = tokio::spawn(run(period, poll));
        Self { handle }
    }

    /// Stops the timer. A poll already in flight finishes on its own.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

async fn run(period: Duration, poll: PollFn) {
    let running = Arc::new(AtomicBool::new(false));
    let start = tokio::time::Instant::now() + period;
    let mut ticks = tokio::time::interval_at(start, period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        if running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("skipping incremental poll; the previous one is still running");
            continue;
        }
        let guard = ResetGuard(Arc::clone(&running));
        let future = poll();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(error) = future.await {
                warn!(%error, "incremental poll failed");
            }
        });
    }
}
