//! At-most-one-concurrent-run wrapper around a long task.
//!
//! Protects the appliance from overlapping full pushes when a schedule
//! fires before the previous run finished: the extra firing runs the
//! fallback (log and drop) instead of a second primary.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type PrimaryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type PrimaryFn = dyn Fn(watch::Receiver<bool>) -> PrimaryFuture + Send + Sync;
type FallbackFn = dyn Fn() + Send + Sync;

/// Clears a flag however the owning future exits, including panics.
pub(crate) struct ResetGuard(pub(crate) Arc<AtomicBool>);

impl Drop for ResetGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Wraps a primary task so at most one execution runs at any time.
///
/// The primary receives a stop signal it must poll at its suspension
/// points; [`stop`](Self::stop) flips the signal and waits, it never
/// kills the task.
pub struct ExclusiveTask {
    primary: Arc<PrimaryFn>,
    fallback: Arc<FallbackFn>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl ExclusiveTask {
    pub fn new(
        primary: impl Fn(watch::Receiver<bool>) -> PrimaryFuture + Send + Sync + 'static,
        fallback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            primary: Arc::new(primary),
            fallback: Arc::new(fallback),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            stop_tx,
            current: Mutex::new(None),
        }
    }

    /// Runs the primary in a new task, or the fallback when a primary is
    /// already running. This is what scheduled firings call.
    pub fn fire(&self) {
        if !self.try_spawn() {
            (self.fallback)();
        }
    }

    /// Starts the primary in a new task. Returns false when one was
    /// already running (the fallback is NOT invoked) or the gate has been
    /// stopped.
    pub fn try_spawn(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            info!("task gate is stopped; not starting");
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let guard = ResetGuard(Arc::clone(&self.running));
        let future = (self.primary)(self.stop_tx.subscribe());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });
        *self.current.lock().expect("gate lock poisoned") = Some(handle);
        true
    }

    /// True while a primary execution is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the running primary to stop and waits up to `max_delay`
    /// for it to exit. Returns true when it exited in time (or none was
    /// running). Further starts are refused.
    pub async fn stop(&self, max_delay: Duration) -> bool {
        self.stopped.store(true, Ordering::Release);
        let _ = self.stop_tx.send(true);
        let handle = self.current.lock().expect("gate lock poisoned").take();
        match handle {
            None => true,
            Some(handle) => match tokio::time::timeout(max_delay, handle).await {
                Ok(_) => true,
                Err(_) => {
                    warn!("primary task did not stop within {:?}", max_delay);
                    false
                }
            },
        }
    }
}
