//! Cron-expression-driven periodic task glue.
//!
//! The contract is narrow: register a 5-field pattern with a task, get an
//! id back; reschedule or cancel by id. Rescheduling replaces the firing
//! time of the existing registration, never duplicates it, and an invalid
//! pattern leaves the previous schedule in effect.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Scheduling errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("unknown schedule id")]
    UnknownId,
}

/// Parses a 5-field cron pattern (minute hour day-of-month month
/// day-of-week).
pub fn parse_pattern(pattern: &str) -> Result<Schedule, ScheduleError> {
    if pattern.split_whitespace().count() != 5 {
        return Err(ScheduleError::InvalidPattern {
            pattern: pattern.to_string(),
            message: "expected 5 fields: minute hour day-of-month month day-of-week".to_string(),
        });
    }
    // The evaluator wants a seconds field; scheduled work fires on the minute.
    Schedule::from_str(&format!("0 {pattern}")).map_err(|e| ScheduleError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

/// Identifier of one registered schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(u64);

struct Job {
    pattern_tx: watch::Sender<Schedule>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Fires registered tasks on their cron schedules.
///
/// Tasks are synchronous closures expected to return quickly; long work
/// belongs behind a gate or spawned task.
pub struct CronScheduler {
    next_id: AtomicU64,
    jobs: DashMap<u64, Job>,
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: DashMap::new(),
        }
    }

    /// Registers `task` to fire per `pattern`.
    pub fn register(
        &self,
        pattern: &str,
        task: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<ScheduleId, ScheduleError> {
        let schedule = parse_pattern(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (pattern_tx, pattern_rx) = watch::channel(schedule);
        let handle = tokio::spawn(run_schedule(pattern_rx, task));
        self.jobs.insert(id, Job { pattern_tx, handle });
        debug!(schedule_id = id, pattern, "registered schedule");
        Ok(ScheduleId(id))
    }

    /// Moves an existing registration to a new pattern.
    ///
    /// # Errors
    ///
    /// On an invalid pattern the previous schedule stays in effect.
    pub fn reschedule(&self, id: ScheduleId, pattern: &str) -> Result<(), ScheduleError> {
        let schedule = parse_pattern(pattern)?;
        let job = self.jobs.get(&id.0).ok_or(ScheduleError::UnknownId)?;
        let _ = job.pattern_tx.send(schedule);
        debug!(schedule_id = id.0, pattern, "rescheduled");
        Ok(())
    }

    /// Cancels one registration.
    pub fn cancel(&self, id: ScheduleId) {
        // Dropping the sender wakes the waiting loop, which exits.
        self.jobs.remove(&id.0);
    }

    /// Cancels every registration.
    pub fn stop(&self) {
        self.jobs.clear();
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

async fn run_schedule(mut pattern_rx: watch::Receiver<Schedule>, task: Arc<dyn Fn() + Send + Sync>) {
    loop {
        let schedule = pattern_rx.borrow_and_update().clone();
        let now = Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            // Pattern never fires again; park until a reschedule.
            if pattern_rx.changed().await.is_err() {
                return;
            }
            continue;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => task(),
            changed = pattern_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
