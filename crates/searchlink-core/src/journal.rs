//! In-memory telemetry shared across the library.
//!
//! Written from the push pipeline and the HTTP handlers on every request;
//! read by the status surface. Counters are plain atomics. The latency
//! histogram stripes its buckets so concurrent writers on different
//! threads do not contend on one cache line.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Upper bounds (milliseconds) of the latency buckets; the last bucket is
/// unbounded.
const BUCKET_BOUNDS_MS: [u64; 10] = [1, 5, 10, 25, 50, 100, 250, 1000, 5000, 30_000];

const STRIPES: usize = 8;

#[derive(Debug)]
struct Stripe {
    buckets: [AtomicU64; BUCKET_BOUNDS_MS.len() + 1],
}

impl Stripe {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
        }
    }
}

/// Concurrent telemetry journal.
#[derive(Debug)]
pub struct Journal {
    records_pushed: AtomicU64,
    pushes_succeeded: AtomicU64,
    failures_transient: AtomicU64,
    failures_permanent: AtomicU64,
    requests_served: AtomicU64,
    /// Millis since epoch of the last completed full push; 0 when none.
    last_full_push_millis: AtomicI64,
    stripes: Vec<Stripe>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        Self {
            records_pushed: AtomicU64::new(0),
            pushes_succeeded: AtomicU64::new(0),
            failures_transient: AtomicU64::new(0),
            failures_permanent: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            last_full_push_millis: AtomicI64::new(0),
            stripes: (0..STRIPES).map(|_| Stripe::new()).collect(),
        }
    }

    pub fn record_records_pushed(&self, count: u64) {
        self.records_pushed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_push_succeeded(&self) {
        self.pushes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_failure(&self) {
        self.failures_transient.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.failures_permanent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Stamps the wall clock of a completed full push.
    pub fn record_full_push_finished(&self, at: DateTime<Utc>) {
        self.last_full_push_millis
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Records one document's processing latency.
    pub fn record_latency(&self, elapsed: Duration) {
        let stripe = &self.stripes[stripe_index()];
        let millis = elapsed.as_millis().min(u128::from(u64::MAX)) as u64;
        let bucket = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        stripe.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough point-in-time view for the status surface.
    pub fn snapshot(&self) -> JournalSnapshot {
        let mut latency_buckets = vec![0u64; BUCKET_BOUNDS_MS.len() + 1];
        for stripe in &self.stripes {
            for (total, bucket) in latency_buckets.iter_mut().zip(stripe.buckets.iter()) {
                *total += bucket.load(Ordering::Relaxed);
            }
        }
        let last_millis = self.last_full_push_millis.load(Ordering::Relaxed);
        JournalSnapshot {
            records_pushed: self.records_pushed.load(Ordering::Relaxed),
            pushes_succeeded: self.pushes_succeeded.load(Ordering::Relaxed),
            failures_transient: self.failures_transient.load(Ordering::Relaxed),
            failures_permanent: self.failures_permanent.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            last_full_push: (last_millis != 0)
                .then(|| Utc.timestamp_millis_opt(last_millis).single())
                .flatten(),
            latency_bucket_bounds_ms: BUCKET_BOUNDS_MS.to_vec(),
            latency_buckets,
        }
    }
}

/// Picks a stripe from the current thread so writers spread out.
fn stripe_index() -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() as usize) % STRIPES
}

/// Serializable view of the journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalSnapshot {
    pub records_pushed: u64,
    pub pushes_succeeded: u64,
    pub failures_transient: u64,
    pub failures_permanent: u64,
    pub requests_served: u64,
    pub last_full_push: Option<DateTime<Utc>>,
    pub latency_bucket_bounds_ms: Vec<u64>,
    /// One count per bound plus a final unbounded bucket.
    pub latency_buckets: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let journal = Journal::new();
        journal.record_records_pushed(3);
        journal.record_records_pushed(2);
        journal.record_push_succeeded();
        journal.record_transient_failure();
        let snap = journal.snapshot();
        assert_eq!(snap.records_pushed, 5);
        assert_eq!(snap.pushes_succeeded, 1);
        assert_eq!(snap.failures_transient, 1);
        assert_eq!(snap.failures_permanent, 0);
    }

    #[test]
    fn latency_lands_in_expected_bucket() {
        let journal = Journal::new();
        journal.record_latency(Duration::from_millis(3));
        journal.record_latency(Duration::from_secs(60));
        let snap = journal.snapshot();
        // 3 ms falls in the `<= 5` bucket (index 1), 60 s in the unbounded tail.
        assert_eq!(snap.latency_buckets[1], 1);
        assert_eq!(snap.latency_buckets[BUCKET_BOUNDS_MS.len()], 1);
        assert_eq!(snap.latency_buckets.iter().sum::<u64>(), 2);
    }

    #[test]
    fn last_full_push_roundtrips() {
        let journal = Journal::new();
        assert!(journal.snapshot().last_full_push.is_none());
        let now = Utc::now();
        journal.record_full_push_finished(now);
        let recorded = journal.snapshot().last_full_push.unwrap();
        assert_eq!(recorded.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn writes_from_many_threads_sum() {
        let journal = std::sync::Arc::new(Journal::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let journal = std::sync::Arc::clone(&journal);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    journal.record_latency(Duration::from_millis(2));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(journal.snapshot().latency_buckets.iter().sum::<u64>(), 400);
    }
}
