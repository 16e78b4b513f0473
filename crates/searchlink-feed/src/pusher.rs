//! Collects record batches from the adaptor and drives them through the
//! composer and sender.
//!
//! Each `push_records` call from the adaptor becomes exactly one feed;
//! records from one call are never split and never reordered. Failed
//! deliveries consult the caller-supplied error handler, which decides
//! between retrying the batch, skipping it, and aborting the whole push.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use searchlink_core::{
    Adaptor, AdaptorError, DocId, DocIdRecord, Journal, NamedResource, PushErrorHandler,
    PushErrorHandlerSlot, PushFailure, PushFailurePolicy,
};

use crate::composer::{FeedComposer, FeedType};
use crate::error::FeedError;
use crate::sender::FeedSender;

/// Pause between handler-requested retries of a whole batch. The sender
/// already backs off between its own attempts; this spaces out full
/// retry rounds.
const DEFAULT_BATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

enum BatchOutcome {
    Sent,
    Skipped,
    Aborted,
}

/// The push pipeline's entry point.
///
/// Implements [`searchlink_core::DocIdPusher`] so adaptors can push
/// out-of-band batches through their context; those feeds go out as
/// incremental. Scheduled full listings go through
/// [`push_doc_ids_from_adaptor`](Self::push_doc_ids_from_adaptor) and go
/// out as full-replace.
pub struct DocIdSender {
    composer: FeedComposer,
    sender: FeedSender,
    journal: Arc<Journal>,
    adaptor: Arc<dyn Adaptor>,
    error_handler: PushErrorHandlerSlot,
    shutdown: watch::Receiver<bool>,
    batch_retry_delay: Duration,
}

impl DocIdSender {
    pub fn new(
        composer: FeedComposer,
        sender: FeedSender,
        journal: Arc<Journal>,
        adaptor: Arc<dyn Adaptor>,
        error_handler: PushErrorHandlerSlot,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            composer,
            sender,
            journal,
            adaptor,
            error_handler,
            shutdown,
            batch_retry_delay: DEFAULT_BATCH_RETRY_DELAY,
        }
    }

    pub fn with_batch_retry_delay(mut self, delay: Duration) -> Self {
        self.batch_retry_delay = delay;
        self
    }

    /// Runs the adaptor's full listing, sending every batch it pushes as
    /// a full-replace feed.
    ///
    /// Returns the first record that could not be delivered so the caller
    /// can resume from it, or `None` when every batch went through. On
    /// full success the journal's last-full-push clock is stamped.
    pub async fn push_doc_ids_from_adaptor(
        &self,
        handler: Arc<dyn PushErrorHandler>,
    ) -> Result<Option<DocIdRecord>, AdaptorError> {
        let scoped = ScopedPusher {
            inner: self,
            feed_type: FeedType::FullReplace,
            handler,
            first_failed: Mutex::new(None),
            aborted: AtomicBool::new(false),
        };
        self.adaptor.get_doc_ids(&scoped).await?;
        let first_failed = scoped.first_failed.lock().expect("pusher lock poisoned").take();
        if first_failed.is_none() {
            self.journal.record_full_push_finished(Utc::now());
            info!("full document-id push completed");
        }
        Ok(first_failed)
    }

    /// Sends one feed of ACL-only entries.
    pub async fn push_named_resources(
        &self,
        resources: Vec<NamedResource>,
        handler: Arc<dyn PushErrorHandler>,
    ) -> Result<Option<DocId>, AdaptorError> {
        if resources.is_empty() {
            return Ok(None);
        }
        let xml = self
            .composer
            .compose_named_resources(&resources)
            .map_err(|e| AdaptorError::fault(e.to_string()))?;
        match self
            .deliver(FeedType::Incremental, xml, resources.len() as u64, handler.as_ref())
            .await?
        {
            BatchOutcome::Sent => Ok(None),
            BatchOutcome::Skipped | BatchOutcome::Aborted => {
                Ok(Some(resources[0].doc_id.clone()))
            }
        }
    }

    fn current_handler(&self) -> Arc<dyn PushErrorHandler> {
        Arc::clone(&self.error_handler.read().expect("handler slot poisoned"))
    }

    /// Sends one already-composed feed, consulting `handler` on failure.
    async fn deliver(
        &self,
        feed_type: FeedType,
        xml: String,
        record_count: u64,
        handler: &dyn PushErrorHandler,
    ) -> Result<BatchOutcome, AdaptorError> {
        let mut shutdown = self.shutdown.clone();
        let mut attempts = 0usize;
        loop {
            if *shutdown.borrow() {
                return Err(AdaptorError::Interrupted);
            }
            let started = Instant::now();
            match self
                .sender
                .send(self.composer.datasource(), feed_type, &xml, &shutdown)
                .await
            {
                Ok(()) => {
                    self.journal.record_push_succeeded();
                    self.journal.record_records_pushed(record_count);
                    self.journal.record_latency(started.elapsed());
                    return Ok(BatchOutcome::Sent);
                }
                Err(FeedError::Interrupted) => return Err(AdaptorError::Interrupted),
                Err(err) => {
                    attempts += 1;
                    let transient = err.is_transient();
                    if transient {
                        self.journal.record_transient_failure();
                    } else {
                        self.journal.record_permanent_failure();
                    }
                    let failure = PushFailure {
                        transient,
                        message: err.to_string(),
                    };
                    match handler.on_push_failure(&failure, attempts) {
                        PushFailurePolicy::Retry => {
                            warn!(attempts, error = %failure.message, "retrying batch");
                            tokio::select! {
                                _ = tokio::time::sleep(self.batch_retry_delay) => {}
                                _ = shutdown.wait_for(|stop| *stop) => {
                                    return Err(AdaptorError::Interrupted);
                                }
                            }
                        }
                        PushFailurePolicy::SkipBatch => {
                            warn!(attempts, error = %failure.message, "skipping batch");
                            return Ok(BatchOutcome::Skipped);
                        }
                        PushFailurePolicy::AbortPush => {
                            warn!(attempts, error = %failure.message, "aborting push");
                            return Ok(BatchOutcome::Aborted);
                        }
                    }
                }
            }
        }
    }

    async fn push_batch(
        &self,
        feed_type: FeedType,
        records: &[DocIdRecord],
        handler: &dyn PushErrorHandler,
    ) -> Result<BatchOutcome, AdaptorError> {
        let xml = self
            .composer
            .compose_records(feed_type, records)
            .map_err(|e| AdaptorError::fault(e.to_string()))?;
        self.deliver(feed_type, xml, records.len() as u64, handler)
            .await
    }
}

/// Out-of-band pushes through the adaptor context; feeds go out as
/// incremental and failures consult the installed handler slot.
#[async_trait]
impl searchlink_core::DocIdPusher for DocIdSender {
    async fn push_records(
        &self,
        records: Vec<DocIdRecord>,
    ) -> Result<Option<DocIdRecord>, AdaptorError> {
        if records.is_empty() {
            return Ok(None);
        }
        let handler = self.current_handler();
        match self
            .push_batch(FeedType::Incremental, &records, handler.as_ref())
            .await?
        {
            BatchOutcome::Sent => Ok(None),
            BatchOutcome::Skipped | BatchOutcome::Aborted => Ok(Some(records[0].clone())),
        }
    }

    async fn push_named_resources(
        &self,
        resources: Vec<NamedResource>,
    ) -> Result<Option<DocId>, AdaptorError> {
        let handler = self.current_handler();
        DocIdSender::push_named_resources(self, resources, handler).await
    }
}

/// Pusher handed to `Adaptor::get_doc_ids` for the scheduled full
/// listing. Tracks the first failed record across batches and refuses
/// further batches once a handler chose to abort.
struct ScopedPusher<'a> {
    inner: &'a DocIdSender,
    feed_type: FeedType,
    handler: Arc<dyn PushErrorHandler>,
    first_failed: Mutex<Option<DocIdRecord>>,
    aborted: AtomicBool,
}

impl ScopedPusher<'_> {
    fn note_failure(&self, record: &DocIdRecord) {
        let mut slot = self.first_failed.lock().expect("pusher lock poisoned");
        if slot.is_none() {
            *slot = Some(record.clone());
        }
    }
}

#[async_trait]
impl searchlink_core::DocIdPusher for ScopedPusher<'_> {
    async fn push_records(
        &self,
        records: Vec<DocIdRecord>,
    ) -> Result<Option<DocIdRecord>, AdaptorError> {
        if records.is_empty() {
            return Ok(None);
        }
        if self.aborted.load(Ordering::Acquire) {
            self.note_failure(&records[0]);
            return Ok(Some(records[0].clone()));
        }
        match self
            .inner
            .push_batch(self.feed_type, &records, self.handler.as_ref())
            .await?
        {
            BatchOutcome::Sent => Ok(None),
            BatchOutcome::Skipped => {
                self.note_failure(&records[0]);
                Ok(Some(records[0].clone()))
            }
            BatchOutcome::Aborted => {
                self.aborted.store(true, Ordering::Release);
                self.note_failure(&records[0]);
                Ok(Some(records[0].clone()))
            }
        }
    }

    async fn push_named_resources(
        &self,
        resources: Vec<NamedResource>,
    ) -> Result<Option<DocId>, AdaptorError> {
        if resources.is_empty() {
            return Ok(None);
        }
        if self.aborted.load(Ordering::Acquire) {
            return Ok(Some(resources[0].doc_id.clone()));
        }
        self.inner
            .push_named_resources(resources, Arc::clone(&self.handler))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use searchlink_core::{
        default_error_handler_slot, Acl, DocIdCodec, DocIdPusher as _, DocResponse,
    };
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Adaptor that pushes fixed batches when asked for its listing.
    struct ListingAdaptor {
        batches: Vec<Vec<DocIdRecord>>,
    }

    #[async_trait]
    impl Adaptor for ListingAdaptor {
        async fn get_doc_ids(
            &self,
            pusher: &dyn searchlink_core::DocIdPusher,
        ) -> Result<(), AdaptorError> {
            for batch in &self.batches {
                pusher.push_records(batch.clone()).await?;
            }
            Ok(())
        }

        async fn get_doc_content(
            &self,
            _: &searchlink_core::DocRequest,
        ) -> Result<DocResponse, AdaptorError> {
            Ok(DocResponse::NotFound)
        }
    }

    fn records(ids: &[&str]) -> Vec<DocIdRecord> {
        ids.iter().map(|id| DocIdRecord::new(DocId::new(*id))).collect()
    }

    async fn sender_for(server: &MockServer, adaptor: Arc<dyn Adaptor>) -> DocIdSender {
        let codec = Arc::new(DocIdCodec::new("http://adaptor:5678", "/doc/"));
        let composer = FeedComposer::new("unit-source", codec);
        let feed_sender = FeedSender::with_endpoint(format!("{}/xmlfeed", server.uri()))
            .unwrap()
            .with_retry_policy(crate::sender::RetryPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                backoff_factor: 2,
                max_backoff: Duration::from_millis(1),
            });
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        DocIdSender::new(
            composer,
            feed_sender,
            Arc::new(Journal::new()),
            adaptor,
            default_error_handler_slot(),
            rx,
        )
        .with_batch_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn one_call_becomes_one_ordered_full_replace_feed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Success"))
            .expect(1)
            .mount(&server)
            .await;

        let adaptor = Arc::new(ListingAdaptor {
            batches: vec![records(&["A", "B", "C"])],
        });
        let sender = sender_for(&server, adaptor).await;
        let failed = sender
            .push_doc_ids_from_adaptor(Arc::new(searchlink_core::adaptor::DefaultPushErrorHandler))
            .await
            .unwrap();
        assert!(failed.is_none());

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("full-replace"), "{body}");
        let a = body.find("/doc/A").unwrap();
        let b = body.find("/doc/B").unwrap();
        let c = body.find("/doc/C").unwrap();
        assert!(a < b && b < c, "records reordered: {body}");
    }

    #[tokio::test]
    async fn separate_calls_become_independent_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Success"))
            .expect(2)
            .mount(&server)
            .await;

        let adaptor = Arc::new(ListingAdaptor {
            batches: vec![records(&["A"]), records(&["B"])],
        });
        let sender = sender_for(&server, adaptor).await;
        let failed = sender
            .push_doc_ids_from_adaptor(Arc::new(searchlink_core::adaptor::DefaultPushErrorHandler))
            .await
            .unwrap();
        assert!(failed.is_none());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn permanent_rejection_aborts_and_surfaces_first_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let adaptor = Arc::new(ListingAdaptor {
            batches: vec![records(&["A", "B"]), records(&["C"])],
        });
        let sender = sender_for(&server, adaptor).await;
        let journal = Arc::clone(&sender.journal);
        let failed = sender
            .push_doc_ids_from_adaptor(Arc::new(searchlink_core::adaptor::DefaultPushErrorHandler))
            .await
            .unwrap();
        // The push aborted on the first batch; the second batch was never sent.
        assert_eq!(failed.unwrap().doc_id(), &DocId::new("A"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        let snap = journal.snapshot();
        assert_eq!(snap.failures_permanent, 1);
        assert!(snap.last_full_push.is_none());
    }

    #[tokio::test]
    async fn skip_policy_drops_batch_and_continues() {
        struct SkipAll;
        impl PushErrorHandler for SkipAll {
            fn on_push_failure(&self, _: &PushFailure, _: usize) -> PushFailurePolicy {
                PushFailurePolicy::SkipBatch
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Success"))
            .mount(&server)
            .await;

        let adaptor = Arc::new(ListingAdaptor {
            batches: vec![records(&["A"]), records(&["B"])],
        });
        let sender = sender_for(&server, adaptor).await;
        let failed = sender
            .push_doc_ids_from_adaptor(Arc::new(SkipAll))
            .await
            .unwrap();
        // First batch skipped and surfaced for resume, second delivered.
        assert_eq!(failed.unwrap().doc_id(), &DocId::new("A"));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn named_resources_go_out_as_one_incremental_feed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Success"))
            .expect(1)
            .mount(&server)
            .await;

        let adaptor = Arc::new(ListingAdaptor { batches: vec![] });
        let sender = sender_for(&server, adaptor).await;
        let resources = vec![
            NamedResource::new(DocId::new("root"), Acl::new().permit_group("eng")),
            NamedResource::new(DocId::new("leaf"), Acl::new().permit_user("alice")),
        ];
        let failed = sender
            .push_named_resources(
                resources,
                Arc::new(searchlink_core::adaptor::DefaultPushErrorHandler),
            )
            .await
            .unwrap();
        assert!(failed.is_none());

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("incremental"), "{body}");
        let root = body.find("/doc/root").unwrap();
        let leaf = body.find("/doc/leaf").unwrap();
        assert!(root < leaf);
        assert!(body.contains("principal"));
    }

    #[tokio::test]
    async fn context_pushes_use_incremental_feed_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Success"))
            .expect(1)
            .mount(&server)
            .await;

        let adaptor = Arc::new(ListingAdaptor { batches: vec![] });
        let sender = sender_for(&server, adaptor).await;
        sender.push_records(records(&["X"])).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("incremental"), "{body}");
    }
}
