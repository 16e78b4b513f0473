//! The contract between the adaptor library and repository integrations.
//!
//! A repository integration implements [`Adaptor`]; the library drives it
//! from two directions. The push pipeline calls [`Adaptor::get_doc_ids`]
//! with a [`DocIdPusher`] and the adaptor feeds record batches through it.
//! The HTTP surface calls [`Adaptor::get_doc_content`] and
//! [`Adaptor::is_user_authorized`] to answer appliance requests.
//!
//! Optional capabilities are probed rather than inherited: an adaptor that
//! wants incremental polling returns itself from [`Adaptor::incremental`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::acl::Acl;
use crate::docid::{DocId, DocIdCodec};
use crate::error::AdaptorError;
use crate::metadata::Metadata;
use crate::record::{DocIdRecord, NamedResource};

/// Authorization decision for one (identity, document) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzStatus {
    /// The identity may see the document.
    Permit,
    /// The identity may not see the document.
    Deny,
    /// The adaptor could not decide. Treated as deny when serving content.
    Indeterminate,
}

/// An authenticated end user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub groups: std::collections::BTreeSet<String>,
    /// Only present when the identity provider forwards it.
    pub password: Option<String>,
}

impl Principal {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            groups: Default::default(),
            password: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }
}

/// One content request from the appliance, as seen by the adaptor.
#[derive(Debug, Clone)]
pub struct DocRequest {
    doc_id: DocId,
    /// Parsed `If-Modified-Since`, when the client sent one.
    last_access: Option<DateTime<Utc>>,
}

impl DocRequest {
    pub fn new(doc_id: DocId, last_access: Option<DateTime<Utc>>) -> Self {
        Self {
            doc_id,
            last_access,
        }
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.last_access
    }

    /// Whether the document changed since the client last saw it.
    ///
    /// Returns `false` only when `last_modified` is known and not strictly
    /// after the client's `If-Modified-Since` instant. Absent either
    /// timestamp, the document counts as changed.
    pub fn has_changed_since_last_access(&self, last_modified: Option<DateTime<Utc>>) -> bool {
        match (self.last_access, last_modified) {
            (Some(since), Some(modified)) => modified > since,
            _ => true,
        }
    }
}

/// Content produced by the adaptor for one document.
#[derive(Debug, Clone, Default)]
pub struct DocContent {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub acl: Option<Acl>,
}

impl DocContent {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_last_modified(mut self, instant: DateTime<Utc>) -> Self {
        self.last_modified = Some(instant);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = Some(acl);
        self
    }
}

/// Outcome of [`Adaptor::get_doc_content`].
///
/// The wire handler maps variants to HTTP codes: `Content` → 200,
/// `NotFound` → 404, `NotModified` → 304.
#[derive(Debug, Clone)]
pub enum DocResponse {
    Content(DocContent),
    NotFound,
    NotModified,
}

/// Classification of a failed feed delivery handed to the error handler.
#[derive(Debug)]
pub struct PushFailure {
    /// True for network hiccups and 5xx answers; false once retried out
    /// or on 4xx / malformed responses.
    pub transient: bool,
    pub message: String,
}

/// What the push pipeline should do after a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushFailurePolicy {
    /// Send the same batch again.
    Retry,
    /// Give up on the whole push; the first failed record is surfaced.
    AbortPush,
    /// Drop this batch and continue with the next one.
    SkipBatch,
}

/// Caller-supplied policy consulted after every failed feed delivery.
pub trait PushErrorHandler: Send + Sync {
    /// `attempts` counts deliveries already tried for this batch,
    /// including the one that just failed.
    fn on_push_failure(&self, failure: &PushFailure, attempts: usize) -> PushFailurePolicy;
}

/// Stock policy: retry a transient failure a few times, then abort.
/// Permanent failures abort immediately.
#[derive(Debug, Default)]
pub struct DefaultPushErrorHandler;

impl DefaultPushErrorHandler {
    const MAX_ATTEMPTS: usize = 3;
}

impl PushErrorHandler for DefaultPushErrorHandler {
    fn on_push_failure(&self, failure: &PushFailure, attempts: usize) -> PushFailurePolicy {
        if failure.transient && attempts < Self::MAX_ATTEMPTS {
            PushFailurePolicy::Retry
        } else {
            PushFailurePolicy::AbortPush
        }
    }
}

/// Shared, swappable error-handler slot.
///
/// The controller reads it before each scheduled push; adaptors may
/// replace it through [`AdaptorContext::set_push_error_handler`].
pub type PushErrorHandlerSlot = Arc<RwLock<Arc<dyn PushErrorHandler>>>;

/// Creates a handler slot holding the stock policy.
pub fn default_error_handler_slot() -> PushErrorHandlerSlot {
    Arc::new(RwLock::new(Arc::new(DefaultPushErrorHandler)))
}

/// Accepts record batches from the adaptor and delivers them in order.
#[async_trait]
pub trait DocIdPusher: Send + Sync {
    /// Sends one batch as a single feed. Records are never split across
    /// feeds and arrive at the appliance in input order.
    ///
    /// Returns the first record that could not be delivered, so the
    /// adaptor can resume from it, or `None` on full success.
    async fn push_records(
        &self,
        records: Vec<DocIdRecord>,
    ) -> Result<Option<DocIdRecord>, AdaptorError>;

    /// Convenience wrapper for plain identifiers.
    async fn push_doc_ids(&self, doc_ids: Vec<DocId>) -> Result<Option<DocId>, AdaptorError> {
        let records = doc_ids.into_iter().map(DocIdRecord::new).collect();
        Ok(self
            .push_records(records)
            .await?
            .map(|record| record.doc_id().clone()))
    }

    /// Sends ACL-only entries as a single feed.
    async fn push_named_resources(
        &self,
        resources: Vec<NamedResource>,
    ) -> Result<Option<DocId>, AdaptorError>;
}

/// Handed to [`Adaptor::init`]; carries the library services an adaptor
/// may hold on to. Config is not here: ownership of configuration is
/// passed explicitly at adaptor construction.
#[derive(Clone)]
pub struct AdaptorContext {
    pusher: Arc<dyn DocIdPusher>,
    codec: Arc<DocIdCodec>,
    error_handler: PushErrorHandlerSlot,
}

impl AdaptorContext {
    pub fn new(
        pusher: Arc<dyn DocIdPusher>,
        codec: Arc<DocIdCodec>,
        error_handler: PushErrorHandlerSlot,
    ) -> Self {
        Self {
            pusher,
            codec,
            error_handler,
        }
    }

    /// The pusher used for out-of-band pushes between scheduled runs.
    pub fn doc_id_pusher(&self) -> Arc<dyn DocIdPusher> {
        Arc::clone(&self.pusher)
    }

    /// The codec mapping identifiers to crawlable URLs.
    pub fn doc_id_encoder(&self) -> Arc<DocIdCodec> {
        Arc::clone(&self.codec)
    }

    /// Replaces the policy consulted when scheduled pushes fail.
    pub fn set_push_error_handler(&self, handler: Arc<dyn PushErrorHandler>) {
        *self.error_handler.write().expect("handler slot poisoned") = handler;
    }

    /// The currently installed push error handler.
    pub fn push_error_handler(&self) -> Arc<dyn PushErrorHandler> {
        Arc::clone(&self.error_handler.read().expect("handler slot poisoned"))
    }
}

/// Incremental-change hook, probed via [`Adaptor::incremental`].
#[async_trait]
pub trait PollingIncrementalAdaptor: Send + Sync {
    /// Pushes changes observed since the previous poll.
    async fn poll_incremental(&self, pusher: &dyn DocIdPusher) -> Result<(), AdaptorError>;
}

/// A repository integration.
///
/// `get_doc_ids` and `get_doc_content` are the two mandatory halves:
/// enumeration for the feed pipeline and retrieval for the appliance's
/// crawler. Everything else has a usable default.
#[async_trait]
pub trait Adaptor: Send + Sync + 'static {
    /// Called once by the controller before any traffic. Failures abort
    /// startup.
    async fn init(&self, context: &AdaptorContext) -> Result<(), AdaptorError> {
        let _ = context;
        Ok(())
    }

    /// Called once during controller shutdown, after traffic has stopped.
    async fn destroy(&self) {}

    /// Pushes all document identifiers through `pusher`. May call
    /// [`DocIdPusher::push_records`] any number of times; each call forms
    /// an independent feed.
    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<(), AdaptorError>;

    /// Produces the content of one document, or reports it missing or
    /// unchanged.
    async fn get_doc_content(&self, request: &DocRequest) -> Result<DocResponse, AdaptorError>;

    /// Batch authorization. `identity` is `None` for the anonymous probe.
    ///
    /// The default permits everything, which is correct for adaptors
    /// serving public content.
    async fn is_user_authorized(
        &self,
        identity: Option<&Principal>,
        ids: &[DocId],
    ) -> Result<HashMap<DocId, AuthzStatus>, AdaptorError> {
        let _ = identity;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), AuthzStatus::Permit))
            .collect())
    }

    /// Returns the incremental hook when this adaptor supports polling.
    fn incremental(&self) -> Option<&dyn PollingIncrementalAdaptor> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unchanged_when_not_after_last_access() {
        let since = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        let request = DocRequest::new(DocId::new("d"), Some(since));

        let older = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert!(!request.has_changed_since_last_access(Some(older)));
        assert!(!request.has_changed_since_last_access(Some(since)));

        let newer = Utc.with_ymd_and_hms(2020, 1, 3, 0, 0, 0).unwrap();
        assert!(request.has_changed_since_last_access(Some(newer)));
    }

    #[test]
    fn changed_when_either_timestamp_missing() {
        let since = Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap();
        assert!(DocRequest::new(DocId::new("d"), Some(since))
            .has_changed_since_last_access(None));
        assert!(DocRequest::new(DocId::new("d"), None)
            .has_changed_since_last_access(Some(since)));
    }

    #[test]
    fn default_handler_retries_transient_then_aborts() {
        let handler = DefaultPushErrorHandler;
        let transient = PushFailure {
            transient: true,
            message: "connection reset".into(),
        };
        assert_eq!(
            handler.on_push_failure(&transient, 1),
            PushFailurePolicy::Retry
        );
        assert_eq!(
            handler.on_push_failure(&transient, 3),
            PushFailurePolicy::AbortPush
        );

        let permanent = PushFailure {
            transient: false,
            message: "400 bad request".into(),
        };
        assert_eq!(
            handler.on_push_failure(&permanent, 1),
            PushFailurePolicy::AbortPush
        );
    }

    #[test]
    fn context_swaps_error_handler() {
        struct SkipAll;
        impl PushErrorHandler for SkipAll {
            fn on_push_failure(&self, _: &PushFailure, _: usize) -> PushFailurePolicy {
                PushFailurePolicy::SkipBatch
            }
        }

        struct NoopPusher;
        #[async_trait]
        impl DocIdPusher for NoopPusher {
            async fn push_records(
                &self,
                _: Vec<DocIdRecord>,
            ) -> Result<Option<DocIdRecord>, AdaptorError> {
                Ok(None)
            }
            async fn push_named_resources(
                &self,
                _: Vec<NamedResource>,
            ) -> Result<Option<DocId>, AdaptorError> {
                Ok(None)
            }
        }

        let context = AdaptorContext::new(
            Arc::new(NoopPusher),
            Arc::new(DocIdCodec::new("http://h:1", "/doc/")),
            default_error_handler_slot(),
        );
        let failure = PushFailure {
            transient: true,
            message: "x".into(),
        };
        assert_eq!(
            context.push_error_handler().on_push_failure(&failure, 1),
            PushFailurePolicy::Retry
        );
        context.set_push_error_handler(Arc::new(SkipAll));
        assert_eq!(
            context.push_error_handler().on_push_failure(&failure, 1),
            PushFailurePolicy::SkipBatch
        );
    }
}
