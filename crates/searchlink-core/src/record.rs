//! Feed records pushed from the adaptor to the appliance.

use chrono::{DateTime, Utc};

use crate::acl::Acl;
use crate::docid::DocId;

/// One entry in a document-id feed.
///
/// Only the identifier is mandatory; everything else is a hint the
/// appliance may use when crawling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocIdRecord {
    doc_id: DocId,
    last_modified: Option<DateTime<Utc>>,
    delete: bool,
    crawl_immediately: bool,
    lock: bool,
    result_link: Option<String>,
}

impl DocIdRecord {
    pub fn new(doc_id: DocId) -> Self {
        Self {
            doc_id,
            last_modified: None,
            delete: false,
            crawl_immediately: false,
            lock: false,
            result_link: None,
        }
    }

    pub fn with_last_modified(mut self, instant: DateTime<Utc>) -> Self {
        self.last_modified = Some(instant);
        self
    }

    /// Marks the document as removed from the repository.
    pub fn with_delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Asks the appliance to crawl this document ahead of its usual queue.
    pub fn with_crawl_immediately(mut self) -> Self {
        self.crawl_immediately = true;
        self
    }

    /// Protects the document from eviction when the license limit is hit.
    pub fn with_lock(mut self) -> Self {
        self.lock = true;
        self
    }

    /// Overrides the URL shown in search results.
    pub fn with_result_link(mut self, url: impl Into<String>) -> Self {
        self.result_link = Some(url.into());
        self
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn is_delete(&self) -> bool {
        self.delete
    }

    pub fn crawl_immediately(&self) -> bool {
        self.crawl_immediately
    }

    pub fn lock(&self) -> bool {
        self.lock
    }

    pub fn result_link(&self) -> Option<&str> {
        self.result_link.as_deref()
    }
}

impl From<DocId> for DocIdRecord {
    fn from(doc_id: DocId) -> Self {
        Self::new(doc_id)
    }
}

/// A document identifier carrying only an ACL, pushed to propagate
/// inheritance roots independent of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedResource {
    pub doc_id: DocId,
    pub acl: Acl,
}

impl NamedResource {
    pub fn new(doc_id: DocId, acl: Acl) -> Self {
        Self { doc_id, acl }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_defaults_are_plain() {
        let record = DocIdRecord::new(DocId::new("x"));
        assert!(!record.is_delete());
        assert!(!record.crawl_immediately());
        assert!(!record.lock());
        assert!(record.last_modified().is_none());
        assert!(record.result_link().is_none());
    }

    #[test]
    fn builder_sets_hints() {
        let record = DocIdRecord::new(DocId::new("x"))
            .with_delete()
            .with_crawl_immediately()
            .with_result_link("http://display/x");
        assert!(record.is_delete());
        assert!(record.crawl_immediately());
        assert_eq!(record.result_link(), Some("http://display/x"));
    }
}
