//! searchlink-core: domain model for the adaptor library
//!
//! This crate holds the types shared by every other searchlink crate:
//! - Document identifiers and the URL codec
//! - Feed records, named resources, ACLs and metadata
//! - The `Adaptor` trait family that repository integrations implement
//! - The telemetry journal read by the status surface
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              searchlink-core                 │
//! ├─────────────────────────────────────────────┤
//! │  docid.rs    - DocId and the URL codec      │
//! │  record.rs   - DocIdRecord, NamedResource   │
//! │  acl.rs      - Acl and inheritance rules    │
//! │  metadata.rs - repository metadata pairs    │
//! │  adaptor.rs  - Adaptor trait + contracts    │
//! │  journal.rs  - concurrent telemetry         │
//! │  error.rs    - shared error taxonomy        │
//! └─────────────────────────────────────────────┘
//! ```

pub mod acl;
pub mod adaptor;
pub mod docid;
pub mod error;
pub mod journal;
pub mod metadata;
pub mod record;

// Re-export commonly used types
pub use acl::{Acl, InheritanceRule};
pub use adaptor::{
    default_error_handler_slot, Adaptor, AdaptorContext, AuthzStatus, DefaultPushErrorHandler,
    DocContent, DocIdPusher, DocRequest, DocResponse, PollingIncrementalAdaptor, Principal,
    PushErrorHandler, PushErrorHandlerSlot, PushFailure, PushFailurePolicy,
};
pub use docid::{percent_encode, DocId, DocIdCodec};
pub use error::{AdaptorError, MalformedIdError};
pub use journal::{Journal, JournalSnapshot};
pub use metadata::Metadata;
pub use record::{DocIdRecord, NamedResource};
