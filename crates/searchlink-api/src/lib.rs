//! searchlink-api: the HTTP surface and lifecycle of the adaptor service
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                searchlink-api                     │
//! ├──────────────────────────────────────────────────┤
//! │  controller.rs  - start/stop lifecycle            │
//! │  http/          - router, document handler        │
//! │  saml/          - authn + batch authz handlers    │
//! │  observability/ - logging init                    │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Inbound endpoints:
//! - `GET <docIdPath><encodedDocId>`: document content
//! - `POST /samlassertionconsumer`: SAML assertion consumer (secure mode)
//! - `POST /saml-authz`: batched authorization decisions (secure mode)
//! - `GET /health`, `GET /status`: liveness and journal snapshot

pub mod controller;
pub mod http;
pub mod observability;
pub mod saml;

pub use controller::{Controller, ControllerError};
pub use http::{create_router, AppState};
