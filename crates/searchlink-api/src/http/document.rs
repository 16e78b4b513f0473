//! The document content endpoint.
//!
//! Per-request state machine:
//!
//! ```text
//! RECV → DECODE → AUTHZ → INVOKE-ADAPTOR → EMIT
//!                 ↓ deny → 403
//!   DECODE fail → 404
//! ```
//!
//! Metadata and ACL headers come from the adaptor's response value, so
//! they are always settled before the first body byte goes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use searchlink_core::{
    percent_encode, Acl, AuthzStatus, DocContent, DocId, DocRequest, DocResponse, Principal,
};

use crate::saml;

use super::state::AppState;

const EXTERNAL_METADATA: HeaderName = HeaderName::from_static("x-gsa-external-metadata");
const EXTERNAL_ACL: HeaderName = HeaderName::from_static("x-gsa-external-acl");
const SERVE_SECURITY: HeaderName = HeaderName::from_static("x-gsa-serve-security");

pub async fn serve_document(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();

    // DECODE
    let doc_id = match state.codec.decode(uri.path()) {
        Ok(doc_id) => doc_id,
        Err(err) => {
            debug!(path = uri.path(), %err, "request for unmappable path");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    // AUTHZ: the anonymous probe decides the security class.
    let public = match authz_status(&state, None, &doc_id).await {
        Ok(status) => status == AuthzStatus::Permit,
        Err(response) => return *response,
    };

    if !public {
        let cookie = cookie_header(&headers);
        let principal = state
            .sessions
            .get_session(cookie.as_deref(), false)
            .and_then(|handle| handle.session.get::<Principal>(saml::PRINCIPAL_SLOT));
        let principal = match principal {
            Some(principal) => principal,
            None => {
                // No authenticated identity yet; hand the user-agent to
                // the appliance's identity provider.
                let Some(provider) = &state.saml else {
                    warn!(doc_id = %doc_id, "secure document requested but SAML is not configured");
                    return StatusCode::FORBIDDEN.into_response();
                };
                let original_url = format!("{}{}", state.codec.base_uri(), uri.path());
                return provider.start_authentication(&state.sessions, cookie.as_deref(), &original_url);
            }
        };
        match authz_status(&state, Some(&principal), &doc_id).await {
            Ok(AuthzStatus::Permit) => {}
            Ok(_) => {
                debug!(doc_id = %doc_id, user = %principal.username, "access denied");
                return StatusCode::FORBIDDEN.into_response();
            }
            Err(response) => return *response,
        }
    }

    // Content flows only to the appliance and other allow-listed sources.
    match connect_info {
        Some(ConnectInfo(peer)) => {
            if !state.allowed.allows(peer.ip()) {
                warn!(peer = %peer, "content request from unlisted source");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
        // Only in-process callers carry no peer address; the listener
        // always stamps one on real connections.
        None => debug!(doc_id = %doc_id, "request carries no peer address; source check skipped"),
    }

    // INVOKE-ADAPTOR
    let request = DocRequest::new(doc_id.clone(), if_modified_since(&headers));
    let response = match state.adaptor.get_doc_content(&request).await {
        Ok(response) => response,
        Err(err) => {
            error!(doc_id = %doc_id, %err, "adaptor failed to produce content");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // EMIT
    let response = match response {
        DocResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
        DocResponse::NotModified => StatusCode::NOT_MODIFIED.into_response(),
        DocResponse::Content(content) => emit_content(&state, content, public),
    };

    state.journal.record_request_served();
    state.journal.record_latency(started.elapsed());
    response
}

/// Runs one single-document authorization batch, mapping adaptor faults
/// to a logged 500.
async fn authz_status(
    state: &AppState,
    identity: Option<&Principal>,
    doc_id: &DocId,
) -> Result<AuthzStatus, Box<Response>> {
    match state
        .adaptor
        .is_user_authorized(identity, std::slice::from_ref(doc_id))
        .await
    {
        Ok(decisions) => Ok(decisions
            .get(doc_id)
            .copied()
            .unwrap_or(AuthzStatus::Indeterminate)),
        Err(err) => {
            error!(doc_id = %doc_id, %err, "adaptor failed to authorize");
            Err(Box::new(StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
    }
}

fn emit_content(state: &AppState, content: DocContent, public: bool) -> Response {
    let mut headers = HeaderMap::new();

    headers.insert(
        axum::http::header::CONTENT_TYPE,
        header_value(
            content
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream"),
        ),
    );
    if let Some(modified) = content.last_modified {
        headers.insert(axum::http::header::LAST_MODIFIED, header_value(&rfc1123(modified)));
    }
    if !content.metadata.is_empty() {
        let encoded = content
            .metadata
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(",");
        headers.insert(EXTERNAL_METADATA, header_value(&encoded));
    }
    let secure = content.acl.is_some() || !public;
    headers.insert(
        SERVE_SECURITY,
        header_value(if secure { "secure" } else { "public" }),
    );
    if let Some(acl) = &content.acl {
        headers.insert(EXTERNAL_ACL, header_value(&encode_acl(state, acl)));
    }

    (StatusCode::OK, headers, content.body).into_response()
}

/// Percent-encoded `key=value` pairs describing the ACL, one comma-joined
/// header value.
fn encode_acl(state: &AppState, acl: &Acl) -> String {
    let mut pairs = Vec::new();
    let mut push_set = |key: &str, values: &std::collections::BTreeSet<String>| {
        for value in values {
            pairs.push(format!("{key}={}", percent_encode(value)));
        }
    };
    push_set("aclusers", acl.permitted_users());
    push_set("acldenyusers", acl.denied_users());
    push_set("aclgroups", acl.permitted_groups());
    push_set("acldenygroups", acl.denied_groups());
    if let Some(parent) = acl.parent() {
        pairs.push(format!(
            "aclinheritfrom={}",
            percent_encode(&state.codec.encode(parent))
        ));
    }
    pairs.push(format!(
        "aclinheritancetype={}",
        acl.inheritance().as_wire_str()
    ));
    pairs.join(",")
}

fn cookie_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn if_modified_since(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers
        .get(axum::http::header::IF_MODIFIED_SINCE)?
        .to_str()
        .ok()?;
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

fn rfc1123(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}
