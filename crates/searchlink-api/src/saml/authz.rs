//! Batched authorization decisions for the appliance.
//!
//! The appliance posts a SOAP batch of `AuthzDecisionQuery` elements;
//! each maps back to a document id through the codec and the adaptor is
//! asked once per subject with that subject's whole batch. Unknown
//! resources and adaptor faults answer `Indeterminate`. Response order
//! equals query order.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::warn;

use searchlink_core::{AuthzStatus, DocId, Principal};

use crate::http::state::AppState;

use super::message::{compose_authz_response, parse_authz_queries, AuthzQuery};

/// `POST /saml-authz`
pub async fn batch_authz(State(state): State<Arc<AppState>>, body: String) -> Response {
    let Some(provider) = &state.saml else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let queries = match parse_authz_queries(body.as_bytes()) {
        Ok(queries) => queries,
        Err(err) => {
            warn!(%err, "unparseable authorization batch");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let decisions = decide(&state, queries).await;
    match compose_authz_response(&provider.metadata, &decisions, Utc::now()) {
        Ok(xml) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
            xml,
        )
            .into_response(),
        Err(err) => {
            warn!(%err, "failed to compose authorization response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn decide(state: &AppState, queries: Vec<AuthzQuery>) -> Vec<(AuthzQuery, AuthzStatus)> {
    let mut decisions = vec![AuthzStatus::Indeterminate; queries.len()];

    // One adaptor call per subject, carrying that subject's whole batch.
    let mut by_subject: BTreeMap<String, Vec<(usize, DocId)>> = BTreeMap::new();
    for (index, query) in queries.iter().enumerate() {
        let Some(subject) = query.subject.as_ref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let Some(doc_id) = resource_doc_id(state, &query.resource) else {
            // Unknown resource; the decision stays Indeterminate.
            continue;
        };
        by_subject
            .entry(subject.clone())
            .or_default()
            .push((index, doc_id));
    }

    for (subject, entries) in by_subject {
        let principal = Principal::new(subject);
        let ids: Vec<DocId> = entries.iter().map(|(_, id)| id.clone()).collect();
        match state.adaptor.is_user_authorized(Some(&principal), &ids).await {
            Ok(results) => {
                for (index, doc_id) in entries {
                    decisions[index] = results
                        .get(&doc_id)
                        .copied()
                        .unwrap_or(AuthzStatus::Indeterminate);
                }
            }
            Err(err) => {
                warn!(user = %principal.username, %err, "adaptor failed to authorize batch");
            }
        }
    }

    queries.into_iter().zip(decisions).collect()
}

fn resource_doc_id(state: &AppState, resource: &str) -> Option<DocId> {
    state.codec.decode(url_path(resource)?).ok()
}

/// The path component of an absolute URL.
fn url_path(url: &str) -> Option<&str> {
    let after_scheme = url.split_once("://")?.1;
    after_scheme.find('/').map(|slash| &after_scheme[slash..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_path_extracts_path() {
        assert_eq!(
            url_path("http://adaptor:5678/doc/hello%2Fthere"),
            Some("/doc/hello%2Fthere")
        );
        assert_eq!(url_path("https://h/doc/x"), Some("/doc/x"));
        assert_eq!(url_path("not a url"), None);
        assert_eq!(url_path("http://hostonly"), None);
    }
}
