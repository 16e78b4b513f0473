//! Router assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{extract::State, response::IntoResponse, Json, Router};
use tower_http::limit::RequestBodyLimitLayer;

use super::document;
use super::state::AppState;
use crate::saml;

/// Default request body size limit (1MB). Assertion and authorization
/// batches are far smaller; anything bigger is garbage.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Creates the router with every endpoint this state supports.
///
/// The SAML endpoints exist only when the provider is configured, which
/// tracks `server.secure`.
pub fn create_router(state: AppState) -> Router {
    let doc_route = format!("{}*doc_id", state.codec.doc_path());
    let shared = Arc::new(state);

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route(&doc_route, get(document::serve_document));
    if shared.saml.is_some() {
        router = router
            .route(
                "/samlassertionconsumer",
                post(saml::authn::assertion_consumer),
            )
            .route("/saml-authz", post(saml::authz::batch_authz));
    }
    router
        .with_state(shared)
        .layer(RequestBodyLimitLayer::new(DEFAULT_BODY_LIMIT))
}

/// Liveness probe; checks nothing downstream.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Journal snapshot for operators.
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.journal.snapshot())
}
