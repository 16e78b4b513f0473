//! Adaptor service binary with a built-in template adaptor.
//!
//! The template serves a tiny in-memory document set and stamps each
//! response with crawl-time metadata; it exists so a configured appliance
//! can be pointed at something real before a repository integration is
//! written.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! searchlink --config searchlink.yaml
//!
//! # With environment variables only
//! SEARCHLINK_GSA__HOSTNAME=gsa.example.com searchlink
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::info;

use searchlink_api::controller::{Controller, SHUTDOWN_GRACE};
use searchlink_api::observability::{init_logging, LoggingConfig};
use searchlink_core::{
    Adaptor, AdaptorError, DocContent, DocId, DocIdPusher, DocIdRecord, DocRequest, DocResponse,
    Metadata,
};
use searchlink_server::AdaptorConfig;

/// Searchlink - repository adaptor for an enterprise search appliance
#[derive(Parser, Debug)]
#[command(name = "searchlink")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

/// Template adaptor: a fixed in-memory document set.
struct TemplateAdaptor {
    docs: HashMap<DocId, &'static str>,
}

impl TemplateAdaptor {
    fn new() -> Self {
        let mut docs = HashMap::new();
        docs.insert(DocId::new("1001"), "Document 1001 says hello and world");
        docs.insert(DocId::new("1002"), "Document 1002 says hello and goodbye");
        Self { docs }
    }
}

#[async_trait]
impl Adaptor for TemplateAdaptor {
    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<(), AdaptorError> {
        let mut records: Vec<DocIdRecord> = self
            .docs
            .keys()
            .cloned()
            .map(DocIdRecord::new)
            .collect();
        records.sort_by(|a, b| a.doc_id().cmp(b.doc_id()));
        pusher.push_records(records).await?;
        Ok(())
    }

    async fn get_doc_content(&self, request: &DocRequest) -> Result<DocResponse, AdaptorError> {
        let Some(body) = self.docs.get(request.doc_id()) else {
            return Ok(DocResponse::NotFound);
        };
        let metadata = Metadata::new()
            .with("crawled-at", Utc::now().to_rfc3339())
            .with("source", "template");
        Ok(DocResponse::Content(
            DocContent::new(body.as_bytes())
                .with_content_type("text/plain")
                .with_metadata(metadata),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if let Some(path) = args.config {
        AdaptorConfig::load(&path)?
    } else {
        AdaptorConfig::from_env()?
    };

    init_logging(&LoggingConfig::from_settings(&config.logging));
    info!(version = env!("CARGO_PKG_VERSION"), "starting searchlink");

    let controller = Controller::new(Arc::new(TemplateAdaptor::new()), config);
    let addr = controller.start().await?;
    info!(%addr, "adaptor is up");

    shutdown_signal().await;
    controller.stop(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}
