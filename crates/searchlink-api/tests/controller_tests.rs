//! End-to-end controller tests: real listener, real feed POSTs against a
//! mock appliance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use searchlink_api::controller::{Controller, ControllerError};
use searchlink_core::{
    Adaptor, AdaptorError, DocContent, DocId, DocIdPusher, DocIdRecord, DocRequest, DocResponse,
};
use searchlink_server::AdaptorConfig;

/// Adaptor serving a fixed map, with a configurable listing delay so
/// tests can hold the push gate open.
struct FixtureAdaptor {
    docs: HashMap<DocId, &'static str>,
    listing_delay: Duration,
}

impl FixtureAdaptor {
    fn new() -> Self {
        let mut docs = HashMap::new();
        docs.insert(DocId::new("hello"), "world");
        Self {
            docs,
            listing_delay: Duration::ZERO,
        }
    }

    fn with_listing_delay(mut self, delay: Duration) -> Self {
        self.listing_delay = delay;
        self
    }
}

#[async_trait]
impl Adaptor for FixtureAdaptor {
    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<(), AdaptorError> {
        if !self.listing_delay.is_zero() {
            tokio::time::sleep(self.listing_delay).await;
        }
        let mut records: Vec<DocIdRecord> =
            self.docs.keys().cloned().map(DocIdRecord::new).collect();
        records.sort_by(|a, b| a.doc_id().cmp(b.doc_id()));
        pusher.push_records(records).await?;
        Ok(())
    }

    async fn get_doc_content(&self, request: &DocRequest) -> Result<DocResponse, AdaptorError> {
        match self.docs.get(request.doc_id()) {
            Some(body) => Ok(DocResponse::Content(
                DocContent::new(body.as_bytes()).with_content_type("text/plain"),
            )),
            None => Ok(DocResponse::NotFound),
        }
    }
}

fn config_for(appliance: &MockServer) -> AdaptorConfig {
    let mut config = AdaptorConfig::default();
    config.server.port = 0;
    config.server.hostname = "127.0.0.1".to_string();
    // A non-loopback allow-list entry: loopback test clients must still
    // be admitted alongside it.
    config.server.gsa_ips = vec!["10.1.2.3".to_string()];
    // host:port of the mock appliance; feeds go to http://<this>/xmlfeed
    config.gsa.hostname = appliance.uri().trim_start_matches("http://").to_string();
    config
}

#[tokio::test]
async fn serves_documents_and_guards_double_start() {
    let appliance = MockServer::start().await;
    let controller = Controller::new(
        Arc::new(FixtureAdaptor::new()),
        config_for(&appliance),
    );

    let addr = controller.start().await.unwrap();
    assert!(matches!(
        controller.start().await,
        Err(ControllerError::AlreadyStarted)
    ));

    let base = format!("http://127.0.0.1:{}", addr.port());
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .get(format!("{base}/doc/hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "world");

    let response = client
        .get(format!("{base}/doc/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    controller.stop(Duration::from_secs(1)).await;

    // The listener is gone: no new requests are accepted.
    assert!(client.get(format!("{base}/health")).send().await.is_err());

    // A stopped controller may start again.
    let addr = controller.start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", addr.port());
    let response = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    controller.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn immediate_push_feeds_the_appliance_once() {
    let appliance = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Success"))
        .mount(&appliance)
        .await;

    let adaptor = FixtureAdaptor::new().with_listing_delay(Duration::from_millis(300));
    let controller = Controller::new(Arc::new(adaptor), config_for(&appliance));
    controller.start().await.unwrap();

    // First call starts a push; the overlap is refused while it runs.
    assert!(controller.check_and_schedule_immediate_push().await);
    assert!(!controller.check_and_schedule_immediate_push().await);

    tokio::time::sleep(Duration::from_secs(1)).await;

    let requests = appliance.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "expected exactly one feed POST");
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("/doc/hello"), "{body}");
    assert!(body.contains("full-replace"), "{body}");

    let snapshot = controller.journal().snapshot();
    assert_eq!(snapshot.pushes_succeeded, 1);
    assert_eq!(snapshot.records_pushed, 1);
    assert!(snapshot.last_full_push.is_some());

    controller.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stop_interrupts_a_push_stuck_in_retry() {
    let appliance = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&appliance)
        .await;

    let controller = Controller::new(
        Arc::new(FixtureAdaptor::new()),
        config_for(&appliance),
    );
    controller.start().await.unwrap();

    assert!(controller.check_and_schedule_immediate_push().await);
    // Give the push time to fail once and enter its backoff sleep.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    controller.stop(Duration::from_secs(2)).await;
    assert!(
        started.elapsed() < Duration::from_secs(4),
        "stop took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn runtime_schedule_changes_are_tolerated() {
    let appliance = MockServer::start().await;
    let controller = Controller::new(
        Arc::new(FixtureAdaptor::new()),
        config_for(&appliance),
    );
    let addr = controller.start().await.unwrap();

    // A valid change reschedules; a broken one is logged and ignored.
    for schedule in ["15 4 * * *", "this is not a schedule", "30 5 * * *"] {
        let mut next = (*controller.config().snapshot()).clone();
        next.adaptor.full_listing_schedule = schedule.to_string();
        controller.config().install(next);
    }

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/health", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    controller.stop(Duration::from_secs(1)).await;
}
