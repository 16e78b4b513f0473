//! Lifecycle of the whole adaptor service.
//!
//! `start` binds the listener, wires the feed pipeline, initializes the
//! adaptor, and brings up the schedules; `stop` unwinds the same in
//! reverse with a bounded grace period. The two are mutually exclusive
//! per instance and `start` on a started controller fails.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use searchlink_core::{
    default_error_handler_slot, Adaptor, AdaptorContext, AdaptorError, DocIdCodec, DocIdPusher,
    Journal,
};
use searchlink_feed::{DocIdSender, FeedComposer, FeedError, FeedSender};
use searchlink_server::{
    AdaptorConfig, ConfigHandle, CronScheduler, ExclusiveTask, IncrementalPoller, ScheduleError,
    SessionManager,
};

use crate::http::{create_router, AllowedSources, AppState};
use crate::saml::{self, metadata::SamlMetadata, ChannelTrustVerifier, SamlProvider};

/// Grace the process shutdown path grants in-flight work.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Startup failures. Each aborts `start` and leaves the controller
/// stopped; nothing here can kill a controller that already started.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller already started")]
    AlreadyStarted,

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("adaptor initialization failed: {0}")]
    AdaptorInit(#[source] AdaptorError),

    #[error("feed pipeline setup failed: {0}")]
    Feed(#[source] FeedError),

    #[error("failed to register the push schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: tokio::task::JoinHandle<()>,
    scheduler: Arc<CronScheduler>,
    push_gate: Arc<ExclusiveTask>,
    poller: Option<IncrementalPoller>,
}

/// Wires together the listener, the push pipeline, the scheduler, and
/// the adaptor's lifecycle.
pub struct Controller {
    adaptor: Arc<dyn Adaptor>,
    config: Arc<ConfigHandle>,
    journal: Arc<Journal>,
    running: Mutex<Option<Running>>,
}

impl Controller {
    pub fn new(adaptor: Arc<dyn Adaptor>, config: AdaptorConfig) -> Self {
        Self {
            adaptor,
            config: Arc::new(ConfigHandle::new(config)),
            journal: Arc::new(Journal::new()),
            running: Mutex::new(None),
        }
    }

    /// The live configuration handle. Installing a new snapshot here is
    /// how operators change the push schedule at runtime.
    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// The bound address, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|run| run.local_addr)
    }

    /// Starts listening for appliance traffic and scheduling pushes.
    ///
    /// # Errors
    ///
    /// [`ControllerError::AlreadyStarted`] on a second call; any other
    /// failure (bind, adaptor init, bad schedule) aborts startup.
    pub async fn start(&self) -> Result<SocketAddr, ControllerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ControllerError::AlreadyStarted);
        }

        let config = self.config.snapshot();

        // Bind first so a taken port fails before anything else exists.
        let listener = TcpListener::bind(("0.0.0.0", config.server.port)).await?;
        let local_addr = listener.local_addr()?;
        if config.server.port == 0 {
            // The OS picked the port; publish it so cookie names and
            // encoded URLs agree with reality.
            let mut updated = (*config).clone();
            updated.server.port = local_addr.port();
            self.config.install(updated);
        }
        let config = self.config.snapshot();
        let port = config.server.port;
        let secure = config.server.secure;

        if secure {
            // One-time process-wide init; later controllers share it.
            saml::bootstrap();
        }

        let scheme = if secure { "https" } else { "http" };
        let codec = Arc::new(DocIdCodec::new(
            format!("{scheme}://{}:{port}", config.server.hostname),
            config.server.doc_id_path.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            format!("sessid_{port}"),
            secure,
            Duration::from_secs(config.session.ttl_secs),
            Duration::from_secs(config.session.max_cleanup_interval_secs),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let composer = FeedComposer::new(config.feed.name.clone(), Arc::clone(&codec));
        let feed_sender =
            FeedSender::new(&config.gsa.hostname, secure).map_err(ControllerError::Feed)?;
        let error_handler = default_error_handler_slot();
        let docid_sender = Arc::new(DocIdSender::new(
            composer,
            feed_sender,
            Arc::clone(&self.journal),
            Arc::clone(&self.adaptor),
            Arc::clone(&error_handler),
            shutdown_rx,
        ));

        // The adaptor sees the library through this context; its failure
        // aborts startup.
        let context = AdaptorContext::new(
            Arc::clone(&docid_sender) as Arc<dyn DocIdPusher>,
            Arc::clone(&codec),
            Arc::clone(&error_handler),
        );
        self.adaptor
            .init(&context)
            .await
            .map_err(ControllerError::AdaptorInit)?;

        let saml_provider = secure.then(|| {
            Arc::new(SamlProvider::new(
                SamlMetadata::new(&config.server.hostname, port, true, &config.gsa.hostname),
                Arc::new(ChannelTrustVerifier),
            ))
        });

        let allowed = Arc::new(AllowedSources::new(
            self.resolve_allowed_sources(&config).await,
        ));

        let state = AppState {
            adaptor: Arc::clone(&self.adaptor),
            codec,
            journal: Arc::clone(&self.journal),
            sessions,
            saml: saml_provider,
            allowed,
        };
        let router = create_router(state);
        let mut graceful_rx = shutdown_tx.subscribe();
        let server_task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            let serve = axum::serve(listener, service).with_graceful_shutdown(async move {
                let _ = graceful_rx.wait_for(|stop| *stop).await;
            });
            if let Err(error) = serve.await {
                error!(%error, "listener failed");
            }
        });
        info!(%local_addr, gsa = %config.gsa.hostname, "listening for appliance requests");

        // The full push runs behind the gate so overlapping firings
        // collapse into one run plus a log line.
        let pusher_for_gate = Arc::clone(&docid_sender);
        let handler_slot = Arc::clone(&error_handler);
        let push_gate = Arc::new(ExclusiveTask::new(
            move |mut stop| {
                let pusher = Arc::clone(&pusher_for_gate);
                let handler =
                    Arc::clone(&handler_slot.read().expect("handler slot poisoned"));
                Box::pin(async move {
                    let push = async {
                        match pusher.push_doc_ids_from_adaptor(handler).await {
                            Ok(None) => info!("full push completed"),
                            Ok(Some(record)) => {
                                warn!(first_failed = %record.doc_id(), "full push incomplete")
                            }
                            Err(AdaptorError::Interrupted) => info!("full push interrupted"),
                            Err(error) => warn!(%error, "full push failed"),
                        }
                    };
                    tokio::select! {
                        _ = push => {}
                        _ = stop.wait_for(|stopping| *stopping) => {
                            info!("full push abandoned during stop");
                        }
                    }
                })
            },
            || {
                warn!(
                    "Skipping scheduled push of document ids; the previous invocation \
                     is still running"
                )
            },
        ));

        let scheduler = Arc::new(CronScheduler::new());
        let gate_for_schedule = Arc::clone(&push_gate);
        let schedule_id = scheduler.register(
            &config.adaptor.full_listing_schedule,
            Arc::new(move || gate_for_schedule.fire()),
        )?;

        // Operators change the cadence by installing new config; an
        // invalid pattern keeps the previous schedule.
        let scheduler_for_listener = Arc::clone(&scheduler);
        self.config.subscribe(move |event| {
            if !event.modified_keys.contains("adaptor.full_listing_schedule") {
                return;
            }
            let pattern = event.new_config.adaptor.full_listing_schedule.clone();
            if let Err(error) = scheduler_for_listener.reschedule(schedule_id, &pattern) {
                warn!(%error, "invalid schedule pattern; keeping the previous schedule");
            }
        });

        let poller = self.adaptor.incremental().is_some().then(|| {
            let adaptor = Arc::clone(&self.adaptor);
            let pusher = Arc::clone(&docid_sender);
            IncrementalPoller::start(
                Duration::from_secs(config.adaptor.incremental_poll_period_secs),
                Arc::new(move || {
                    let adaptor = Arc::clone(&adaptor);
                    let pusher = Arc::clone(&pusher);
                    Box::pin(async move {
                        match adaptor.incremental() {
                            Some(hook) => hook.poll_incremental(pusher.as_ref()).await,
                            None => Ok(()),
                        }
                    })
                }),
            )
        });

        *running = Some(Running {
            local_addr,
            shutdown_tx,
            server_task,
            scheduler,
            push_gate,
            poller,
        });
        Ok(local_addr)
    }

    /// Stops everything, granting in-flight work up to `max_delay`.
    /// A stopped (or never started) controller is a no-op; `start` may
    /// be called again afterwards.
    pub async fn stop(&self, max_delay: Duration) {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return;
        };

        // Interrupt pushes before stopping the scheduler so nothing
        // blocks on a retry backoff, then drain the listener.
        let _ = run.shutdown_tx.send(true);
        if !run.push_gate.stop(max_delay).await {
            warn!("push did not stop within the grace period");
        }
        run.scheduler.stop();
        if let Some(poller) = &run.poller {
            poller.cancel();
        }

        let abort = run.server_task.abort_handle();
        if tokio::time::timeout(max_delay, run.server_task).await.is_err() {
            warn!("listener did not drain within the grace period");
            abort.abort();
        }

        self.adaptor.destroy().await;
        info!("controller stopped");
    }

    /// Starts a full push right now unless one is already running.
    /// Returns whether a new push was started.
    pub async fn check_and_schedule_immediate_push(&self) -> bool {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|run| run.push_gate.try_spawn())
            .unwrap_or(false)
    }

    async fn resolve_allowed_sources(&self, config: &AdaptorConfig) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = config
            .server
            .gsa_ips
            .iter()
            .filter_map(|raw| match raw.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(address = %raw, "ignoring unparseable allow-list entry");
                    None
                }
            })
            .collect();
        match tokio::net::lookup_host((config.gsa.hostname.as_str(), 80)).await {
            Ok(resolved) => ips.extend(resolved.map(|addr| addr.ip())),
            Err(error) => {
                warn!(host = %config.gsa.hostname, %error, "could not resolve appliance hostname");
            }
        }
        ips
    }
}
