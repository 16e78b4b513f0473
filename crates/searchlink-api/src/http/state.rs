//! Application state shared across the HTTP handlers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use searchlink_core::{Adaptor, DocIdCodec, Journal};
use searchlink_server::SessionManager;

use crate::saml::SamlProvider;

/// Source addresses allowed to fetch document content.
///
/// Holds the explicitly configured appliance addresses plus whatever the
/// appliance hostname resolved to at startup. Loopback is always allowed
/// so local smoke tests and the simulator work without configuration.
#[derive(Debug, Clone, Default)]
pub struct AllowedSources {
    ips: HashSet<IpAddr>,
}

impl AllowedSources {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            ips: ips.into_iter().collect(),
        }
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || self.ips.contains(&ip)
    }
}

/// Dependencies every HTTP handler draws on.
#[derive(Clone)]
pub struct AppState {
    /// The repository integration.
    pub adaptor: Arc<dyn Adaptor>,
    /// Identifier/URL codec.
    pub codec: Arc<DocIdCodec>,
    /// Shared telemetry.
    pub journal: Arc<Journal>,
    /// Cookie-bound per-client state.
    pub sessions: Arc<SessionManager>,
    /// SAML machinery; present only when the server is secure.
    pub saml: Option<Arc<SamlProvider>>,
    /// Content-fetch source allow-list.
    pub allowed: Arc<AllowedSources>,
}
