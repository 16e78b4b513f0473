//! Configuration for the adaptor service.
//!
//! Settings load from a YAML file with `SEARCHLINK_`-prefixed environment
//! overrides (`__` separates nested keys, so `SEARCHLINK_SERVER__PORT=0`
//! overrides `server.port`). The on-disk loader/watcher lives outside this
//! library; whoever reloads the file hands the new tree to
//! [`ConfigHandle::install`], which swaps the snapshot atomically and
//! notifies subscribers serially, in write order.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::schedule;

/// Full settings tree for one adaptor process.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AdaptorConfig {
    /// This server's listener and identity.
    #[serde(default)]
    pub server: ServerSettings,

    /// The appliance this adaptor feeds.
    #[serde(default)]
    pub gsa: GsaSettings,

    /// Feed naming.
    #[serde(default)]
    pub feed: FeedSettings,

    /// Push cadence.
    #[serde(default)]
    pub adaptor: AdaptorSettings,

    /// End-user session lifetimes.
    #[serde(default)]
    pub session: SessionSettings,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener and identity settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Port to listen on; 0 asks the OS for an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Hostname the appliance reaches this adaptor under.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Whether the outside of this service speaks HTTPS. Drives cookie
    /// Secure flags, external URL schemes, and SAML enablement.
    #[serde(default)]
    pub secure: bool,

    /// Alias of the signing key used for SAML messages.
    #[serde(default = "default_key_alias")]
    pub key_alias: String,

    /// Path prefix under which documents are served.
    #[serde(default = "default_doc_id_path")]
    pub doc_id_path: String,

    /// Additional source addresses allowed to fetch documents.
    #[serde(default)]
    pub gsa_ips: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
            secure: false,
            key_alias: default_key_alias(),
            doc_id_path: default_doc_id_path(),
            gsa_ips: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    5678
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_key_alias() -> String {
    "adaptor".to_string()
}

fn default_doc_id_path() -> String {
    "/doc/".to_string()
}

/// Settings describing the appliance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GsaSettings {
    /// Appliance hostname; feeds go to `http(s)://<hostname>/xmlfeed`.
    #[serde(default)]
    pub hostname: String,

    /// Character encoding the appliance expects. Only UTF-8 is produced.
    #[serde(default = "default_encoding")]
    pub character_encoding: String,
}

impl Default for GsaSettings {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            character_encoding: default_encoding(),
        }
    }
}

fn default_encoding() -> String {
    "UTF-8".to_string()
}

/// Feed naming settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FeedSettings {
    /// Data source name the appliance files feeds under.
    #[serde(default = "default_feed_name")]
    pub name: String,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            name: default_feed_name(),
        }
    }
}

fn default_feed_name() -> String {
    "adaptor".to_string()
}

/// Push cadence settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AdaptorSettings {
    /// Five-field cron expression driving the full listing push.
    #[serde(default = "default_full_listing_schedule")]
    pub full_listing_schedule: String,

    /// Seconds between incremental polls, for adaptors that support them.
    #[serde(default = "default_incremental_poll_secs")]
    pub incremental_poll_period_secs: u64,
}

impl Default for AdaptorSettings {
    fn default() -> Self {
        Self {
            full_listing_schedule: default_full_listing_schedule(),
            incremental_poll_period_secs: default_incremental_poll_secs(),
        }
    }
}

fn default_full_listing_schedule() -> String {
    // 3 AM every day.
    "0 3 * * *".to_string()
}

fn default_incremental_poll_secs() -> u64 {
    15 * 60
}

/// End-user session settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SessionSettings {
    /// Seconds a session survives without being touched.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,

    /// Floor on the time between expiry sweeps.
    #[serde(default = "default_cleanup_interval_secs")]
    pub max_cleanup_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            max_cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_session_ttl_secs() -> u64 {
    30 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development).
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl AdaptorConfig {
    /// Loads configuration from a YAML file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&AdaptorConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("SEARCHLINK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let loaded: AdaptorConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Loads configuration from environment variables over defaults.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&AdaptorConfig::default())?)
            .add_source(
                Environment::with_prefix("SEARCHLINK")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let loaded: AdaptorConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.gsa.hostname.trim().is_empty() {
            return Err(ConfigLoadError::Invalid {
                message: "gsa.hostname is required".to_string(),
            });
        }

        if !self.gsa.character_encoding.eq_ignore_ascii_case("utf-8") {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "gsa.character_encoding must be UTF-8, got: {}",
                    self.gsa.character_encoding
                ),
            });
        }

        if let Err(e) = schedule::parse_pattern(&self.adaptor.full_listing_schedule) {
            return Err(ConfigLoadError::Invalid {
                message: format!("adaptor.full_listing_schedule: {e}"),
            });
        }

        if self.session.ttl_secs == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "session.ttl_secs must be greater than 0".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        Ok(())
    }
}

// ============================================================
// Change notification
// ============================================================

/// One configuration change, delivered to every subscriber.
#[derive(Clone)]
pub struct ConfigEvent {
    /// Dotted keys whose values differ from the previous snapshot.
    pub modified_keys: BTreeSet<String>,
    /// The snapshot now in effect.
    pub new_config: Arc<AdaptorConfig>,
}

type Listener = Box<dyn Fn(&ConfigEvent) + Send + Sync>;

/// Shared handle to the current configuration.
///
/// Readers take cheap atomic snapshots; [`install`](Self::install) swaps
/// in a new immutable snapshot and then notifies listeners one at a time,
/// so every listener observes events in write order. Listeners must not
/// call back into `install`.
pub struct ConfigHandle {
    current: RwLock<Arc<AdaptorConfig>>,
    listeners: Mutex<Vec<Listener>>,
}

impl ConfigHandle {
    pub fn new(initial: AdaptorConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// The configuration currently in effect.
    pub fn snapshot(&self) -> Arc<AdaptorConfig> {
        Arc::clone(&self.current.read().expect("config lock poisoned"))
    }

    /// Registers a change listener. Delivery is synchronous and serial.
    pub fn subscribe(&self, listener: impl Fn(&ConfigEvent) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(Box::new(listener));
    }

    /// Swaps in `new_config` and notifies subscribers of the difference.
    /// A no-op when nothing changed.
    pub fn install(&self, new_config: AdaptorConfig) {
        let new_config = Arc::new(new_config);
        let modified_keys = {
            let mut current = self.current.write().expect("config lock poisoned");
            let modified = diff_keys(&current, &new_config);
            if modified.is_empty() {
                return;
            }
            *current = Arc::clone(&new_config);
            modified
        };
        let event = ConfigEvent {
            modified_keys,
            new_config,
        };
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

/// Dotted keys whose serialized values differ between two snapshots.
fn diff_keys(old: &AdaptorConfig, new: &AdaptorConfig) -> BTreeSet<String> {
    let old = serde_json::to_value(old).expect("config serializes");
    let new = serde_json::to_value(new).expect("config serializes");
    let mut old_flat = std::collections::BTreeMap::new();
    let mut new_flat = std::collections::BTreeMap::new();
    flatten("", &old, &mut old_flat);
    flatten("", &new, &mut new_flat);

    let mut modified = BTreeSet::new();
    for key in old_flat.keys().chain(new_flat.keys()) {
        if old_flat.get(key) != new_flat.get(key) {
            modified.insert(key.clone());
        }
    }
    modified
}

fn flatten(
    prefix: &str,
    value: &serde_json::Value,
    out: &mut std::collections::BTreeMap<String, serde_json::Value>,
) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&path, child, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), other.clone());
        }
    }
}
