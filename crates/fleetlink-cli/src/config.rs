//! Configuration vault – reads/writes `~/.fleetlink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use fleetlink_middleware::destination::{
    DEFAULT_HTTP_URL_TEMPLATE, DEFAULT_ROOT_NAMESPACE, DEFAULT_STREAM_URL_TEMPLATE,
};
use fleetlink_middleware::{DestinationResolver, MqttConfig};
use fleetlink_runtime::presence::DEFAULT_FALLBACK_MANUFACTURER;
use fleetlink_types::TransportKind;

/// Broker settings for the message-queue transport.
#[derive(Clone, Serialize, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Stored as plain text; the file is written owner-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Topic prefix, `{root}/{manufacturer}/{deviceId}/{kind}`.
    #[serde(default = "default_root_namespace")]
    pub root_namespace: String,
}

impl std::fmt::Debug for MqttSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("publish_timeout_ms", &self.publish_timeout_ms)
            .field("root_namespace", &self.root_namespace)
            .finish()
    }
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            publish_timeout_ms: default_publish_timeout_ms(),
            root_namespace: default_root_namespace(),
        }
    }
}

/// Settings shared by the HTTP and streaming transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSection {
    /// URL with a `{deviceId}` placeholder.
    pub url_template: String,

    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCacheSection {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl StatusCacheSection {
    pub fn heartbeat(&self) -> Duration {
        at_least_one_second(self.heartbeat_secs)
    }

    pub fn ttl(&self) -> Duration {
        at_least_one_second(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        at_least_one_second(self.sweep_interval_secs)
    }
}

/// Zero periods from the file are raised to one second; timers reject zero.
fn at_least_one_second(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

impl Default for StatusCacheSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_burst_interval_ms")]
    pub burst_interval_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            burst_interval_ms: default_burst_interval_ms(),
        }
    }
}

/// Persisted bridge configuration stored in `~/.fleetlink/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Transport used when a command does not name one.
    #[serde(default = "default_transport")]
    pub default_transport: TransportKind,

    /// SQLite file holding order execution records.  Defaults to
    /// `orders.db` next to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// JSON template catalog loaded at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_path: Option<PathBuf>,

    /// Manufacturer used in topics for robots that never reported one.
    #[serde(default = "default_fallback_manufacturer")]
    pub fallback_manufacturer: String,

    /// Seconds a direct command may wait for a result before it is failed.
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,

    #[serde(default)]
    pub mqtt: MqttSection,

    #[serde(default = "default_http_section")]
    pub http: EndpointSection,

    #[serde(default = "default_stream_section")]
    pub stream: EndpointSection,

    #[serde(default)]
    pub status_cache: StatusCacheSection,

    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "fleetlink".to_string()
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_publish_timeout_ms() -> u64 {
    5_000
}
fn default_root_namespace() -> String {
    DEFAULT_ROOT_NAMESPACE.to_string()
}
fn default_endpoint_timeout_ms() -> u64 {
    10_000
}
fn default_http_section() -> EndpointSection {
    EndpointSection {
        url_template: DEFAULT_HTTP_URL_TEMPLATE.to_string(),
        timeout_ms: default_endpoint_timeout_ms(),
    }
}
fn default_stream_section() -> EndpointSection {
    EndpointSection {
        url_template: DEFAULT_STREAM_URL_TEMPLATE.to_string(),
        timeout_ms: default_endpoint_timeout_ms(),
    }
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_min_interval_ms() -> u64 {
    500
}
fn default_burst_interval_ms() -> u64 {
    5_000
}
fn default_transport() -> TransportKind {
    TransportKind::Queue
}
fn default_fallback_manufacturer() -> String {
    DEFAULT_FALLBACK_MANUFACTURER.to_string()
}
fn default_pending_ttl_secs() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_transport: default_transport(),
            database_path: None,
            templates_path: None,
            fallback_manufacturer: default_fallback_manufacturer(),
            pending_ttl_secs: default_pending_ttl_secs(),
            mqtt: MqttSection::default(),
            http: default_http_section(),
            stream: default_stream_section(),
            status_cache: StatusCacheSection::default(),
            rate_limit: RateLimitSection::default(),
        }
    }
}

impl Config {
    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            keep_alive: Duration::from_secs(self.mqtt.keep_alive_secs),
            publish_timeout: Duration::from_millis(self.mqtt.publish_timeout_ms),
        }
    }

    pub fn resolver(&self) -> DestinationResolver {
        DestinationResolver::new(
            &self.mqtt.root_namespace,
            &self.http.url_template,
            &self.stream.url_template,
        )
    }

    pub fn pending_ttl(&self) -> Duration {
        at_least_one_second(self.pending_ttl_secs)
    }

    /// The configured database path, or `orders.db` beside `config_file`.
    pub fn database_path_or(&self, config_file: &std::path::Path) -> PathBuf {
        match &self.database_path {
            Some(path) => path.clone(),
            None => config_file
                .parent()
                .map(|dir| dir.join("orders.db"))
                .unwrap_or_else(|| PathBuf::from("orders.db")),
        }
    }
}

/// Return the path to `~/.fleetlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fleetlink").join("config.toml")
}

/// Load the config file as written.  Returns `None` if it does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// `cfg` as the bridge runs it: [`apply_env_overrides`] on top of whatever
/// was loaded, wizard-built or defaulted.  Nothing is written back.
pub fn with_env_overrides(mut cfg: Config) -> Config {
    apply_env_overrides(&mut cfg);
    cfg
}

/// Apply `FLEETLINK_*` environment variable overrides to `cfg`.  Values
/// that do not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETLINK_MQTT_HOST` | `mqtt.host` |
/// | `FLEETLINK_MQTT_PORT` | `mqtt.port` |
/// | `FLEETLINK_DEFAULT_TRANSPORT` | `default_transport` |
/// | `FLEETLINK_DATABASE_PATH` | `database_path` |
/// | `FLEETLINK_TEMPLATES_PATH` | `templates_path` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FLEETLINK_MQTT_HOST") {
        cfg.mqtt.host = v;
    }
    if let Ok(v) = std::env::var("FLEETLINK_MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.mqtt.port = port;
    }
    if let Ok(v) = std::env::var("FLEETLINK_DEFAULT_TRANSPORT")
        && let Ok(kind) = v.parse::<TransportKind>()
    {
        cfg.default_transport = kind;
    }
    if let Ok(v) = std::env::var("FLEETLINK_DATABASE_PATH") {
        cfg.database_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("FLEETLINK_TEMPLATES_PATH") {
        cfg.templates_path = Some(PathBuf::from(v));
    }
}

/// Save the config to disk, creating `~/.fleetlink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only (rwx------) on Unix; the file may hold broker credentials.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
