//! Configuration types for haproxy-sync.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

/// Prefix for structured environment overrides, e.g. `HAPROXY_SYNC__DNS__ZONE`.
pub const ENV_PREFIX: &str = "HAPROXY_SYNC";

/// Flat environment variables recognized for deployment compatibility.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("INSTANCE_ID", "instance.id"),
    ("COREOS_PUBLIC_IPV4", "instance.public_ipv4"),
    ("COREOS_PUBLIC_IPV6", "instance.public_ipv6"),
    ("DNSIMPLE_TOKEN", "dns.token"),
];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity and addresses of this proxy instance.
    pub instance: InstanceConfig,

    /// Coordination store connection and namespaces.
    pub store: StoreConfig,

    /// Proxy artifact locations and reload settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// DNS provider settings.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Reconciliation policy.
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Identity of this proxy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique instance identifier (machine id, hostname, ...).
    pub id: String,

    /// Public IPv4 address the proxy binds and publishes.
    pub public_ipv4: Ipv4Addr,

    /// Public IPv6 address the proxy binds and publishes.
    pub public_ipv6: Ipv6Addr,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store endpoints, e.g. `http://127.0.0.1:2379`.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Root of the service definition subtree.
    #[serde(default = "default_service_namespace")]
    pub service_namespace: String,

    /// Root of the backend registration subtree.
    #[serde(default = "default_registration_namespace")]
    pub registration_namespace: String,

    /// Root of the persisted DNS record bindings.
    #[serde(default = "default_dns_namespace")]
    pub dns_namespace: String,

    /// Timeout for reads and writes, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for a single long-poll watch, in seconds.
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u64,
}

/// Proxy artifact configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Live HAProxy configuration file.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Directory holding one PEM file per certificate-bearing service.
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,

    /// Supervisor unit prefix; the instance id is appended.
    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    /// Timeout for the reload call, in seconds.
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,
}

/// DNS provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Whether the proxy's own records are managed at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Provider API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API token.
    #[serde(default)]
    pub token: String,

    /// Provider account id (`_` lets the token pick its account).
    #[serde(default = "default_account_id")]
    pub account_id: String,

    /// Zone the proxy records live in.
    #[serde(default = "default_zone")]
    pub zone: String,

    /// Record name within the zone.
    #[serde(default = "default_record_name")]
    pub record_name: String,

    /// TTL for created records in seconds.
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Timeout for provider calls, in seconds.
    #[serde(default = "default_provider_timeout")]
    pub request_timeout_secs: u64,
}

/// Reconciliation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds a backend stays routable after it was last observed.
    #[serde(default = "default_backend_max_age")]
    pub backend_max_age_secs: u64,

    /// Keep services that disappear from the store instead of dropping them.
    #[serde(default)]
    pub retain_missing_services: bool,

    /// First retry delay after a watch failure, in seconds.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,

    /// Upper bound for the watch retry delay, in seconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    /// Time listeners get to wind down after a stop signal, in milliseconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "haproxy_sync=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human readable text.
    #[serde(default)]
    pub json_logs: bool,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            service_namespace: default_service_namespace(),
            registration_namespace: default_registration_namespace(),
            dns_namespace: default_dns_namespace(),
            request_timeout_secs: default_request_timeout(),
            watch_timeout_secs: default_watch_timeout(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            certs_dir: default_certs_dir(),
            unit_prefix: default_unit_prefix(),
            reload_timeout_secs: default_reload_timeout(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_api_url(),
            token: String::new(),
            account_id: default_account_id(),
            zone: default_zone(),
            record_name: default_record_name(),
            ttl: default_ttl(),
            request_timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            backend_max_age_secs: default_backend_max_age(),
            retain_missing_services: false,
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

impl ProxyConfig {
    /// Supervisor unit reloaded for the given instance.
    pub fn unit_name(&self, instance_id: &str) -> String {
        format!("{}{}", self.unit_prefix, instance_id)
    }
}

impl ReconcileConfig {
    /// Backend expiry window, or `None` when it does not fit a
    /// `chrono::Duration`.
    pub fn try_backend_max_age(&self) -> Option<chrono::Duration> {
        i64::try_from(self.backend_max_age_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    /// Backend expiry window. Out of range values saturate; `validate`
    /// rejects them at startup.
    pub fn backend_max_age(&self) -> chrono::Duration {
        self.try_backend_max_age().unwrap_or(chrono::Duration::MAX)
    }

    /// Grace period granted on shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// Later sources win: file, then `HAPROXY_SYNC__*` variables, then the
    /// flat deployment variables (`INSTANCE_ID`, `ETCD_ENDPOINTS`, ...).
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        Self::load_with_env(path, |name| std::env::var(name).ok())
    }

    /// Load configuration using `env` to resolve the flat variables.
    pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("store.endpoints")
                .try_parsing(true),
        );

        for (var, key) in LEGACY_ENV {
            builder = builder.set_override_option(*key, env(var).filter(|v| !v.is_empty()))?;
        }

        if let Some(endpoints) = env("ETCD_ENDPOINTS").filter(|v| !v.is_empty()) {
            let endpoints: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
            builder = builder.set_override("store.endpoints", endpoints)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.instance.id.trim().is_empty() {
            return Err(SyncError::Config("instance.id must not be empty".into()));
        }
        if self.store.endpoints.is_empty() {
            return Err(SyncError::Config(
                "store.endpoints must list at least one endpoint".into(),
            ));
        }
        if self.store.request_timeout_secs == 0 || self.store.watch_timeout_secs == 0 {
            return Err(SyncError::Config("store timeouts must be non-zero".into()));
        }
        if self.proxy.reload_timeout_secs == 0 {
            return Err(SyncError::Config(
                "proxy.reload_timeout_secs must be non-zero".into(),
            ));
        }
        if self.dns.enabled {
            if self.dns.token.trim().is_empty() {
                return Err(SyncError::Config(
                    "dns.token is required when DNS management is enabled".into(),
                ));
            }
            if self.dns.ttl == 0 || self.dns.request_timeout_secs == 0 {
                return Err(SyncError::Config(
                    "dns.ttl and dns.request_timeout_secs must be non-zero".into(),
                ));
            }
        }
        if self.reconcile.backoff_initial_secs == 0
            || self.reconcile.backoff_max_secs < self.reconcile.backoff_initial_secs
        {
            return Err(SyncError::Config(
                "reconcile backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if self.reconcile.try_backend_max_age().is_none() {
            return Err(SyncError::Config(format!(
                "reconcile.backend_max_age_secs {} is out of range",
                self.reconcile.backend_max_age_secs
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_service_namespace() -> String {
    "/cycore/proxy/services".to_string()
}

fn default_registration_namespace() -> String {
    "/srv".to_string()
}

fn default_dns_namespace() -> String {
    "/cycore/proxy/dns".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

fn default_watch_timeout() -> u64 {
    60
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/data/haproxy.cfg")
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("/data/certs")
}

fn default_unit_prefix() -> String {
    "haproxy.cycore@".to_string()
}

fn default_reload_timeout() -> u64 {
    10
}

fn default_api_url() -> String {
    "https://api.dnsimple.com".to_string()
}

fn default_account_id() -> String {
    "_".to_string()
}

fn default_zone() -> String {
    "cycore.io".to_string()
}

fn default_record_name() -> String {
    "proxy".to_string()
}

fn default_ttl() -> u32 {
    60
}

fn default_provider_timeout() -> u64 {
    10
}

fn default_backend_max_age() -> u64 {
    crate::backend::DEFAULT_MAX_AGE_SECS as u64
}

fn default_backoff_initial() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "haproxy-sync".to_string()
}
