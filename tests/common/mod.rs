//! Shared test infrastructure for haproxy-sync integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use haproxy_sync::config::{
    Config, DnsConfig, InstanceConfig, ProxyConfig, ReconcileConfig, StoreConfig, TelemetryConfig,
};
use haproxy_sync::dns::{DnsProvider, NewRecord, RecordId, RecordKind};
use haproxy_sync::error::{ProviderError, SyncError};
use haproxy_sync::reload::ProxyReloader;
use haproxy_sync::store::MemoryStore;
use haproxy_sync::{Components, ProxySync};

// --- Constants ---

pub const SERVICE_NS: &str = "/cycore/proxy/services";
pub const REGISTRATION_NS: &str = "/srv";
pub const DNS_NS: &str = "/cycore/proxy/dns";
pub const INSTANCE_ID: &str = "i-test";
pub const UNIT: &str = "haproxy.cycore@i-test";

pub fn ipv4() -> Ipv4Addr {
    Ipv4Addr::new(203, 0, 113, 10)
}

pub fn ipv6() -> Ipv6Addr {
    "2001:db8::10".parse().unwrap()
}

// --- Config builders ---

/// Configuration writing all proxy artifacts below `dir`.
pub fn test_config(dir: &Path) -> Config {
    Config {
        instance: InstanceConfig {
            id: INSTANCE_ID.to_string(),
            public_ipv4: ipv4(),
            public_ipv6: ipv6(),
        },
        store: StoreConfig {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            ..StoreConfig::default()
        },
        proxy: ProxyConfig {
            config_path: dir.join("haproxy.cfg"),
            certs_dir: dir.join("certs"),
            ..ProxyConfig::default()
        },
        dns: DnsConfig {
            token: "test-token".to_string(),
            ..DnsConfig::default()
        },
        reconcile: ReconcileConfig {
            backoff_initial_secs: 1,
            backoff_max_secs: 2,
            shutdown_grace_ms: 500,
            ..ReconcileConfig::default()
        },
        telemetry: TelemetryConfig::default(),
    }
}

// --- Store builder ---

/// Populates a [`MemoryStore`] with services and registrations.
pub struct TestStoreBuilder {
    store: MemoryStore,
}

impl TestStoreBuilder {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
        }
    }

    /// Define a service routed for `hostnames`.
    pub fn service(self, name: &str, hostnames: &[&str]) -> Self {
        for (i, hostname) in hostnames.iter().enumerate() {
            self.store
                .put(&format!("{SERVICE_NS}/{name}/dns/{i}"), hostname);
        }
        self
    }

    /// Attach a certificate to a service.
    pub fn cert(self, name: &str, pem: &str) -> Self {
        self.store.put(&format!("{SERVICE_NS}/{name}/cert"), pem);
        self
    }

    /// Register a backend for a service.
    pub fn backend(self, service: &str, id: &str, endpoint: &str) -> Self {
        put_backend(&self.store, service, id, endpoint);
        self
    }

    pub fn build(self) -> MemoryStore {
        self.store
    }
}

pub fn put_backend(store: &MemoryStore, service: &str, id: &str, endpoint: &str) {
    store.put(&format!("{REGISTRATION_NS}/{service}/{id}"), endpoint);
}

pub fn remove_backend(store: &MemoryStore, service: &str, id: &str) {
    store.delete(&format!("{REGISTRATION_NS}/{service}/{id}"));
}

// --- RecordingReloader ---

/// Records every reload request.
#[derive(Default)]
pub struct RecordingReloader {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingReloader {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProxyReloader for RecordingReloader {
    async fn reload(&self, unit: &str) -> Result<(), SyncError> {
        self.calls.lock().unwrap().push(unit.to_string());
        if self.fail {
            Err(SyncError::Reload("reload refused".to_string()))
        } else {
            Ok(())
        }
    }
}

// --- FakeDnsProvider ---

/// One call made against the fake provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create(RecordKind, String),
    Get(RecordId),
    Update(RecordId, String),
}

/// In-memory DNS zone that logs every call.
#[derive(Default)]
pub struct FakeDnsProvider {
    records: Mutex<HashMap<RecordId, String>>,
    calls: Mutex<Vec<ProviderCall>>,
    next_id: Mutex<RecordId>,
    fail: bool,
}

impl FakeDnsProvider {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ProviderCall::Create(..)))
            .count()
    }

    pub fn record(&self, id: RecordId) -> Option<String> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn check(&self) -> Result<(), ProviderError> {
        if self.fail {
            Err(ProviderError::Api {
                status: 401,
                message: "authentication failed".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DnsProvider for FakeDnsProvider {
    async fn create(&self, record: &NewRecord) -> Result<RecordId, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Create(record.kind, record.content.clone()));
        self.check()?;
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        self.records
            .lock()
            .unwrap()
            .insert(*next, record.content.clone());
        Ok(*next)
    }

    async fn get(&self, id: RecordId) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(ProviderCall::Get(id));
        self.check()?;
        self.record(id).ok_or(ProviderError::NotFound(id))
    }

    async fn update(&self, id: RecordId, content: &str) -> Result<(), ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(ProviderCall::Update(id, content.to_string()));
        self.check()?;
        self.records.lock().unwrap().insert(id, content.to_string());
        Ok(())
    }
}

// --- ProxySync construction ---

/// Build a synchronizer over test collaborators. DNS is disabled when
/// `provider` is `None`.
pub fn build_sync(
    config: Config,
    store: &MemoryStore,
    reloader: Arc<RecordingReloader>,
    provider: Option<Arc<FakeDnsProvider>>,
) -> ProxySync {
    ProxySync::with_components(
        config,
        Components {
            store: Arc::new(store.clone()),
            reloader,
            dns_provider: provider.map(|p| p as Arc<dyn DnsProvider>),
        },
    )
}

// --- Assertions ---

pub fn read_config(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("haproxy.cfg")).expect("haproxy.cfg was not written")
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
