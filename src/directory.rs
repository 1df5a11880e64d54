//! In-memory service directory fed from the coordination store.
//!
//! A load is one full, sorted read of the service subtree plus one
//! registration read per service. The result is folded into the directory
//! and reports whether anything observable changed, which gates rendering
//! and reloading.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{StoreError, SyncError};
use crate::metrics;
use crate::service::{parse_backends, Service, ServiceDefinition};
use crate::store::{join_key, CoordinationStore, Node};

/// Where the directory reads from and how it ages backends.
#[derive(Debug, Clone)]
pub struct DirectorySettings {
    /// Root of the service definition subtree.
    pub service_namespace: String,
    /// Root of the backend registration subtree.
    pub registration_namespace: String,
    /// Backend expiry window.
    pub backend_max_age: Duration,
    /// Keep services that vanish from the store.
    pub retain_missing: bool,
}

/// Outcome of reading the store once.
#[derive(Debug, Default)]
pub struct DirectoryRead {
    /// Services parsed successfully.
    pub services: Vec<Service>,
    /// Services present in the store whose parse failed.
    pub failed: BTreeSet<String>,
}

/// Read-only view of the directory at one point in time.
pub type DirectorySnapshot = BTreeMap<String, Service>;

/// Thread-safe service directory.
#[derive(Clone)]
pub struct ServiceDirectory {
    store: Arc<dyn CoordinationStore>,
    settings: DirectorySettings,
    services: Arc<RwLock<BTreeMap<String, Service>>>,
    // Every name present in the last read, including ones that failed to parse
    defined: Arc<RwLock<BTreeSet<String>>>,
    load_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ServiceDirectory {
    /// Create an empty directory reading from `store`.
    pub fn new(store: Arc<dyn CoordinationStore>, settings: DirectorySettings) -> Self {
        Self {
            store,
            settings,
            services: Arc::new(RwLock::new(BTreeMap::new())),
            defined: Arc::new(RwLock::new(BTreeSet::new())),
            load_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Reload every service from the store. Returns whether the directory changed.
    pub async fn load(&self) -> Result<bool, SyncError> {
        self.load_at(Utc::now()).await
    }

    /// Reload every service, treating `now` as the observation time.
    pub async fn load_at(&self, now: DateTime<Utc>) -> Result<bool, SyncError> {
        // One writer at a time: the read below and the merge must not interleave
        let _guard = self.load_lock.lock().await;
        let read = self.read(now).await?;
        Ok(self.apply(read, now))
    }

    /// Read and parse every service from the store.
    pub async fn read(&self, now: DateTime<Utc>) -> Result<DirectoryRead, SyncError> {
        let tree = match self.store.get_tree(&self.settings.service_namespace).await {
            Ok(tree) => tree,
            Err(StoreError::NotFound(_)) => {
                debug!(
                    namespace = %self.settings.service_namespace,
                    "service namespace is empty"
                );
                Node::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut read = DirectoryRead::default();

        for node in &tree.children {
            let definition = match ServiceDefinition::from_node(node) {
                Ok(definition) => definition,
                Err(e) => {
                    warn!(key = %node.key, error = %e, "skipping service");
                    metrics::record_parse_failure(e.reason());
                    if !node.name().is_empty() {
                        read.failed.insert(node.name().to_string());
                    }
                    continue;
                }
            };

            let name = definition.name.clone();
            let parsed = match self.read_backends(&name, now).await {
                Ok(backends) => definition.with_backends(backends),
                Err(e) => {
                    warn!(service = %name, error = %e, "failed to read backends");
                    metrics::record_parse_failure("backend_read");
                    read.failed.insert(name);
                    continue;
                }
            };

            match parsed {
                Ok(service) => read.services.push(service),
                Err(e) => {
                    warn!(service = %name, error = %e, "skipping service");
                    metrics::record_parse_failure(e.reason());
                    read.failed.insert(name);
                }
            }
        }

        Ok(read)
    }

    async fn read_backends(
        &self,
        service: &str,
        now: DateTime<Utc>,
    ) -> Result<crate::backend::BackendSet, StoreError> {
        let key = join_key(&self.settings.registration_namespace, service);
        match self.store.get_tree(&key).await {
            Ok(node) => Ok(parse_backends(&node, now)),
            Err(StoreError::NotFound(_)) => Ok(Default::default()),
            Err(e) => Err(e),
        }
    }

    /// Fold a store read into the directory. Returns whether anything changed.
    pub fn apply(&self, read: DirectoryRead, now: DateTime<Utc>) -> bool {
        let mut services = self.services.write();
        let mut changed = false;
        let mut seen: BTreeSet<String> = read.failed;

        for fresh in read.services {
            seen.insert(fresh.name.clone());

            let next = match services.get(&fresh.name) {
                Some(previous) => {
                    let reconciled =
                        fresh.reconcile_with(previous, now, self.settings.backend_max_age);
                    if *previous != reconciled {
                        debug!(
                            service = %reconciled.name,
                            backends = reconciled.backends.len(),
                            "service changed"
                        );
                        changed = true;
                    }
                    reconciled
                }
                None => {
                    info!(
                        service = %fresh.name,
                        hostnames = fresh.hostnames.len(),
                        backends = fresh.backends.len(),
                        "service added"
                    );
                    changed = true;
                    fresh
                }
            };

            // Always store the reconciled timestamps, even when nothing
            // observable changed
            services.insert(next.name.clone(), next);
        }

        if !self.settings.retain_missing {
            let before = services.len();
            services.retain(|name, _| {
                let keep = seen.contains(name);
                if !keep {
                    info!(service = %name, "service removed");
                }
                keep
            });
            changed |= services.len() != before;
        }

        metrics::record_directory_counts(
            services.len(),
            services.values().map(|s| s.backends.len()).sum(),
        );
        *self.defined.write() = seen;

        changed
    }

    /// Copy of the current directory contents, ordered by name.
    pub fn snapshot(&self) -> DirectorySnapshot {
        self.services.read().clone()
    }

    /// Look up one service.
    pub fn get(&self, name: &str) -> Option<Service> {
        self.services.read().get(name).cloned()
    }

    /// Whether a service is currently tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Whether the store defined `name` at the last load, usable or not.
    pub fn is_defined(&self, name: &str) -> bool {
        let defined = self.defined.read().contains(name);
        defined || self.contains(name)
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Total backends across all services.
    pub fn backends_count(&self) -> usize {
        self.services.read().values().map(|s| s.backends.len()).sum()
    }

    /// Emit current directory metrics.
    pub fn emit_metrics(&self) {
        let services = self.services.read();
        metrics::record_directory_counts(
            services.len(),
            services.values().map(|s| s.backends.len()).sum(),
        );
    }

    /// Settings this directory was built with.
    pub fn settings(&self) -> &DirectorySettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn settings() -> DirectorySettings {
        DirectorySettings {
            service_namespace: "/svc".into(),
            registration_namespace: "/srv".into(),
            backend_max_age: Duration::hours(1),
            retain_missing: false,
        }
    }

    fn directory(store: &MemoryStore) -> ServiceDirectory {
        ServiceDirectory::new(Arc::new(store.clone()), settings())
    }

    #[tokio::test]
    async fn test_first_load_changes_second_does_not() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let dir = directory(&store);

        assert!(dir.load().await.unwrap());
        assert!(!dir.load().await.unwrap());
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_report_one_change() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let dir = directory(&store);

        let (a, b, c, d) = tokio::join!(dir.load(), dir.load(), dir.load(), dir.load());
        let changed = [a, b, c, d].into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(changed, 1);
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_namespace_loads_nothing() {
        let store = MemoryStore::new();
        let dir = directory(&store);

        assert!(!dir.load().await.unwrap());
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_service_without_backends_is_skipped() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        let dir = directory(&store);

        assert!(!dir.load().await.unwrap());
        assert!(!dir.contains("web"));
        assert!(dir.is_defined("web"));
        assert!(!dir.is_defined("api"));
    }

    #[tokio::test]
    async fn test_failed_parse_keeps_previous_entry() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/svc/web/cert", "PEM");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let dir = directory(&store);
        let t0 = Utc::now();
        assert!(dir.load_at(t0).await.unwrap());

        // Hostnames vanish: the definition is broken, the old entry stays
        store.delete("/svc/web/dns");
        assert!(!dir.load_at(t0).await.unwrap());
        let web = dir.get("web").unwrap();
        assert!(web.hostnames.contains("a.example"));
    }

    #[tokio::test]
    async fn test_hostname_change_is_detected() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let dir = directory(&store);
        dir.load().await.unwrap();

        store.put("/svc/web/dns/1", "b.example");
        assert!(dir.load().await.unwrap());
        assert_eq!(dir.get("web").unwrap().hostnames.len(), 2);
    }

    #[tokio::test]
    async fn test_vanished_service_is_dropped() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        store.put("/svc/api/dns/0", "api.example");
        store.put("/srv/api/b1", "10.0.1.1:80");
        let dir = directory(&store);
        dir.load().await.unwrap();
        assert_eq!(dir.len(), 2);

        store.delete("/svc/api");
        assert!(dir.load().await.unwrap());
        assert!(!dir.contains("api"));
        assert!(dir.contains("web"));
    }

    #[tokio::test]
    async fn test_vanished_service_is_retained_when_configured() {
        let store = MemoryStore::new();
        store.put("/svc/api/dns/0", "api.example");
        store.put("/srv/api/b1", "10.0.1.1:80");
        let dir = ServiceDirectory::new(
            Arc::new(store.clone()),
            DirectorySettings {
                retain_missing: true,
                ..settings()
            },
        );
        dir.load().await.unwrap();

        store.delete("/svc/api");
        assert!(!dir.load().await.unwrap());
        assert!(dir.contains("api"));
    }

    #[tokio::test]
    async fn test_backend_timestamps_refresh_without_change() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let dir = directory(&store);

        let t0 = Utc::now();
        dir.load_at(t0).await.unwrap();
        let t1 = t0 + Duration::minutes(50);
        assert!(!dir.load_at(t1).await.unwrap());

        let web = dir.get("web").unwrap();
        assert_eq!(web.backends.last_seen("10.0.0.1:80"), Some(t1));
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered_by_name() {
        let store = MemoryStore::new();
        for name in ["zeta", "alpha", "mid"] {
            store.put(&format!("/svc/{name}/dns/0"), &format!("{name}.example"));
            store.put(&format!("/srv/{name}/b1"), "10.0.0.1:80");
        }
        let dir = directory(&store);
        dir.load().await.unwrap();

        let names: Vec<String> = dir.snapshot().into_keys().collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert_eq!(dir.backends_count(), 3);
    }
}
