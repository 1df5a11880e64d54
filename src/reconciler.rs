//! One reconciliation pass: load, diff, render, install, reload.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::directory::ServiceDirectory;
use crate::error::SyncError;
use crate::metrics::{self, PassResult, Timer};
use crate::reload::Orchestrator;
use crate::render::{render, RenderSettings};

/// What a pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing observable changed; no files were touched.
    Unchanged,
    /// A new configuration was installed.
    Applied {
        /// Services in the installed configuration.
        services: usize,
        /// Whether the proxy accepted the reload.
        reloaded: bool,
    },
}

struct PassState {
    // Set until an install succeeds, so a failed install is retried even if
    // the next load sees no change
    pending: bool,
}

/// Runs passes one at a time against a shared directory.
pub struct Reconciler {
    directory: ServiceDirectory,
    render: RenderSettings,
    orchestrator: Orchestrator,
    pass: Mutex<PassState>,
}

impl Reconciler {
    /// Create a reconciler. The first pass always installs a configuration.
    pub fn new(
        directory: ServiceDirectory,
        render: RenderSettings,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            directory,
            render,
            orchestrator,
            pass: Mutex::new(PassState { pending: true }),
        }
    }

    /// Run a pass now.
    pub async fn reconcile(&self) -> Result<PassOutcome, SyncError> {
        self.reconcile_at(Utc::now()).await
    }

    /// Run a pass treating `now` as the observation time.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<PassOutcome, SyncError> {
        let mut state = self.pass.lock().await;
        let timer = Timer::start();

        let result = self.run_pass(&mut state, now).await;
        let pass_result = match &result {
            Ok(PassOutcome::Unchanged) => PassResult::Unchanged,
            Ok(PassOutcome::Applied { .. }) => PassResult::Changed,
            Err(_) => PassResult::Error,
        };
        metrics::record_pass(pass_result, timer.elapsed());

        if let Err(e) = &result {
            warn!(error = %e, "reconciliation pass failed");
        }
        result
    }

    async fn run_pass(
        &self,
        state: &mut PassState,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome, SyncError> {
        let changed = self.directory.load_at(now).await?;
        if !changed && !state.pending {
            debug!("directory unchanged");
            return Ok(PassOutcome::Unchanged);
        }

        let snapshot = self.directory.snapshot();
        let rendered = render(&snapshot, &self.render);
        state.pending = true;
        let applied = self.orchestrator.apply(&rendered).await?;
        state.pending = false;

        info!(
            services = snapshot.len(),
            backends = snapshot.values().map(|s| s.backends.len()).sum::<usize>(),
            reloaded = applied.reloaded,
            "configuration applied"
        );
        Ok(PassOutcome::Applied {
            services: snapshot.len(),
            reloaded: applied.reloaded,
        })
    }

    /// Whether backend changes for `service` are relevant: the service is
    /// defined in the store, even if it had no usable backends yet.
    pub fn is_tracked(&self, service: &str) -> bool {
        self.directory.is_defined(service)
    }

    /// The directory this reconciler maintains.
    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    /// The orchestrator installing rendered configurations.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectorySettings;
    use crate::reload::ProxyReloader;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::path::Path;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingReloader {
        calls: SyncMutex<usize>,
    }

    #[async_trait]
    impl ProxyReloader for CountingReloader {
        async fn reload(&self, _unit: &str) -> Result<(), SyncError> {
            *self.calls.lock() += 1;
            Ok(())
        }
    }

    fn reconciler(store: &MemoryStore, dir: &Path, reloader: Arc<CountingReloader>) -> Reconciler {
        let directory = ServiceDirectory::new(
            Arc::new(store.clone()),
            DirectorySettings {
                service_namespace: "/svc".into(),
                registration_namespace: "/srv".into(),
                backend_max_age: chrono::Duration::hours(1),
                retain_missing: false,
            },
        );
        let render = RenderSettings {
            ipv4: "203.0.113.10".parse().unwrap(),
            ipv6: "2001:db8::10".parse().unwrap(),
            certs_dir: dir.join("certs"),
        };
        let orchestrator = Orchestrator::new(dir.join("haproxy.cfg"), "unit".into(), reloader);
        Reconciler::new(directory, render, orchestrator)
    }

    #[tokio::test]
    async fn test_first_pass_installs_even_when_empty() {
        let store = MemoryStore::new();
        let tmp = tempfile::tempdir().unwrap();
        let reloader = Arc::new(CountingReloader::default());
        let reconciler = reconciler(&store, tmp.path(), reloader.clone());

        let outcome = reconciler.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Applied {
                services: 0,
                reloaded: true
            }
        );
        assert!(tmp.path().join("haproxy.cfg").exists());
        assert_eq!(reconciler.reconcile().await.unwrap(), PassOutcome::Unchanged);
        assert_eq!(*reloader.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_backend_change_triggers_reload() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let tmp = tempfile::tempdir().unwrap();
        let reloader = Arc::new(CountingReloader::default());
        let reconciler = reconciler(&store, tmp.path(), reloader.clone());

        reconciler.reconcile().await.unwrap();
        assert!(reconciler.is_tracked("web"));
        assert!(!reconciler.is_tracked("api"));

        store.put("/srv/web/b2", "10.0.0.2:80");
        let outcome = reconciler.reconcile().await.unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Applied {
                services: 1,
                reloaded: true
            }
        );
        let cfg = std::fs::read_to_string(tmp.path().join("haproxy.cfg")).unwrap();
        assert!(cfg.contains("server srv1 10.0.0.2:80"));
        assert_eq!(*reloader.calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_failed_install_is_retried() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/svc/web/cert", "PEM");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("certs"), "blocker").unwrap();
        let reloader = Arc::new(CountingReloader::default());
        let reconciler = reconciler(&store, tmp.path(), reloader.clone());

        assert!(reconciler.reconcile().await.is_err());
        assert_eq!(*reloader.calls.lock(), 0);

        std::fs::remove_file(tmp.path().join("certs")).unwrap();
        let outcome = reconciler.reconcile().await.unwrap();
        assert!(matches!(outcome, PassOutcome::Applied { services: 1, .. }));
        assert!(tmp.path().join("certs/web.pem").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_passes_apply_once() {
        let store = MemoryStore::new();
        store.put("/svc/web/dns/0", "a.example");
        store.put("/srv/web/b1", "10.0.0.1:80");
        let tmp = tempfile::tempdir().unwrap();
        let reloader = Arc::new(CountingReloader::default());
        let reconciler = Arc::new(reconciler(&store, tmp.path(), reloader.clone()));

        let mut passes = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let reconciler = reconciler.clone();
            passes.spawn(async move { reconciler.reconcile().await.unwrap() });
        }

        let mut applied = 0;
        let mut unchanged = 0;
        while let Some(outcome) = passes.join_next().await {
            match outcome.unwrap() {
                PassOutcome::Applied { .. } => applied += 1,
                PassOutcome::Unchanged => unchanged += 1,
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(unchanged, 7);
        assert_eq!(*reloader.calls.lock(), 1);
    }
}
