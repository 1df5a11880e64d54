//! Process lifecycle: startup reconciliation, listeners and shutdown.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::directory::{DirectorySettings, ServiceDirectory};
use crate::dns::{DnsProvider, DnsSettings, DnsSynchronizer, DnsimpleClient};
use crate::error::SyncError;
use crate::reconciler::Reconciler;
use crate::reload::{Orchestrator, ProxyReloader, SystemdReloader};
use crate::render::RenderSettings;
use crate::store::{CoordinationStore, EtcdStore};
use crate::watch::{WatchLoop, WatchSettings};

/// Interval for emitting directory metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit directory metrics.
async fn metrics_loop(directory: ServiceDirectory, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                directory.emit_metrics();
                debug!(
                    services = directory.len(),
                    backends = directory.backends_count(),
                    "emitted directory metrics"
                );
            }
            _ = cancel.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// External collaborators of the synchronizer.
pub struct Components {
    /// Coordination store shared by every subsystem.
    pub store: Arc<dyn CoordinationStore>,
    /// Proxy reload signal.
    pub reloader: Arc<dyn ProxyReloader>,
    /// DNS provider, absent when DNS management is disabled.
    pub dns_provider: Option<Arc<dyn DnsProvider>>,
}

impl Components {
    /// Build the production clients described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        let store: Arc<dyn CoordinationStore> = Arc::new(EtcdStore::new(&config.store)?);
        let reloader: Arc<dyn ProxyReloader> = Arc::new(SystemdReloader::new(Duration::from_secs(
            config.proxy.reload_timeout_secs,
        )));
        let dns_provider = if config.dns.enabled {
            let client: Arc<dyn DnsProvider> = Arc::new(DnsimpleClient::new(&config.dns)?);
            Some(client)
        } else {
            None
        };

        Ok(Self {
            store,
            reloader,
            dns_provider,
        })
    }
}

/// Keeps the proxy configuration and DNS records in sync with the store.
pub struct ProxySync {
    config: Config,
    store: Arc<dyn CoordinationStore>,
    reconciler: Arc<Reconciler>,
    dns: Option<DnsSynchronizer>,
}

impl ProxySync {
    /// Create a synchronizer using the production clients.
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let components = Components::from_config(&config)?;
        Ok(Self::with_components(config, components))
    }

    /// Create a synchronizer over the given collaborators.
    pub fn with_components(config: Config, components: Components) -> Self {
        let directory = ServiceDirectory::new(
            components.store.clone(),
            DirectorySettings {
                service_namespace: config.store.service_namespace.clone(),
                registration_namespace: config.store.registration_namespace.clone(),
                backend_max_age: config.reconcile.backend_max_age(),
                retain_missing: config.reconcile.retain_missing_services,
            },
        );

        let render = RenderSettings {
            ipv4: config.instance.public_ipv4,
            ipv6: config.instance.public_ipv6,
            certs_dir: config.proxy.certs_dir.clone(),
        };

        let orchestrator = Orchestrator::new(
            config.proxy.config_path.clone(),
            config.proxy.unit_name(&config.instance.id),
            components.reloader,
        );

        let dns = components.dns_provider.map(|provider| {
            DnsSynchronizer::new(
                components.store.clone(),
                provider,
                DnsSettings {
                    namespace: config.store.dns_namespace.clone(),
                    instance_id: config.instance.id.clone(),
                    record_name: config.dns.record_name.clone(),
                    ttl: config.dns.ttl,
                    ipv4: config.instance.public_ipv4,
                    ipv6: config.instance.public_ipv6,
                },
            )
        });

        Self {
            reconciler: Arc::new(Reconciler::new(directory, render, orchestrator)),
            store: components.store,
            dns,
            config,
        }
    }

    /// The reconciler shared with the listeners.
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The DNS synchronizer, when DNS management is enabled.
    pub fn dns(&self) -> Option<&DnsSynchronizer> {
        self.dns.as_ref()
    }

    /// Startup work that must succeed before any listener starts.
    pub async fn start(&self) -> Result<(), SyncError> {
        let outcome = self.reconciler.reconcile().await?;
        info!(?outcome, "startup reconciliation complete");

        match &self.dns {
            Some(dns) => {
                for (kind, outcome) in dns.sync().await? {
                    info!(kind = %kind, ?outcome, "DNS record synchronized");
                }
            }
            None => info!("DNS management disabled"),
        }
        Ok(())
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SyncError> {
        info!(
            instance = %self.config.instance.id,
            ipv4 = %self.config.instance.public_ipv4,
            ipv6 = %self.config.instance.public_ipv6,
            endpoints = ?self.config.store.endpoints,
            "Starting haproxy-sync"
        );

        self.start().await?;

        let watch = WatchLoop::new(
            self.store.clone(),
            self.reconciler.clone(),
            WatchSettings {
                service_namespace: self.config.store.service_namespace.clone(),
                registration_namespace: self.config.store.registration_namespace.clone(),
                backoff_initial: Duration::from_secs(self.config.reconcile.backoff_initial_secs),
                backoff_max: Duration::from_secs(self.config.reconcile.backoff_max_secs),
            },
        );
        let watch_handle = tokio::spawn(watch.run(cancel.clone()));

        let metrics_handle = tokio::spawn(metrics_loop(
            self.reconciler.directory().clone(),
            cancel.clone(),
        ));

        info!("haproxy-sync ready, watching for changes");
        cancel.cancelled().await;
        info!("shutdown requested");

        // A pass in flight may hold the listeners; do not wait on it forever
        let grace = self.config.reconcile.shutdown_grace();
        let stopped = tokio::time::timeout(grace, async {
            let _ = metrics_handle.await;
            let _ = watch_handle.await;
        })
        .await;
        if stopped.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "listeners still busy at shutdown");
        }

        info!("haproxy-sync stopped");
        Ok(())
    }
}
