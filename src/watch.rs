//! Watch listeners for the service and backend subtrees.
//!
//! One long-lived task per subtree blocks on the store's watch, filters out
//! events that cannot change the rendered configuration and runs a
//! reconciliation pass for the rest. Every time a watch is (re)opened the
//! listener also runs one catch-up pass, covering writes made while no watch
//! was open. Passes triggered by both listeners are serialized inside the
//! reconciler.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::metrics::{self, IgnoreReason, ReconnectReason};
use crate::reconciler::Reconciler;
use crate::store::{first_segment_under, CoordinationStore, WatchEvent};

/// Subtree a listener is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tree {
    /// Service definitions.
    Services,
    /// Backend registrations.
    Backends,
}

impl Tree {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tree::Services => "services",
            Tree::Backends => "backends",
        }
    }
}

/// Namespaces and retry timing for the listeners.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Root of the service definition subtree.
    pub service_namespace: String,
    /// Root of the backend registration subtree.
    pub registration_namespace: String,
    /// First delay after a failed watch.
    pub backoff_initial: Duration,
    /// Upper bound on the delay.
    pub backoff_max: Duration,
}

impl WatchSettings {
    fn namespace(&self, tree: Tree) -> &str {
        match tree {
            Tree::Services => &self.service_namespace,
            Tree::Backends => &self.registration_namespace,
        }
    }
}

/// Decide whether `event` on `tree` warrants a reconciliation pass.
pub fn classify(
    tree: Tree,
    event: &WatchEvent,
    settings: &WatchSettings,
    reconciler: &Reconciler,
) -> Result<(), IgnoreReason> {
    if event.action.is_read_only() {
        return Err(IgnoreReason::ReadOnly);
    }

    let namespace = settings.namespace(tree);
    match tree {
        Tree::Services => {
            // Events on the namespace root itself (e.g. a resync) count
            if event.key.trim_end_matches('/') == namespace.trim_end_matches('/')
                || first_segment_under(namespace, &event.key).is_some()
            {
                Ok(())
            } else {
                Err(IgnoreReason::OutsideNamespace)
            }
        }
        Tree::Backends => {
            if event.key.trim_end_matches('/') == namespace.trim_end_matches('/') {
                return Ok(());
            }
            match first_segment_under(namespace, &event.key) {
                None => Err(IgnoreReason::OutsideNamespace),
                Some(service) if !reconciler.is_tracked(service) => {
                    Err(IgnoreReason::UntrackedService)
                }
                Some(_) => Ok(()),
            }
        }
    }
}

/// Runs both listeners until cancelled.
pub struct WatchLoop {
    store: Arc<dyn CoordinationStore>,
    reconciler: Arc<Reconciler>,
    settings: WatchSettings,
}

impl WatchLoop {
    /// Create the listeners over a shared store and reconciler.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        reconciler: Arc<Reconciler>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            store,
            reconciler,
            settings,
        }
    }

    /// Watch both subtrees. Returns once `cancel` fires and both listeners stopped.
    pub async fn run(self, cancel: CancellationToken) {
        let this = Arc::new(self);

        let services_handle = tokio::spawn({
            let this = this.clone();
            let cancel = cancel.clone();
            async move { this.watch_tree(Tree::Services, cancel).await }
        });

        let backends_handle = tokio::spawn({
            let this = this.clone();
            let cancel = cancel.clone();
            async move { this.watch_tree(Tree::Backends, cancel).await }
        });

        let (services_result, backends_result) = tokio::join!(services_handle, backends_handle);

        if let Err(e) = services_result {
            error!("Services listener panicked: {}", e);
        }
        if let Err(e) = backends_result {
            error!("Backends listener panicked: {}", e);
        }
    }

    async fn watch_tree(&self, tree: Tree, cancel: CancellationToken) {
        let namespace = self.settings.namespace(tree).to_string();
        let mut backoff = self.settings.backoff_initial;
        let mut first_connect = true;

        loop {
            if cancel.is_cancelled() {
                info!(tree = tree.as_str(), "listener shutting down");
                return;
            }

            let mut watcher = match self.store.watch(&namespace).await {
                Ok(w) => {
                    if first_connect {
                        metrics::record_watch_reconnect(
                            tree.as_str(),
                            ReconnectReason::InitialConnect,
                        );
                        first_connect = false;
                    }
                    info!(tree = tree.as_str(), namespace = %namespace, "watching");
                    w
                }
                Err(e) => {
                    error!(tree = tree.as_str(), error = %e, "failed to start watch");
                    metrics::record_watch_reconnect(tree.as_str(), ReconnectReason::Error);
                    if !self.pause(&mut backoff, &cancel).await {
                        return;
                    }
                    continue;
                }
            };

            // Writes made while no watch was open are only visible to a full
            // read. The watch is already pinned, so nothing after this pass
            // can be missed.
            debug!(tree = tree.as_str(), "catch-up pass after connect");
            let _ = self.reconciler.reconcile().await;

            // Process events until error or shutdown
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        info!(tree = tree.as_str(), "listener received shutdown signal");
                        return;
                    }

                    result = watcher.next() => {
                        match result {
                            Ok(event) => {
                                backoff = self.settings.backoff_initial;
                                self.handle_event(tree, event).await;
                            }
                            Err(StoreError::Timeout) => {
                                // Long-poll expired with nothing to report
                                debug!(tree = tree.as_str(), "watch timed out, polling again");
                                metrics::record_watch_reconnect(
                                    tree.as_str(),
                                    ReconnectReason::Timeout,
                                );
                            }
                            Err(e) => {
                                warn!(tree = tree.as_str(), error = %e, "watch error");
                                metrics::record_watch_reconnect(
                                    tree.as_str(),
                                    ReconnectReason::Error,
                                );
                                break;
                            }
                        }
                    }
                }
            }

            if !self.pause(&mut backoff, &cancel).await {
                return;
            }
        }
    }

    /// Sleep for the current backoff, then double it. Returns false on shutdown.
    async fn pause(&self, backoff: &mut Duration, cancel: &CancellationToken) -> bool {
        let delay = *backoff;
        *backoff = (*backoff * 2).min(self.settings.backoff_max);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn handle_event(&self, tree: Tree, event: WatchEvent) {
        match classify(tree, &event, &self.settings, &self.reconciler) {
            Err(reason) => {
                debug!(
                    tree = tree.as_str(),
                    key = %event.key,
                    action = event.action.as_str(),
                    ?reason,
                    "ignoring watch event"
                );
                metrics::record_watch_ignored(tree.as_str(), reason);
            }
            Ok(()) => {
                info!(
                    tree = tree.as_str(),
                    key = %event.key,
                    action = event.action.as_str(),
                    "change detected"
                );
                metrics::record_watch_event(tree.as_str(), event.action.as_str());
                // Failures are logged by the reconciler; the listener keeps going
                let _ = self.reconciler.reconcile().await;
            }
        }
    }
}
