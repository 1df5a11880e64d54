//! DNS records for the proxy's own addresses.
//!
//! Each instance owns one A and one AAAA record at the provider. The
//! provider's record id is persisted in the coordination store under
//! `<dns-ns>/<ipv4|ipv6>/<instance-id>`, so a restarted instance updates its
//! existing records instead of creating new ones.
//!
//! Per record kind:
//!
//! ```text
//! Unbound --(binding found in store)--------------------> Bound
//! Unbound --(no binding: create record, persist id)------> Bound
//! Bound   --(reconcile: get; update only if different)---> Bound
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, StoreError, SyncError};
use crate::metrics::{self, DnsOperation};
use crate::store::{join_key, CoordinationStore};

pub mod dnsimple;

pub use dnsimple::DnsimpleClient;

/// Provider-assigned record identifier.
pub type RecordId = u64;

/// Address record kinds managed for the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// IPv4 address record.
    A,
    /// IPv6 address record.
    Aaaa,
}

impl RecordKind {
    /// Both kinds, in reconciliation order.
    pub const ALL: [RecordKind; 2] = [RecordKind::A, RecordKind::Aaaa];

    /// DNS type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::A => "A",
            RecordKind::Aaaa => "AAAA",
        }
    }

    /// Store path segment holding bindings of this kind.
    pub fn namespace_segment(&self) -> &'static str {
        match self {
            RecordKind::A => "ipv4",
            RecordKind::Aaaa => "ipv6",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record to create at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    /// Record name within the zone.
    pub name: String,
    /// Record type.
    pub kind: RecordKind,
    /// Address text.
    pub content: String,
    /// TTL in seconds.
    pub ttl: u32,
}

/// DNS provider API.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a record and return its id.
    async fn create(&self, record: &NewRecord) -> Result<RecordId, ProviderError>;

    /// Current content of a record.
    async fn get(&self, id: RecordId) -> Result<String, ProviderError>;

    /// Replace the content of a record.
    async fn update(&self, id: RecordId, content: &str) -> Result<(), ProviderError>;
}

/// What a reconcile did for one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new record was created and its binding persisted.
    Created(RecordId),
    /// The existing record was rewritten.
    Updated(RecordId),
    /// The existing record already held this instance's address.
    Unchanged(RecordId),
}

impl SyncOutcome {
    /// Record id the kind is bound to afterwards.
    pub fn record_id(&self) -> RecordId {
        match self {
            SyncOutcome::Created(id) | SyncOutcome::Updated(id) | SyncOutcome::Unchanged(id) => *id,
        }
    }
}

/// Static inputs of the synchronizer.
#[derive(Debug, Clone)]
pub struct DnsSettings {
    /// Store namespace for bindings.
    pub namespace: String,
    /// This instance's identity.
    pub instance_id: String,
    /// Record name at the provider.
    pub record_name: String,
    /// TTL for created records.
    pub ttl: u32,
    /// Address published in the A record.
    pub ipv4: Ipv4Addr,
    /// Address published in the AAAA record.
    pub ipv6: Ipv6Addr,
}

/// Keeps the instance's A/AAAA records pointed at its addresses.
pub struct DnsSynchronizer {
    store: Arc<dyn CoordinationStore>,
    provider: Arc<dyn DnsProvider>,
    settings: DnsSettings,
    // Held across provider calls so one kind is never created twice in-process
    bindings: Mutex<HashMap<RecordKind, RecordId>>,
}

impl DnsSynchronizer {
    /// Create a synchronizer with no bindings loaded yet.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        provider: Arc<dyn DnsProvider>,
        settings: DnsSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile both record kinds. Stops at the first failure.
    pub async fn sync(&self) -> Result<Vec<(RecordKind, SyncOutcome)>, SyncError> {
        let mut outcomes = Vec::with_capacity(RecordKind::ALL.len());
        for kind in RecordKind::ALL {
            outcomes.push((kind, self.reconcile(kind).await?));
        }
        Ok(outcomes)
    }

    /// Bring the record of `kind` in line with this instance's address.
    pub async fn reconcile(&self, kind: RecordKind) -> Result<SyncOutcome, SyncError> {
        let mut bindings = self.bindings.lock().await;
        let content = self.address(kind);

        let bound = match bindings.get(&kind) {
            Some(id) => Some(*id),
            None => self.load_binding(kind).await?,
        };

        let outcome = match bound {
            Some(id) => self.reconcile_bound(kind, id, &content).await?,
            None => self.create_and_bind(kind, &content).await?,
        };

        bindings.insert(kind, outcome.record_id());
        Ok(outcome)
    }

    /// Record id currently bound for `kind`, if any.
    pub async fn binding(&self, kind: RecordKind) -> Option<RecordId> {
        self.bindings.lock().await.get(&kind).copied()
    }

    /// Store key of the binding for `kind`.
    pub fn binding_key(&self, kind: RecordKind) -> String {
        join_key(
            &self.settings.namespace,
            &format!("{}/{}", kind.namespace_segment(), self.settings.instance_id),
        )
    }

    fn address(&self, kind: RecordKind) -> String {
        match kind {
            RecordKind::A => self.settings.ipv4.to_string(),
            RecordKind::Aaaa => self.settings.ipv6.to_string(),
        }
    }

    /// Read a persisted binding. Malformed values count as absent.
    async fn load_binding(&self, kind: RecordKind) -> Result<Option<RecordId>, SyncError> {
        let key = self.binding_key(kind);
        let Some(value) = self.store.get(&key).await? else {
            debug!(kind = %kind, key = %key, "no persisted DNS binding");
            return Ok(None);
        };

        match value.trim().parse::<RecordId>() {
            Ok(id) => {
                info!(kind = %kind, record_id = id, "bound to persisted DNS record");
                metrics::record_dns_operation(kind, DnsOperation::Bind, true);
                Ok(Some(id))
            }
            Err(e) => {
                warn!(
                    kind = %kind,
                    key = %key,
                    value = %value,
                    error = %e,
                    "ignoring malformed DNS binding"
                );
                metrics::record_dns_operation(kind, DnsOperation::Bind, false);
                Ok(None)
            }
        }
    }

    async fn reconcile_bound(
        &self,
        kind: RecordKind,
        id: RecordId,
        content: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let current = self.provider.get(id).await.inspect_err(|_| {
            metrics::record_dns_operation(kind, DnsOperation::Update, false);
        })?;

        if same_address(&current, content) {
            info!(kind = %kind, record_id = id, content, "DNS record up to date");
            metrics::record_dns_operation(kind, DnsOperation::Noop, true);
            return Ok(SyncOutcome::Unchanged(id));
        }

        let result = self.provider.update(id, content).await;
        metrics::record_dns_operation(kind, DnsOperation::Update, result.is_ok());
        result?;
        info!(kind = %kind, record_id = id, from = %current, to = content, "DNS record updated");
        Ok(SyncOutcome::Updated(id))
    }

    async fn create_and_bind(
        &self,
        kind: RecordKind,
        content: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let record = NewRecord {
            name: self.settings.record_name.clone(),
            kind,
            content: content.to_string(),
            ttl: self.settings.ttl,
        };

        let result = self.provider.create(&record).await;
        metrics::record_dns_operation(kind, DnsOperation::Create, result.is_ok());
        let id = result?;
        info!(kind = %kind, record_id = id, name = %record.name, content, "DNS record created");

        let key = self.binding_key(kind);
        match self.store.create(&key, &id.to_string()).await {
            Ok(()) => Ok(SyncOutcome::Created(id)),
            Err(StoreError::AlreadyExists(_)) => {
                // Someone bound this kind first, or the stored value was unusable
                let existing = self
                    .store
                    .get(&key)
                    .await?
                    .and_then(|v| v.trim().parse::<RecordId>().ok());
                match existing {
                    Some(existing) => {
                        warn!(
                            kind = %kind,
                            orphaned = id,
                            bound = existing,
                            "DNS binding appeared concurrently; keeping the persisted record"
                        );
                        self.reconcile_bound(kind, existing, content).await
                    }
                    None => {
                        self.store.set(&key, &id.to_string()).await?;
                        Ok(SyncOutcome::Created(id))
                    }
                }
            }
            Err(e) => {
                // The provider record exists but is not bound; the next run
                // will create another one
                warn!(kind = %kind, record_id = id, error = %e, "failed to persist DNS binding");
                Err(e.into())
            }
        }
    }
}

/// Compare record contents as addresses, so spelling differences such as
/// `2001:0db8::10` and `2001:db8::10` do not cause an update.
fn same_address(current: &str, desired: &str) -> bool {
    match (current.trim().parse::<IpAddr>(), desired.parse::<IpAddr>()) {
        (Ok(current), Ok(desired)) => current == desired,
        _ => current == desired,
    }
}
