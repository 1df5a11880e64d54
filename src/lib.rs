//! haproxy-sync - Keeps an HAProxy instance in sync with a coordination store.
//!
//! Service definitions (hostnames, optional TLS certificate) and backend
//! registrations live in an etcd v2 keyspace. This crate watches both
//! subtrees, folds them into an in-memory service directory, renders an
//! HAProxy configuration when the directory changes and reloads the proxy.
//! It also keeps this instance's A/AAAA records at the DNS provider pointed
//! at its public addresses.
//!
//! ## Features
//!
//! - Host-header and SNI routing to round-robin backend pools
//! - Backend expiry window that rides out flapping registrations
//! - Atomic config installs and graceful systemd reloads
//! - Persisted DNS record bindings so restarts never duplicate records
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          haproxy-sync                            │
//! │                                                                  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────┐  │
//! │  │  Watch Loop  │──▶│  Reconciler  │──▶│ Render + Orchestrator│  │
//! │  │ services,    │   │ (pass lock)  │   │ atomic write, reload │  │
//! │  │ backends     │   └──────┬───────┘   └──────────────────────┘  │
//! │  └──────┬───────┘          │                                     │
//! │         │           ┌──────▼───────┐   ┌──────────────────────┐  │
//! │         └──────────▶│ Coordination │◀──│   DNS Synchronizer   │  │
//! │                     │    Store     │   │   A / AAAA records   │  │
//! │                     └──────────────┘   └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Keyspace
//!
//! ```text
//! <service-ns>/<name>/dns/<n>         hostname routed to the service
//! <service-ns>/<name>/cert            PEM bundle (optional)
//! <registration-ns>/<name>/<id>       "host:port" backend
//! <dns-ns>/<ipv4|ipv6>/<instance-id>  provider record id
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use haproxy_sync::{Config, ProxySync};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let cancel = CancellationToken::new();
//!
//!     let sync = ProxySync::new(config)?;
//!     sync.run(cancel).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod directory;
pub mod dns;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod reload;
pub mod render;
pub mod server;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod watch;

// Re-export main types
pub use config::{Config, DnsConfig, ProxyConfig, ReconcileConfig, StoreConfig, TelemetryConfig};
pub use directory::ServiceDirectory;
pub use error::{ProviderError, StoreError, SyncError};
pub use reconciler::{PassOutcome, Reconciler};
pub use server::{Components, ProxySync};
