//! Service descriptors and their parsing from the coordination store.
//!
//! Service subtree layout:
//!
//! ```text
//! <service-ns>/<name>/dns/<n>   -> hostname
//! <service-ns>/<name>/cert      -> PEM text (optional)
//! ```
//!
//! Backends live in a separate registration subtree:
//!
//! ```text
//! <registration-ns>/<name>/<backend-id>   -> host:port
//! ```

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

use crate::backend::{Backend, BackendSet};
use crate::store::Node;

/// Child holding the DNS hostnames of a service.
pub const DNS_CHILD: &str = "dns";

/// Child holding the PEM certificate of a service.
pub const CERT_CHILD: &str = "cert";

/// Reasons a service subtree is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Node key has no usable last segment
    #[error("cannot determine service name from key {0:?}")]
    MissingName(String),

    /// Service has no DNS hostnames
    #[error("service {0} has no DNS hostnames")]
    NoHostnames(String),

    /// Registration namespace lists no backends
    #[error("service {0} has no backends")]
    NoBackends(String),
}

impl ParseError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::MissingName(_) => "missing_name",
            ParseError::NoHostnames(_) => "no_hostnames",
            ParseError::NoBackends(_) => "no_backends",
        }
    }
}

/// Service definition as read from the service subtree, before backends are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Service name.
    pub name: String,
    /// Hostnames the service answers to.
    pub hostnames: BTreeSet<String>,
    /// Inline PEM certificate; empty when absent.
    pub cert: String,
}

impl ServiceDefinition {
    /// Parse one child of the service namespace.
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        let name = node.name();
        if name.is_empty() {
            return Err(ParseError::MissingName(node.key.clone()));
        }

        let hostnames: BTreeSet<String> = node
            .child(DNS_CHILD)
            .map(|dns| {
                dns.leaf_values()
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        if hostnames.is_empty() {
            return Err(ParseError::NoHostnames(name.to_string()));
        }

        let cert = node
            .child(CERT_CHILD)
            .and_then(|c| c.value.clone())
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            hostnames,
            cert,
        })
    }

    /// Attach a backend reading, completing the service.
    pub fn with_backends(self, backends: BackendSet) -> Result<Service, ParseError> {
        if backends.is_empty() {
            return Err(ParseError::NoBackends(self.name));
        }
        Ok(Service {
            name: self.name,
            hostnames: self.hostnames,
            cert: self.cert,
            backends,
        })
    }
}

/// Parse the registration subtree of one service into a backend set seen at `now`.
pub fn parse_backends(node: &Node, now: DateTime<Utc>) -> BackendSet {
    node.leaf_values()
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(|endpoint| Backend::seen_at(endpoint, now))
        .collect()
}

/// A routable unit: hostnames, optional certificate and live backends.
///
/// Equality compares name, certificate, the hostname set and backend
/// identities. Backend timestamps never make two services differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Unique service name.
    pub name: String,
    /// Hostnames the service answers to. Never empty.
    pub hostnames: BTreeSet<String>,
    /// Inline PEM certificate; empty when absent.
    pub cert: String,
    /// Live backends.
    pub backends: BackendSet,
}

impl Service {
    /// Whether a certificate file should be written for this service.
    pub fn has_cert(&self) -> bool {
        !self.cert.trim().is_empty()
    }

    /// File name of this service's certificate inside the certs directory.
    pub fn cert_file_name(&self) -> String {
        format!("{}.pem", self.name)
    }

    /// Fold a previous observation into this fresh one.
    ///
    /// Backends are merged with the previous set and entries older than
    /// `max_age` are dropped, so a backend missing from one read stays
    /// routable until the window passes.
    pub fn reconcile_with(
        mut self,
        previous: &Service,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Service {
        self.backends = previous
            .backends
            .merge(&self.backends)
            .expire_at(now, max_age);
        self
    }
}
