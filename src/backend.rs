//! Backend sets and their liveness bookkeeping.
//!
//! A backend is identified by its endpoint string alone. The `last_seen`
//! timestamp only decides which entry survives a merge and when an entry
//! expires; it never takes part in equality.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Default age, in seconds, after which an unseen backend is dropped.
pub const DEFAULT_MAX_AGE_SECS: i64 = 3600;

/// One live service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Endpoint string, e.g. `10.0.0.1:80`.
    pub endpoint: String,
    /// Last time this endpoint was observed in the registration namespace.
    pub last_seen: DateTime<Utc>,
}

impl Backend {
    /// Backend observed at an explicit time.
    pub fn seen_at(endpoint: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        Self {
            endpoint: endpoint.into(),
            last_seen,
        }
    }

    /// Backend known only by its endpoint; `last_seen` defaults to now.
    pub fn from_endpoint(endpoint: impl Into<String>) -> Self {
        Self::seen_at(endpoint, Utc::now())
    }
}

/// The set of live backends behind one service.
///
/// Entries are keyed by endpoint, so an endpoint appears at most once.
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    entries: HashMap<String, DateTime<Utc>>,
}

impl BackendSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a backend, keeping the newer timestamp on duplicate endpoints.
    pub fn insert(&mut self, backend: Backend) {
        self.entries
            .entry(backend.endpoint)
            .and_modify(|seen| {
                if backend.last_seen > *seen {
                    *seen = backend.last_seen;
                }
            })
            .or_insert(backend.last_seen);
    }

    /// Number of distinct endpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no endpoints.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the endpoint is present.
    pub fn contains(&self, endpoint: &str) -> bool {
        self.entries.contains_key(endpoint)
    }

    /// Last-seen time for an endpoint.
    pub fn last_seen(&self, endpoint: &str) -> Option<DateTime<Utc>> {
        self.entries.get(endpoint).copied()
    }

    /// Endpoints in sorted order.
    pub fn endpoints(&self) -> Vec<&str> {
        let mut endpoints: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        endpoints.sort_unstable();
        endpoints
    }

    /// Backends in endpoint order.
    pub fn backends(&self) -> Vec<Backend> {
        self.endpoints()
            .into_iter()
            .map(|endpoint| Backend::seen_at(endpoint, self.entries[endpoint]))
            .collect()
    }

    /// Union of both sets; shared endpoints carry the newest timestamp.
    pub fn merge(&self, newer: &BackendSet) -> BackendSet {
        let mut merged = self.clone();
        for (endpoint, seen) in &newer.entries {
            merged.insert(Backend::seen_at(endpoint.clone(), *seen));
        }
        merged
    }

    /// Drop entries last seen more than `max_age` before `now`.
    pub fn expire_at(&self, now: DateTime<Utc>, max_age: Duration) -> BackendSet {
        let entries = self
            .entries
            .iter()
            .filter(|(_, seen)| now.signed_duration_since(**seen) < max_age)
            .map(|(endpoint, seen)| (endpoint.clone(), *seen))
            .collect();
        BackendSet { entries }
    }
}

impl PartialEq for BackendSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.keys().all(|endpoint| other.entries.contains_key(endpoint))
    }
}

impl Eq for BackendSet {}

impl FromIterator<Backend> for BackendSet {
    fn from_iter<I: IntoIterator<Item = Backend>>(iter: I) -> Self {
        let mut set = BackendSet::new();
        for backend in iter {
            set.insert(backend);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn max_age() -> Duration {
        Duration::seconds(DEFAULT_MAX_AGE_SECS)
    }

    fn set(entries: &[(&str, i64)]) -> BackendSet {
        entries
            .iter()
            .map(|(endpoint, secs)| Backend::seen_at(*endpoint, t(*secs)))
            .collect()
    }

    #[test]
    fn test_insert_deduplicates_endpoints() {
        let s = set(&[("10.0.0.1:80", 0), ("10.0.0.1:80", 5)]);
        assert_eq!(s.len(), 1);
        assert_eq!(s.last_seen("10.0.0.1:80"), Some(t(5)));
    }

    #[test]
    fn test_merge_takes_newer_timestamp() {
        let old = set(&[("a:80", 0), ("b:80", 0)]);
        let new = set(&[("a:80", 30)]);

        let merged = old.merge(&new);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.last_seen("a:80"), Some(t(30)));
        assert_eq!(merged.last_seen("b:80"), Some(t(0)));

        // Older entry on the right never overwrites a newer one
        let merged = new.merge(&old);
        assert_eq!(merged.last_seen("a:80"), Some(t(30)));
    }

    #[test]
    fn test_merge_is_commutative_on_identity() {
        let a = set(&[("a:80", 0), ("b:80", 10)]);
        let b = set(&[("b:80", 20), ("c:80", 5)]);

        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).endpoints(), vec!["a:80", "b:80", "c:80"]);
        assert_eq!(a.merge(&b).last_seen("b:80"), Some(t(20)));
        assert_eq!(b.merge(&a).last_seen("b:80"), Some(t(20)));
    }

    #[test]
    fn test_expire_drops_stale_entries() {
        let s = set(&[("old:80", 0), ("fresh:80", 3000)]);
        let now = t(3700);

        let expired = s.expire_at(now, max_age());
        assert_eq!(expired.endpoints(), vec!["fresh:80"]);
    }

    #[test]
    fn test_expire_is_idempotent() {
        let s = set(&[("a:80", 0), ("b:80", 1800), ("c:80", 3599)]);
        let now = t(3600);

        let once = s.expire_at(now, max_age());
        let twice = once.expire_at(now, max_age());
        assert_eq!(once, twice);
        assert_eq!(once.endpoints(), vec!["b:80", "c:80"]);
    }

    #[test]
    fn test_equality_ignores_order_and_timestamps() {
        let a = set(&[("a:80", 0), ("b:80", 0)]);
        let b = set(&[("b:80", 99), ("a:80", 42)]);
        assert_eq!(a, b);

        let c = set(&[("a:80", 0)]);
        assert_ne!(a, c);

        let d = set(&[("a:80", 0), ("z:80", 0)]);
        assert_ne!(a, d);
    }

    #[test]
    fn test_from_endpoint_defaults_to_now() {
        let before = Utc::now();
        let backend = Backend::from_endpoint("10.0.0.1:80");
        assert!(backend.last_seen >= before);
        assert!(backend.last_seen <= Utc::now());
    }

    #[test]
    fn test_backends_are_sorted_by_endpoint() {
        let s = set(&[("c:80", 0), ("a:80", 1), ("b:80", 2)]);
        let endpoints: Vec<String> = s.backends().into_iter().map(|b| b.endpoint).collect();
        assert_eq!(endpoints, vec!["a:80", "b:80", "c:80"]);
    }
}
