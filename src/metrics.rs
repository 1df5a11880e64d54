//! Metrics instrumentation for haproxy-sync.
//!
//! All metrics are prefixed with `haproxy_sync.`

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::time::Instant;

use crate::dns::RecordKind;

/// Register descriptions with the installed recorder.
pub fn describe() {
    describe_counter!(
        "haproxy_sync.reconcile.pass.count",
        "Reconciliation passes by result"
    );
    describe_histogram!(
        "haproxy_sync.reconcile.pass.duration.seconds",
        Unit::Seconds,
        "Time spent in one reconciliation pass"
    );
    describe_counter!(
        "haproxy_sync.watch.event.count",
        "Watch events that triggered a pass"
    );
    describe_counter!(
        "haproxy_sync.watch.event.ignored.count",
        "Watch events filtered out before reconciliation"
    );
    describe_counter!(
        "haproxy_sync.watch.reconnect.count",
        "Watch (re)starts by reason"
    );
    describe_counter!(
        "haproxy_sync.service.parse_failure.count",
        "Service subtrees skipped during a load"
    );
    describe_counter!("haproxy_sync.reload.count", "Proxy reload attempts");
    describe_counter!(
        "haproxy_sync.dns.operation.count",
        "DNS record operations by kind and result"
    );
    describe_gauge!(
        "haproxy_sync.directory.services.count",
        "Services in the directory"
    );
    describe_gauge!(
        "haproxy_sync.directory.backends.count",
        "Backends across all services"
    );
}

/// Record a finished reconciliation pass.
pub fn record_pass(result: PassResult, duration: std::time::Duration) {
    let result_str = match result {
        PassResult::Changed => "changed",
        PassResult::Unchanged => "unchanged",
        PassResult::Error => "error",
    };

    counter!("haproxy_sync.reconcile.pass.count", "result" => result_str).increment(1);
    histogram!("haproxy_sync.reconcile.pass.duration.seconds").record(duration.as_secs_f64());
}

/// Reconciliation pass result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum PassResult {
    /// Directory changed and artifacts were installed.
    Changed,
    /// Nothing observable changed.
    Unchanged,
    /// Pass failed.
    Error,
}

/// Record a watch event that triggers reconciliation.
pub fn record_watch_event(tree: &str, action: &str) {
    counter!(
        "haproxy_sync.watch.event.count",
        "tree" => tree.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record a watch event that was filtered out.
pub fn record_watch_ignored(tree: &str, reason: IgnoreReason) {
    let reason_str = match reason {
        IgnoreReason::ReadOnly => "read_only",
        IgnoreReason::OutsideNamespace => "outside_namespace",
        IgnoreReason::UntrackedService => "untracked_service",
    };

    counter!(
        "haproxy_sync.watch.event.ignored.count",
        "tree" => tree.to_string(),
        "reason" => reason_str
    )
        .increment(1);
}

/// Why a watch event did not trigger a pass.
#[derive(Debug, Clone, Copy)]
pub enum IgnoreReason {
    /// Read-only (`get`) notification.
    ReadOnly,
    /// Key is not below the watched namespace.
    OutsideNamespace,
    /// Backend change for a service not in the directory.
    UntrackedService,
}

/// Record a watch (re)start.
pub fn record_watch_reconnect(tree: &str, reason: ReconnectReason) {
    let reason_str = match reason {
        ReconnectReason::InitialConnect => "initial_connect",
        ReconnectReason::Error => "error",
        ReconnectReason::Timeout => "timeout",
    };

    counter!(
        "haproxy_sync.watch.reconnect.count",
        "tree" => tree.to_string(),
        "reason" => reason_str
    )
        .increment(1);
}

/// Reconnect reasons.
#[derive(Debug, Clone, Copy)]
pub enum ReconnectReason {
    /// First watch on the tree.
    InitialConnect,
    /// Watch failed.
    Error,
    /// Long-poll elapsed without an event.
    Timeout,
}

/// Record a service subtree that failed to parse.
pub fn record_parse_failure(reason: &'static str) {
    counter!("haproxy_sync.service.parse_failure.count", "reason" => reason).increment(1);
}

/// Record a proxy reload attempt.
pub fn record_reload(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("haproxy_sync.reload.count", "result" => result).increment(1);
}

/// Record a DNS synchronizer operation.
pub fn record_dns_operation(kind: RecordKind, op: DnsOperation, success: bool) {
    let op_str = match op {
        DnsOperation::Bind => "bind",
        DnsOperation::Create => "create",
        DnsOperation::Update => "update",
        DnsOperation::Noop => "noop",
    };
    let result = if success { "success" } else { "failure" };

    counter!(
        "haproxy_sync.dns.operation.count",
        "kind" => kind.as_str(),
        "op" => op_str,
        "result" => result
    )
    .increment(1);
}

/// DNS synchronizer operations.
#[derive(Debug, Clone, Copy)]
pub enum DnsOperation {
    /// Persisted record id adopted.
    Bind,
    /// New provider record created.
    Create,
    /// Provider record content replaced.
    Update,
    /// Provider record already correct.
    Noop,
}

/// Record directory sizes.
pub fn record_directory_counts(services: usize, backends: usize) {
    gauge!("haproxy_sync.directory.services.count").set(services as f64);
    gauge!("haproxy_sync.directory.backends.count").set(backends as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
