//! Coordination store interface.
//!
//! The store is a hierarchical key space. Directories have children, leaves
//! have values. Reads are recursive and sorted so that callers see a stable
//! ordering; watches report one event per write under a prefix.

use async_trait::async_trait;

use crate::error::StoreError;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// A node in the store's key space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    /// Full key, e.g. `/srv/web/backend-1`.
    pub key: String,
    /// Leaf value; `None` for directories.
    pub value: Option<String>,
    /// Whether this node is a directory.
    pub dir: bool,
    /// Children sorted by key (directories only).
    pub children: Vec<Node>,
    /// Store revision at which this node last changed.
    pub modified_index: u64,
}

impl Node {
    /// Last path segment of the key.
    pub fn name(&self) -> &str {
        last_segment(&self.key)
    }

    /// Direct child with the given last segment.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Values of all leaf children, in key order.
    pub fn leaf_values(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .filter(|c| !c.dir)
            .filter_map(|c| c.value.as_deref())
    }
}

/// Kind of change reported by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchAction {
    /// Read-only notification.
    Get,
    /// Key written.
    Set,
    /// Key created.
    Create,
    /// Existing key updated.
    Update,
    /// Key removed.
    Delete,
    /// Key removed by TTL.
    Expire,
    /// Conditional write.
    CompareAndSwap,
    /// Conditional delete.
    CompareAndDelete,
    /// Action this crate does not know about.
    Other(String),
}

impl WatchAction {
    /// Parse the store's action string.
    pub fn parse(action: &str) -> Self {
        match action {
            "get" => WatchAction::Get,
            "set" => WatchAction::Set,
            "create" => WatchAction::Create,
            "update" => WatchAction::Update,
            "delete" => WatchAction::Delete,
            "expire" => WatchAction::Expire,
            "compareAndSwap" => WatchAction::CompareAndSwap,
            "compareAndDelete" => WatchAction::CompareAndDelete,
            other => WatchAction::Other(other.to_string()),
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &str {
        match self {
            WatchAction::Get => "get",
            WatchAction::Set => "set",
            WatchAction::Create => "create",
            WatchAction::Update => "update",
            WatchAction::Delete => "delete",
            WatchAction::Expire => "expire",
            WatchAction::CompareAndSwap => "compareAndSwap",
            WatchAction::CompareAndDelete => "compareAndDelete",
            WatchAction::Other(other) => other,
        }
    }

    /// Whether the event carries no write and should be ignored.
    pub fn is_read_only(&self) -> bool {
        matches!(self, WatchAction::Get)
    }
}

/// One change observed by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened.
    pub action: WatchAction,
    /// Key that changed.
    pub key: String,
    /// Store revision of the change.
    pub modified_index: u64,
}

/// A recursive watch on one prefix.
#[async_trait]
pub trait Watcher: Send {
    /// Block until the next event under the prefix.
    async fn next(&mut self) -> Result<WatchEvent, StoreError>;
}

/// Client for the coordination store.
///
/// Implementations must be safe to share between listeners.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Recursive, sorted read of the subtree at `key`.
    async fn get_tree(&self, key: &str) -> Result<Node, StoreError>;

    /// Read a single leaf. Absent keys yield `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write a leaf.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Create a leaf only if it does not exist yet.
    async fn create(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Start a recursive watch on `prefix`.
    async fn watch(&self, prefix: &str) -> Result<Box<dyn Watcher>, StoreError>;
}

/// Last segment of a slash separated key.
pub fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Join a namespace and a relative path.
pub fn join_key(namespace: &str, rest: &str) -> String {
    format!(
        "{}/{}",
        namespace.trim_end_matches('/'),
        rest.trim_start_matches('/')
    )
}

/// First path segment of `key` below `namespace`, if `key` lies inside it.
pub fn first_segment_under<'a>(namespace: &str, key: &'a str) -> Option<&'a str> {
    let prefix = namespace.trim_end_matches('/');
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    rest.split('/').next().filter(|s| !s.is_empty())
}
