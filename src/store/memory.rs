//! In-process coordination store.
//!
//! Holds leaves in a sorted map and derives directories from key prefixes.
//! Every write bumps a global index and is broadcast to active watchers.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::{CoordinationStore, Node, WatchAction, WatchEvent, Watcher};
use crate::error::StoreError;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Leaf {
    value: String,
    modified_index: u64,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    leaves: BTreeMap<String, Leaf>,
    index: u64,
}

/// Thread-safe in-memory store with watch support.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner::default())),
            events,
        }
    }

    /// Write a leaf and notify watchers.
    pub fn put(&self, key: &str, value: &str) {
        let key = normalize(key);
        let (action, index) = {
            let mut inner = self.inner.write();
            inner.index += 1;
            let index = inner.index;
            let previous = inner.leaves.insert(
                key.clone(),
                Leaf {
                    value: value.to_string(),
                    modified_index: index,
                },
            );
            let action = if previous.is_some() {
                WatchAction::Set
            } else {
                WatchAction::Create
            };
            (action, index)
        };
        self.publish(action, key, index);
    }

    /// Remove a leaf or a whole subtree and notify watchers.
    pub fn delete(&self, key: &str) -> bool {
        let key = normalize(key);
        let (removed, index) = {
            let mut inner = self.inner.write();
            let subtree = format!("{}/", key);
            let before = inner.leaves.len();
            inner
                .leaves
                .retain(|k, _| k != &key && !k.starts_with(&subtree));
            let removed = inner.leaves.len() != before;
            if removed {
                inner.index += 1;
            }
            (removed, inner.index)
        };
        if removed {
            self.publish(WatchAction::Delete, key, index);
        }
        removed
    }

    /// Emit a read-only notification, as some stores do on plain reads.
    pub fn touch(&self, key: &str) {
        let index = self.inner.read().index;
        self.publish(WatchAction::Get, normalize(key), index);
    }

    /// Leaf keys at or below `prefix`.
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize(prefix);
        let inner = self.inner.read();
        inner
            .leaves
            .keys()
            .filter(|k| is_under(k, &prefix))
            .cloned()
            .collect()
    }

    /// Current store revision.
    pub fn index(&self) -> u64 {
        self.inner.read().index
    }

    fn publish(&self, action: WatchAction, key: String, modified_index: u64) {
        debug!(key = %key, action = action.as_str(), "memory store event");
        // No receivers is fine
        let _ = self.events.send(WatchEvent {
            action,
            key,
            modified_index,
        });
    }
}

fn normalize(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn is_under(key: &str, prefix: &str) -> bool {
    prefix == "/"
        || key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Build the directory node at `key` from the leaves below it.
fn build_dir(key: &str, leaves: &BTreeMap<String, Leaf>) -> Node {
    let base = if key == "/" { "" } else { key };
    let mut children: BTreeMap<String, Vec<(&str, &Leaf)>> = BTreeMap::new();
    let mut modified_index = 0;

    for (leaf_key, leaf) in leaves.range(format!("{}/", base)..) {
        let Some(rest) = leaf_key.strip_prefix(base).and_then(|r| r.strip_prefix('/')) else {
            break;
        };
        let segment = rest.split('/').next().unwrap_or(rest);
        children
            .entry(format!("{}/{}", base, segment))
            .or_default()
            .push((leaf_key.as_str(), leaf));
        modified_index = modified_index.max(leaf.modified_index);
    }

    let children = children
        .into_iter()
        .map(|(child_key, entries)| match entries.as_slice() {
            [(only, leaf)] if *only == child_key => Node {
                key: child_key,
                value: Some(leaf.value.clone()),
                dir: false,
                children: Vec::new(),
                modified_index: leaf.modified_index,
            },
            _ => build_dir(&child_key, leaves),
        })
        .collect();

    Node {
        key: key.to_string(),
        value: None,
        dir: true,
        children,
        modified_index,
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_tree(&self, key: &str) -> Result<Node, StoreError> {
        let key = normalize(key);
        let inner = self.inner.read();

        if let Some(leaf) = inner.leaves.get(&key) {
            return Ok(Node {
                key,
                value: Some(leaf.value.clone()),
                dir: false,
                children: Vec::new(),
                modified_index: leaf.modified_index,
            });
        }

        let node = build_dir(&key, &inner.leaves);
        if node.children.is_empty() && key != "/" {
            return Err(StoreError::NotFound(key));
        }
        Ok(node)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = normalize(key);
        Ok(self.inner.read().leaves.get(&key).map(|l| l.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, value);
        Ok(())
    }

    async fn create(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let normalized = normalize(key);
        if self.inner.read().leaves.contains_key(&normalized) {
            return Err(StoreError::AlreadyExists(normalized));
        }
        self.put(&normalized, value);
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<Box<dyn Watcher>, StoreError> {
        Ok(Box::new(MemoryWatcher {
            prefix: normalize(prefix),
            events: self.events.subscribe(),
        }))
    }
}

/// Watcher over a [`MemoryStore`] prefix.
pub struct MemoryWatcher {
    prefix: String,
    events: broadcast::Receiver<WatchEvent>,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<WatchEvent, StoreError> {
        loop {
            match self.events.recv().await {
                Ok(event) if is_under(&event.key, &self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed events; report a write on the prefix so callers resync
                    debug!(skipped, prefix = %self.prefix, "memory watcher lagged");
                    return Ok(WatchEvent {
                        action: WatchAction::Update,
                        key: self.prefix.clone(),
                        modified_index: 0,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return Err(StoreError::Closed),
            }
        }
    }
}
