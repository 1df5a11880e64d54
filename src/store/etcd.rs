//! etcd v2 keys API client.
//!
//! Talks plain HTTP/JSON to `/v2/keys`. Endpoints are tried in order for every
//! request, so a single unreachable member does not fail reads or watches.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CoordinationStore, Node, WatchAction, WatchEvent, Watcher};
use crate::config::StoreConfig;
use crate::error::{StoreError, SyncError};

/// etcd error codes this client acts on.
mod codes {
    pub const KEY_NOT_FOUND: u64 = 100;
    pub const NODE_EXIST: u64 = 105;
    pub const EVENT_INDEX_CLEARED: u64 = 401;
}

const ETCD_INDEX_HEADER: &str = "x-etcd-index";

#[derive(Debug, Deserialize)]
struct KeysResponse {
    action: String,
    node: RawNode,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default, rename = "modifiedIndex")]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    index: u64,
}

impl From<RawNode> for Node {
    fn from(raw: RawNode) -> Self {
        let mut children: Vec<Node> = raw.nodes.into_iter().map(Node::from).collect();
        children.sort_by(|a, b| a.key.cmp(&b.key));
        Node {
            key: if raw.key.is_empty() {
                "/".to_string()
            } else {
                raw.key
            },
            value: raw.value,
            dir: raw.dir,
            children,
            modified_index: raw.modified_index,
        }
    }
}

fn map_reqwest(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Http(e)
    }
}

fn map_error_body(key: &str, body: ErrorBody) -> StoreError {
    match body.error_code {
        codes::KEY_NOT_FOUND => StoreError::NotFound(key.to_string()),
        codes::NODE_EXIST => StoreError::AlreadyExists(key.to_string()),
        code => StoreError::Api {
            code,
            message: match body.cause {
                Some(cause) => format!("{} ({})", body.message, cause),
                None => body.message,
            },
        },
    }
}

/// The cluster revision reported by any keys API response, success or error.
fn header_index(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Decode a keys API response or its error document.
async fn decode(key: &str, response: Response) -> Result<KeysResponse, StoreError> {
    let status = response.status();
    let text = response.text().await.map_err(map_reqwest)?;

    if status.is_success() {
        return serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()));
    }

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => Err(map_error_body(key, body)),
        Err(_) => Err(StoreError::Api {
            code: u64::from(status.as_u16()),
            message: text,
        }),
    }
}

/// Shared HTTP plumbing for the store and its watchers.
#[derive(Debug, Clone)]
struct Transport {
    client: Client,
    endpoints: Vec<String>,
}

impl Transport {
    fn url(endpoint: &str, key: &str) -> String {
        format!(
            "{}/v2/keys/{}",
            endpoint.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    /// Send the request built by `build` to each endpoint until one answers.
    async fn send<F>(&self, key: &str, timeout: Duration, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let mut last_error = StoreError::Decode("no endpoints configured".to_string());

        for endpoint in &self.endpoints {
            let request = build(&self.client, Self::url(endpoint, key)).timeout(timeout);
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => return Err(StoreError::Timeout),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    last_error = StoreError::Http(e);
                }
            }
        }

        Err(last_error)
    }
}

/// Coordination store backed by an etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    transport: Transport,
    request_timeout: Duration,
    watch_timeout: Duration,
}

impl EtcdStore {
    /// Create a client for the configured endpoints.
    pub fn new(config: &StoreConfig) -> Result<Self, SyncError> {
        if config.endpoints.is_empty() {
            return Err(SyncError::Config("no etcd endpoints configured".into()));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            transport: Transport {
                client,
                endpoints: config.endpoints.clone(),
            },
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            watch_timeout: Duration::from_secs(config.watch_timeout_secs),
        })
    }

    async fn write(&self, key: &str, value: &str, only_if_absent: bool) -> Result<(), StoreError> {
        let response = self
            .transport
            .send(key, self.request_timeout, |client, url| {
                let mut form = vec![("value", value)];
                if only_if_absent {
                    form.push(("prevExist", "false"));
                }
                client.request(Method::PUT, url).form(&form)
            })
            .await?;
        decode(key, response).await.map(|_| ())
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_tree(&self, key: &str) -> Result<Node, StoreError> {
        let response = self
            .transport
            .send(key, self.request_timeout, |client, url| {
                client
                    .get(url)
                    .query(&[("recursive", "true"), ("sorted", "true")])
            })
            .await?;
        Ok(decode(key, response).await?.node.into())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let response = self
            .transport
            .send(key, self.request_timeout, |client, url| client.get(url))
            .await?;
        match decode(key, response).await {
            Ok(body) => Ok(body.node.value),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, value, false).await
    }

    async fn create(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, value, true).await
    }

    async fn watch(&self, prefix: &str) -> Result<Box<dyn Watcher>, StoreError> {
        // Pin the watch to the revision current now, so writes made before
        // the first long-poll is sent are still delivered
        let response = self
            .transport
            .send(prefix, self.request_timeout, |client, url| client.get(url))
            .await?;
        let index = header_index(response.headers());
        if index.is_none() {
            warn!(prefix = %prefix, "etcd response carried no X-Etcd-Index, watching from now");
        }

        Ok(Box::new(EtcdWatcher {
            transport: self.transport.clone(),
            prefix: prefix.to_string(),
            wait_index: index.map(|i| i + 1),
            timeout: self.watch_timeout,
        }))
    }
}

/// Long-polling recursive watch on one prefix.
pub struct EtcdWatcher {
    transport: Transport,
    prefix: String,
    wait_index: Option<u64>,
    timeout: Duration,
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next(&mut self) -> Result<WatchEvent, StoreError> {
        let wait_index = self.wait_index.map(|i| i.to_string());
        let response = self
            .transport
            .send(&self.prefix, self.timeout, |client, url| {
                let request = client
                    .get(url)
                    .query(&[("wait", "true"), ("recursive", "true")]);
                match &wait_index {
                    Some(index) => request.query(&[("waitIndex", index.as_str())]),
                    None => request,
                }
            })
            .await?;

        let status = response.status();
        let text = response.text().await.map_err(map_reqwest)?;

        if status == StatusCode::OK {
            let body: KeysResponse =
                serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))?;
            self.wait_index = Some(body.node.modified_index + 1);
            return Ok(WatchEvent {
                action: WatchAction::parse(&body.action),
                key: body.node.key,
                modified_index: body.node.modified_index,
            });
        }

        let body: ErrorBody = serde_json::from_str(&text).map_err(|_| StoreError::Api {
            code: u64::from(status.as_u16()),
            message: text.clone(),
        })?;

        if body.error_code == codes::EVENT_INDEX_CLEARED {
            // History compacted past our index: restart from the current
            // revision and report a write so the caller does a full read.
            warn!(
                prefix = %self.prefix,
                index = body.index,
                "etcd event index cleared, resyncing watch"
            );
            self.wait_index = Some(body.index + 1);
            return Ok(WatchEvent {
                action: WatchAction::Update,
                key: self.prefix.clone(),
                modified_index: body.index,
            });
        }

        Err(map_error_body(&self.prefix, body))
    }
}
