//! DNSimple v2 zone records client.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{DnsProvider, NewRecord, RecordId};
use crate::config::DnsConfig;
use crate::error::{ProviderError, SyncError};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ZoneRecord {
    id: RecordId,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Serialize)]
struct UpdateRecord<'a> {
    content: &'a str,
}

fn map_reqwest(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Http(e)
    }
}

/// Client for one DNSimple zone.
#[derive(Debug, Clone)]
pub struct DnsimpleClient {
    client: Client,
    base_url: String,
    account_id: String,
    zone: String,
    token: String,
}

impl DnsimpleClient {
    /// Create a client from configuration.
    pub fn new(config: &DnsConfig) -> Result<Self, SyncError> {
        if config.token.is_empty() {
            return Err(SyncError::Config("DNS provider token is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            account_id: config.account_id.clone(),
            zone: config.zone.clone(),
            token: config.token.clone(),
        })
    }

    fn records_url(&self) -> String {
        format!(
            "{}/v2/{}/zones/{}/records",
            self.base_url, self.account_id, self.zone
        )
    }

    fn record_url(&self, id: RecordId) -> String {
        format!("{}/{}", self.records_url(), id)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        request
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_reqwest)
    }
}

/// Decode a `{"data": ...}` record document, mapping error statuses.
async fn decode_record(
    id: Option<RecordId>,
    response: Response,
) -> Result<ZoneRecord, ProviderError> {
    let status = response.status();
    let text = response.text().await.map_err(map_reqwest)?;
    check_status(id, status, &text)?;
    parse_record(&text)
}

fn check_status(id: Option<RecordId>, status: StatusCode, body: &str) -> Result<(), ProviderError> {
    if status.is_success() {
        return Ok(());
    }
    match (status, id) {
        (StatusCode::NOT_FOUND, Some(id)) => Err(ProviderError::NotFound(id)),
        _ => Err(ProviderError::Api {
            status: status.as_u16(),
            message: body.trim().to_string(),
        }),
    }
}

fn parse_record(text: &str) -> Result<ZoneRecord, ProviderError> {
    serde_json::from_str::<Envelope<ZoneRecord>>(text)
        .map(|envelope| envelope.data)
        .map_err(|e| ProviderError::Api {
            status: 200,
            message: format!("malformed record document: {e}"),
        })
}

#[async_trait]
impl DnsProvider for DnsimpleClient {
    async fn create(&self, record: &NewRecord) -> Result<RecordId, ProviderError> {
        let body = CreateRecord {
            name: &record.name,
            kind: record.kind.as_str(),
            content: &record.content,
            ttl: record.ttl,
        };
        let response = self
            .send(self.client.post(self.records_url()).json(&body))
            .await?;
        Ok(decode_record(None, response).await?.id)
    }

    async fn get(&self, id: RecordId) -> Result<String, ProviderError> {
        let response = self.send(self.client.get(self.record_url(id))).await?;
        Ok(decode_record(Some(id), response).await?.content)
    }

    async fn update(&self, id: RecordId, content: &str) -> Result<(), ProviderError> {
        let response = self
            .send(
                self.client
                    .patch(self.record_url(id))
                    .json(&UpdateRecord { content }),
            )
            .await?;
        decode_record(Some(id), response).await.map(|_| ())
    }
}
