//! Append-only log of intercepted traffic, with promotion of successful
//! responses into the mock response catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    catalog::{CapturedRequest, CapturedResponse, MockResponseCatalog, MockResponseEntry, mock_key},
    config::{NetworkConfig, SharedNetworkConfig},
    error::StoreError,
    schema::Collection,
    store::{RecordStore, now_unix_ms},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkLogEntry {
    pub id: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub outcome: LogOutcome,
    pub operation: LoggedOperation,
}

impl NetworkLogEntry {
    pub fn is_successful_response(&self) -> bool {
        self.outcome == LogOutcome::Success
            && self.operation.kind == OperationKind::Response
            && self
                .operation
                .status
                .is_some_and(|status| (200..300).contains(&status))
    }
}

/// An entry before the recorder has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub id: Option<String>,
    pub timestamp: Option<i64>,
    pub outcome: LogOutcome,
    pub operation: LoggedOperation,
}

impl NewLogEntry {
    pub fn new(outcome: LogOutcome, operation: LoggedOperation) -> Self {
        Self {
            id: None,
            timestamp: None,
            outcome,
            operation,
        }
    }

    fn finish(self) -> NetworkLogEntry {
        let timestamp = self.timestamp.unwrap_or_else(now_unix_ms);
        let id = self
            .id
            .unwrap_or_else(|| format!("{timestamp}-{:08x}", rand::random::<u32>()));
        NetworkLogEntry {
            id,
            timestamp,
            outcome: self.outcome,
            operation: self.operation,
        }
    }
}

/// One request seen by the interception layer and what came back for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// Catalog key the response would be captured under.
    pub key: String,
    pub request: CapturedRequest,
    /// The response, or why none was produced.
    pub response: Result<CapturedResponse, String>,
    /// False for responses that were themselves replayed from the catalog.
    pub capturable: bool,
}

impl Exchange {
    fn log_entry(&self) -> NewLogEntry {
        let (outcome, status, headers, body) = match &self.response {
            Ok(response) => {
                let outcome = if response.status < 400 {
                    LogOutcome::Success
                } else {
                    LogOutcome::Error
                };
                (
                    outcome,
                    Some(response.status),
                    Some(response.headers.clone()),
                    Some(response.body.clone()),
                )
            }
            Err(message) => (
                LogOutcome::Error,
                None,
                None,
                Some(Value::String(message.clone())),
            ),
        };
        NewLogEntry::new(
            outcome,
            LoggedOperation {
                kind: OperationKind::Response,
                method: self.request.method.clone(),
                url: self.request.url.clone(),
                status,
                headers,
                body,
            },
        )
    }

    fn capture(&self) -> Option<MockResponseEntry> {
        if !self.capturable {
            return None;
        }
        let response = self.response.as_ref().ok()?;
        (200..300).contains(&response.status).then(|| {
            MockResponseEntry::capture(self.key.clone(), self.request.clone(), response.clone())
        })
    }
}

#[derive(Debug, Clone)]
pub struct NetworkRecorder {
    store: RecordStore,
    catalog: MockResponseCatalog,
    config: SharedNetworkConfig,
}

impl NetworkRecorder {
    pub fn new(store: RecordStore, catalog: MockResponseCatalog, config: SharedNetworkConfig) -> Self {
        Self {
            store,
            catalog,
            config,
        }
    }

    /// Appends an entry, assigning an id and timestamp when absent. A
    /// successful response is also promoted into the catalog while response
    /// capture is enabled.
    pub async fn log(&self, entry: NewLogEntry) -> Result<NetworkLogEntry, StoreError> {
        let entry = self.append(entry).await?;
        if self.flags().capture_responses && entry.is_successful_response() {
            self.promote(capture_from_log(&entry)).await?;
        }
        Ok(entry)
    }

    /// Records what the interception layer saw, honouring the traffic
    /// logging and response capture flags independently.
    pub async fn observe(&self, exchange: &Exchange) -> Result<Option<NetworkLogEntry>, StoreError> {
        let flags = self.flags();
        let logged = if flags.log_network_traffic {
            Some(self.append(exchange.log_entry()).await?)
        } else {
            None
        };
        if flags.capture_responses
            && let Some(capture) = exchange.capture()
        {
            self.promote(capture).await?;
        }
        Ok(logged)
    }

    pub async fn list(&self) -> Result<Vec<NetworkLogEntry>, StoreError> {
        decode_entries(self.store.chronological(Collection::Network).await?)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<NetworkLogEntry>, StoreError> {
        decode_entries(self.store.recent(Collection::Network, limit).await?)
    }

    /// Empties the log. Other collections are untouched.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.store.clear(Collection::Network).await?;
        tracing::info!(removed, "cleared network log");
        Ok(removed)
    }

    async fn append(&self, entry: NewLogEntry) -> Result<NetworkLogEntry, StoreError> {
        let entry = entry.finish();
        self.store
            .add(Collection::Network, serde_json::to_value(&entry)?)
            .await?;
        Ok(entry)
    }

    /// Stores a capture. A missing schema resets the store and retries the
    /// write once. Any other failure, lock contention included, is returned.
    async fn promote(&self, capture: MockResponseEntry) -> Result<MockResponseEntry, StoreError> {
        match self.catalog.store(capture.clone()).await {
            Err(err) if err.is_structural() => {
                tracing::warn!(key = %capture.key, "promotion failed, resetting store and retrying: {err}");
                self.store.connections().reset().await?;
                self.catalog.store(capture).await
            }
            other => other,
        }
    }

    fn flags(&self) -> NetworkConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn capture_from_log(entry: &NetworkLogEntry) -> MockResponseEntry {
    let operation = &entry.operation;
    MockResponseEntry::capture(
        mock_key(&operation.method, url_path(&operation.url), None),
        CapturedRequest {
            method: operation.method.clone(),
            url: operation.url.clone(),
            headers: BTreeMap::new(),
            body: Value::Null,
        },
        CapturedResponse {
            status: operation.status.unwrap_or(200),
            headers: operation.headers.clone().unwrap_or_default(),
            body: operation.body.clone().unwrap_or(Value::Null),
        },
    )
}

/// Path part of an absolute or origin-relative URL.
fn url_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    if without_scheme.len() == url.len() {
        return url;
    }
    without_scheme
        .find('/')
        .map_or("/", |start| &without_scheme[start..])
}

fn decode_entries(documents: Vec<Value>) -> Result<Vec<NetworkLogEntry>, StoreError> {
    documents
        .into_iter()
        .map(|document| Ok(serde_json::from_value(document)?))
        .collect()
}
