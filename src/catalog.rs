//! Captured request/response pairs keyed by logical endpoint, with a diff
//! against the previous capture and a review workflow.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::{
    error::StoreError,
    routing::PathParams,
    schema::Collection,
    store::{RecordStore, now_unix_ms},
};

/// Headers that change on every response and never count as a difference.
const VOLATILE_HEADERS: &[&str] = &[
    "age",
    "cf-ray",
    "connection",
    "content-length",
    "date",
    "etag",
    "expires",
    "keep-alive",
    "last-modified",
    "server-timing",
    "set-cookie",
    "transfer-encoding",
    "x-request-id",
    "x-response-time",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockMetadata {
    pub captured: i64,
    pub reviewed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<i64>,
    #[serde(default)]
    pub has_existing_version: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differences: Option<EntryDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockResponseEntry {
    pub key: String,
    pub request: CapturedRequest,
    pub response: CapturedResponse,
    pub metadata: MockMetadata,
}

impl MockResponseEntry {
    /// A fresh, unreviewed capture taken now.
    pub fn capture(key: String, request: CapturedRequest, response: CapturedResponse) -> Self {
        Self {
            key,
            request,
            response,
            metadata: MockMetadata {
                captured: now_unix_ms(),
                reviewed: false,
                approved: None,
                reviewed_at: None,
                has_existing_version: false,
                differences: None,
            },
        }
    }

    pub fn is_approved(&self) -> bool {
        self.metadata.reviewed && self.metadata.approved == Some(true)
    }
}

/// Result of comparing a new capture with the stored one. `equal` with no
/// changes is the "no differences" shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDiff {
    pub equal: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub existing: Value,
    pub captured: Value,
    /// JSON pointers of the leaves that differ.
    pub paths: Vec<String>,
}

/// Deterministic catalog key for a logical endpoint.
///
/// The method is case-folded and the template loses its query string and
/// trailing slash, so `get /users/` and `GET /users?page=2` share a key.
pub fn mock_key(method: &str, template: &str, discriminator: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hash_tagged_str(&mut hasher, b"method", &method.to_ascii_uppercase());
    hash_tagged_str(&mut hasher, b"template", normalized_template(template));
    if let Some(discriminator) = discriminator {
        hash_tagged_str(&mut hasher, b"discriminator", discriminator);
    }
    hex_encode(&hasher.finalize())
}

/// Key for a request matched by a route; the `id` parameter identifies the
/// resource, so it is folded in as the discriminator.
pub fn key_for_route(method: &str, template: &str, params: &PathParams) -> String {
    mock_key(method, template, params.get("id"))
}

fn normalized_template(template: &str) -> &str {
    let path = template.split(['?', '#']).next().unwrap_or_default();
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn hash_tagged_str(hasher: &mut Sha256, tag: &[u8], value: &str) {
    hash_len_prefixed(hasher, tag);
    hash_len_prefixed(hasher, value.as_bytes());
}

fn hash_len_prefixed(hasher: &mut Sha256, value: &[u8]) {
    hasher.update(u64::try_from(value.len()).unwrap_or(u64::MAX).to_le_bytes());
    hasher.update(value);
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

/// Decodes a captured body: JSON when it parses, text otherwise, null when empty.
pub fn body_to_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

pub fn diff_entries(existing: &MockResponseEntry, captured: &MockResponseEntry) -> EntryDiff {
    let fields = [
        (
            "request.body",
            existing.request.body.clone(),
            captured.request.body.clone(),
        ),
        (
            "request.headers",
            stable_headers(&existing.request.headers),
            stable_headers(&captured.request.headers),
        ),
        (
            "response.status",
            Value::from(existing.response.status),
            Value::from(captured.response.status),
        ),
        (
            "response.body",
            existing.response.body.clone(),
            captured.response.body.clone(),
        ),
        (
            "response.headers",
            stable_headers(&existing.response.headers),
            stable_headers(&captured.response.headers),
        ),
    ];

    let mut changes = BTreeMap::new();
    for (field, before, after) in fields {
        let mut paths = Vec::new();
        collect_differences(&before, &after, String::new(), &mut paths);
        if !paths.is_empty() {
            changes.insert(
                field.to_owned(),
                FieldChange {
                    existing: before,
                    captured: after,
                    paths,
                },
            );
        }
    }

    EntryDiff {
        equal: changes.is_empty(),
        changes,
    }
}

fn stable_headers(headers: &BTreeMap<String, String>) -> Value {
    headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .filter(|(name, _)| !VOLATILE_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name, Value::String(value.clone())))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn collect_differences(before: &Value, after: &Value, pointer: String, out: &mut Vec<String>) {
    match (before, after) {
        (Value::Object(left), Value::Object(right)) => {
            let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
            for key in keys {
                let child = format!("{pointer}/{}", escape_pointer(key));
                match (left.get(key), right.get(key)) {
                    (Some(l), Some(r)) => collect_differences(l, r, child, out),
                    _ => out.push(child),
                }
            }
        }
        (Value::Array(left), Value::Array(right)) => {
            for index in 0..left.len().max(right.len()) {
                let child = format!("{pointer}/{index}");
                match (left.get(index), right.get(index)) {
                    (Some(l), Some(r)) => collect_differences(l, r, child, out),
                    _ => out.push(child),
                }
            }
        }
        _ if before != after => out.push(pointer),
        _ => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[derive(Debug, Clone)]
pub struct MockResponseCatalog {
    store: RecordStore,
}

impl MockResponseCatalog {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    /// Saves a capture. If the key is already known, the diff against the
    /// stored version is recorded. An unchanged re-capture keeps its review
    /// state; anything else goes back to unreviewed.
    pub async fn store(&self, mut entry: MockResponseEntry) -> Result<MockResponseEntry, StoreError> {
        let previous = self.get(&entry.key).await?;
        let metadata = &mut entry.metadata;
        metadata.reviewed = false;
        metadata.approved = None;
        metadata.reviewed_at = None;
        metadata.has_existing_version = false;
        metadata.differences = None;

        if let Some(existing) = previous {
            let diff = diff_entries(&existing, &entry);
            tracing::debug!(key = %entry.key, equal = diff.equal, "re-captured mock response");
            let metadata = &mut entry.metadata;
            metadata.has_existing_version = true;
            if diff.equal {
                metadata.reviewed = existing.metadata.reviewed;
                metadata.approved = existing.metadata.approved;
                metadata.reviewed_at = existing.metadata.reviewed_at;
            }
            metadata.differences = Some(diff);
        } else {
            tracing::debug!(key = %entry.key, "captured new mock response");
        }

        self.store
            .put(Collection::MockResponses, serde_json::to_value(&entry)?)
            .await?;
        Ok(entry)
    }

    /// Marks an entry reviewed. Calling it again just re-sets `approved`.
    pub async fn review(&self, key: &str, approved: bool) -> Result<MockResponseEntry, StoreError> {
        let mut entry = self.get(key).await?.ok_or_else(|| StoreError::NotFound {
            collection: Collection::MockResponses,
            id: key.to_owned(),
        })?;
        entry.metadata.reviewed = true;
        entry.metadata.approved = Some(approved);
        entry.metadata.reviewed_at = Some(now_unix_ms());

        self.store
            .put(Collection::MockResponses, serde_json::to_value(&entry)?)
            .await?;
        tracing::info!(key, approved, "reviewed mock response");
        Ok(entry)
    }

    pub async fn get(&self, key: &str) -> Result<Option<MockResponseEntry>, StoreError> {
        self.store
            .get(Collection::MockResponses, key)
            .await?
            .map(decode_entry)
            .transpose()
    }

    /// The entry for `key` if it has been reviewed and approved.
    pub async fn approved(&self, key: &str) -> Result<Option<MockResponseEntry>, StoreError> {
        Ok(self.get(key).await?.filter(MockResponseEntry::is_approved))
    }

    pub async fn list(&self) -> Result<Vec<MockResponseEntry>, StoreError> {
        self.store
            .get_all(Collection::MockResponses)
            .await?
            .into_iter()
            .map(decode_entry)
            .collect()
    }

    pub async fn pending(&self) -> Result<Vec<MockResponseEntry>, StoreError> {
        let mut entries = self.list().await?;
        entries.retain(|entry| !entry.metadata.reviewed);
        Ok(entries)
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(Collection::MockResponses, key).await
    }

    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.store.clear(Collection::MockResponses).await
    }
}

fn decode_entry(document: Value) -> Result<MockResponseEntry, StoreError> {
    Ok(serde_json::from_value(document)?)
}
