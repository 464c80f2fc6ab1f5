//! Typed shapes for the documents each collection holds.
//!
//! Known fields are typed so malformed writes are rejected; anything else a
//! console form sends is kept in `extra` and written back untouched.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    catalog::MockResponseEntry, error::StoreError, network_log::NetworkLogEntry,
    schema::Collection,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nudge {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A campaign grouping of nudges and cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignCollection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFolder {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Nudge(Nudge),
    Collection(CampaignCollection),
    Media(MediaItem),
    MediaFolder(MediaFolder),
    User(User),
    Error(ErrorReport),
    Network(NetworkLogEntry),
    MockResponse(MockResponseEntry),
}

impl Record {
    pub fn from_document(collection: Collection, document: &Value) -> Result<Self, StoreError> {
        Ok(match collection {
            Collection::Nudges => Self::Nudge(parse(collection, document)?),
            Collection::Collections => Self::Collection(parse(collection, document)?),
            Collection::Media => Self::Media(parse(collection, document)?),
            Collection::MediaFolders => Self::MediaFolder(parse(collection, document)?),
            Collection::Users => Self::User(parse(collection, document)?),
            Collection::Errors => Self::Error(parse(collection, document)?),
            Collection::Network => Self::Network(parse(collection, document)?),
            Collection::MockResponses => Self::MockResponse(parse(collection, document)?),
        })
    }

    pub fn collection(&self) -> Collection {
        match self {
            Self::Nudge(_) => Collection::Nudges,
            Self::Collection(_) => Collection::Collections,
            Self::Media(_) => Collection::Media,
            Self::MediaFolder(_) => Collection::MediaFolders,
            Self::User(_) => Collection::Users,
            Self::Error(_) => Collection::Errors,
            Self::Network(_) => Collection::Network,
            Self::MockResponse(_) => Collection::MockResponses,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Nudge(record) => &record.id,
            Self::Collection(record) => &record.id,
            Self::Media(record) => &record.id,
            Self::MediaFolder(record) => &record.id,
            Self::User(record) => &record.id,
            Self::Error(record) => &record.id,
            Self::Network(record) => &record.id,
            Self::MockResponse(record) => &record.key,
        }
    }

    pub fn to_document(&self) -> Result<Value, StoreError> {
        let value = match self {
            Self::Nudge(record) => serde_json::to_value(record),
            Self::Collection(record) => serde_json::to_value(record),
            Self::Media(record) => serde_json::to_value(record),
            Self::MediaFolder(record) => serde_json::to_value(record),
            Self::User(record) => serde_json::to_value(record),
            Self::Error(record) => serde_json::to_value(record),
            Self::Network(record) => serde_json::to_value(record),
            Self::MockResponse(record) => serde_json::to_value(record),
        };
        Ok(value?)
    }
}

fn parse<T: DeserializeOwned>(collection: Collection, document: &Value) -> Result<T, StoreError> {
    T::deserialize(document).map_err(|err| {
        StoreError::InvalidRecord(format!("invalid `{collection}` record: {err}"))
    })
}

/// Extracts the primary key of `document`, which must be a non-empty string.
pub fn document_key(collection: Collection, document: &Value) -> Result<String, StoreError> {
    let key_path = collection.key_path();
    match document.get(key_path) {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        _ => Err(StoreError::InvalidRecord(format!(
            "`{collection}` record is missing a non-empty `{key_path}`"
        ))),
    }
}

/// Index value for collections that carry a timestamp index.
pub(crate) fn document_timestamp(collection: Collection, document: &Value) -> Option<i64> {
    if !collection.has_timestamp_index() {
        return None;
    }
    document.get("timestamp").and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Record, document_key, document_timestamp};
    use crate::{error::StoreError, schema::Collection};

    #[test]
    fn unknown_fields_survive_a_typed_round_trip() {
        let document = json!({
            "id": "1",
            "firstName": "A",
            "preferences": {"theme": "dark"},
        });

        let record = Record::from_document(Collection::Users, &document).unwrap();
        let Record::User(user) = &record else {
            panic!("expected user variant, got {record:?}");
        };
        assert_eq!(user.first_name.as_deref(), Some("A"));
        assert_eq!(record.collection(), Collection::Users);
        assert_eq!(record.key(), "1");
        assert_eq!(record.to_document().unwrap(), document);
    }

    #[test]
    fn mistyped_known_field_is_rejected() {
        let err =
            Record::from_document(Collection::Nudges, &json!({"id": "n1", "title": 5})).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)), "{err:?}");
    }

    #[test]
    fn key_comes_from_the_collection_key_path() {
        assert_eq!(
            document_key(Collection::Users, &json!({"id": "u1"})).unwrap(),
            "u1"
        );
        assert_eq!(
            document_key(Collection::MockResponses, &json!({"key": "k1", "id": "x"})).unwrap(),
            "k1"
        );
        assert!(document_key(Collection::Users, &json!({"id": ""})).is_err());
        assert!(document_key(Collection::Users, &json!({"id": 7})).is_err());
    }

    #[test]
    fn timestamps_are_indexed_only_for_log_collections() {
        let document = json!({"id": "e1", "timestamp": 1_700_000_000_000i64});
        assert_eq!(
            document_timestamp(Collection::Errors, &document),
            Some(1_700_000_000_000)
        );
        assert_eq!(document_timestamp(Collection::Users, &document), None);
    }
}
