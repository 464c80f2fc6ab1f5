//! Addressing and mutating values nested inside a stored document.
//!
//! A path is an ordered list of segments. The first segment is always the
//! record id; the remaining segments walk object keys and array indices.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Key(key) => key.parse().ok(),
        }
    }

    fn as_key(&self) -> String {
        match self {
            Self::Index(index) => index.to_string(),
            Self::Key(key) => key.clone(),
        }
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Key(key) => write!(f, ".{key}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        Self::Key(value.to_owned())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl From<usize> for PathSegment {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    Empty,
    MissingRecordId,
    /// The path names the record itself, with no field to update.
    NoField,
    ImmutableKey(String),
    MissingKey { at: String },
    NotAContainer { at: String },
    IndexOutOfRange { at: String, index: usize, len: usize },
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("path is empty"),
            Self::MissingRecordId => f.write_str("path must start with a record id"),
            Self::NoField => f.write_str("path must address a field inside the record"),
            Self::ImmutableKey(key) => write!(f, "record key field `{key}` cannot be changed"),
            Self::MissingKey { at } => write!(f, "no value at `{at}`"),
            Self::NotAContainer { at } => {
                write!(f, "value at `{at}` is not an object or array")
            }
            Self::IndexOutOfRange { at, index, len } => {
                write!(f, "index {index} out of range at `{at}` (len {len})")
            }
        }
    }
}

impl std::error::Error for PathError {}

/// Splits a full path into the record id and the field segments below it.
pub fn split_record_path(path: &[PathSegment]) -> Result<(&str, &[PathSegment]), PathError> {
    let (first, rest) = path.split_first().ok_or(PathError::Empty)?;
    match first {
        PathSegment::Key(id) if !id.is_empty() => Ok((id.as_str(), rest)),
        _ => Err(PathError::MissingRecordId),
    }
}

/// Parses a JSON array such as `["n1", "tags", 0]` into segments.
pub fn parse_path(value: &Value) -> Result<Vec<PathSegment>, PathError> {
    let Value::Array(items) = value else {
        return Err(PathError::Empty);
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(key) => Ok(PathSegment::Key(key.clone())),
            Value::Number(number) => number
                .as_u64()
                .and_then(|index| usize::try_from(index).ok())
                .map(PathSegment::Index)
                .ok_or_else(|| PathError::NotAContainer {
                    at: number.to_string(),
                }),
            _ => Err(PathError::NotAContainer {
                at: item.to_string(),
            }),
        })
        .collect()
}

/// Sets (`Some`) or removes (`None`) the value at `fields` inside `document`.
///
/// Only the nodes along `fields` are touched; sibling subtrees move through
/// untouched. `key_field` names the document's primary key, which may not be
/// replaced or removed.
pub fn apply_at_path(
    mut document: Value,
    fields: &[PathSegment],
    value: Option<Value>,
    key_field: &str,
) -> Result<Value, PathError> {
    let (last, parents) = fields.split_last().ok_or(PathError::NoField)?;
    if parents.is_empty() && last.as_key() == key_field && document.is_object() {
        return Err(PathError::ImmutableKey(key_field.to_owned()));
    }

    let mut trail = String::new();
    let mut node = &mut document;
    for segment in parents {
        trail.push_str(&segment.to_string());
        node = descend(node, segment, &trail)?;
    }
    trail.push_str(&last.to_string());
    assign(node, last, value, &trail)?;
    Ok(document)
}

fn descend<'a>(
    node: &'a mut Value,
    segment: &PathSegment,
    trail: &str,
) -> Result<&'a mut Value, PathError> {
    match node {
        Value::Object(map) => {
            let child = map
                .get_mut(&segment.as_key())
                .ok_or_else(|| PathError::MissingKey {
                    at: trail.to_owned(),
                })?;
            if child.is_object() || child.is_array() {
                Ok(child)
            } else {
                Err(PathError::NotAContainer {
                    at: trail.to_owned(),
                })
            }
        }
        Value::Array(items) => {
            let len = items.len();
            let index = segment.as_index().ok_or_else(|| PathError::NotAContainer {
                at: trail.to_owned(),
            })?;
            let child = items.get_mut(index).ok_or(PathError::IndexOutOfRange {
                at: trail.to_owned(),
                index,
                len,
            })?;
            if child.is_object() || child.is_array() {
                Ok(child)
            } else {
                Err(PathError::NotAContainer {
                    at: trail.to_owned(),
                })
            }
        }
        _ => Err(PathError::NotAContainer {
            at: trail.to_owned(),
        }),
    }
}

fn assign(
    node: &mut Value,
    segment: &PathSegment,
    value: Option<Value>,
    trail: &str,
) -> Result<(), PathError> {
    match node {
        Value::Object(map) => {
            let key = segment.as_key();
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let index = segment.as_index().ok_or_else(|| PathError::NotAContainer {
                at: trail.to_owned(),
            })?;
            if index >= len {
                return Err(PathError::IndexOutOfRange {
                    at: trail.to_owned(),
                    index,
                    len,
                });
            }
            match value {
                Some(value) => items[index] = value,
                None => {
                    items.remove(index);
                }
            }
            Ok(())
        }
        _ => Err(PathError::NotAContainer {
            at: trail.to_owned(),
        }),
    }
}
