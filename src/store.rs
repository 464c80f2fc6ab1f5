//! Per-collection CRUD over JSON documents, plus partial updates by path.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::{ErrorCode, OptionalExtension as _, params};
use serde_json::Value;

use crate::{
    connection::ConnectionManager,
    error::StoreError,
    path::{PathSegment, apply_at_path, split_record_path},
    record::{Record, document_key, document_timestamp},
    schema::{self, Collection},
};

pub fn now_unix_ms() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    connections: Arc<ConnectionManager>,
}

impl RecordStore {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub async fn get_all(&self, collection: Collection) -> Result<Vec<Value>, StoreError> {
        self.execute(move |conn| {
            let sql = format!("SELECT document FROM {} ORDER BY rowid", collection.table());
            query_documents(conn, &sql, [])
        })
        .await
    }

    pub async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError> {
        let id = id.to_owned();
        self.execute(move |conn| select_document(conn, collection, &id))
            .await
    }

    pub async fn get_record(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.get(collection, id)
            .await?
            .map(|document| Record::from_document(collection, &document))
            .transpose()
    }

    pub async fn exists(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let id = id.to_owned();
        self.execute(move |conn| {
            let sql = format!("SELECT 1 FROM {} WHERE key = ?1", collection.table());
            conn.query_row(&sql, params![id], |_| Ok(()))
                .optional()
                .map(|found| found.is_some())
                .map_err(|err| StoreError::from_sqlite("check record exists", err))
        })
        .await
    }

    /// Inserts a new record, failing with [`StoreError::DuplicateId`] if its
    /// key is taken.
    pub async fn add(&self, collection: Collection, document: Value) -> Result<Value, StoreError> {
        let row = StoredRow::prepare(collection, document)?;
        self.execute(move |conn| {
            let sql = format!(
                "INSERT INTO {} (key, document, timestamp) VALUES (?1, ?2, ?3)",
                collection.table()
            );
            conn.execute(&sql, params![row.key, row.text, row.timestamp])
                .map_err(|err| {
                    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                        StoreError::DuplicateId {
                            collection,
                            id: row.key.clone(),
                        }
                    } else {
                        StoreError::from_sqlite("insert record", err)
                    }
                })?;
            Ok(row.document.clone())
        })
        .await
    }

    /// Inserts or replaces the record stored under the document's key.
    pub async fn put(&self, collection: Collection, document: Value) -> Result<Value, StoreError> {
        let row = StoredRow::prepare(collection, document)?;
        self.execute(move |conn| {
            upsert(conn, collection, &row)?;
            Ok(row.document.clone())
        })
        .await
    }

    pub async fn delete(&self, collection: Collection, id: &str) -> Result<(), StoreError> {
        let id = id.to_owned();
        self.execute(move |conn| {
            let sql = format!("DELETE FROM {} WHERE key = ?1", collection.table());
            let removed = conn
                .execute(&sql, params![id])
                .map_err(|err| StoreError::from_sqlite("delete record", err))?;
            if removed == 0 {
                return Err(StoreError::NotFound {
                    collection,
                    id: id.clone(),
                });
            }
            Ok(())
        })
        .await
    }

    /// Sets (`Some`) or removes (`None`) the value addressed by `path`, whose
    /// first segment is the record id, and returns the updated record.
    ///
    /// The read, mutation and write happen in one transaction. Two callers
    /// racing on the same record still resolve last-write-wins.
    pub async fn update_by_path(
        &self,
        collection: Collection,
        path: &[PathSegment],
        value: Option<Value>,
    ) -> Result<Value, StoreError> {
        let (id, fields) = split_record_path(path)?;
        let id = id.to_owned();
        let fields = fields.to_vec();

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::from_sqlite("begin path update", err))?;
            let current =
                select_document(&tx, collection, &id)?.ok_or_else(|| StoreError::NotFound {
                    collection,
                    id: id.clone(),
                })?;

            let updated = apply_at_path(current, &fields, value.clone(), collection.key_path())?;
            let row = StoredRow::prepare(collection, updated)?;
            upsert(&tx, collection, &row)?;
            tx.commit()
                .map_err(|err| StoreError::from_sqlite("commit path update", err))?;
            Ok(row.document)
        })
        .await
    }

    /// Removes every record in `collection` and returns how many were dropped.
    pub async fn clear(&self, collection: Collection) -> Result<usize, StoreError> {
        self.execute(move |conn| {
            conn.execute(&format!("DELETE FROM {}", collection.table()), [])
                .map_err(|err| StoreError::from_sqlite("clear collection", err))
        })
        .await
    }

    /// Replaces the whole contents of each listed collection and sets one
    /// metadata value in a single transaction. Every document is validated
    /// first, so a bad record leaves the store untouched. A key repeated
    /// within a batch keeps its last document.
    pub(crate) async fn replace_collections(
        &self,
        batches: Vec<(Collection, Vec<Value>)>,
        meta: (&'static str, &'static str),
    ) -> Result<(), StoreError> {
        let batches = batches
            .into_iter()
            .map(|(collection, documents)| {
                let rows = documents
                    .into_iter()
                    .map(|document| StoredRow::prepare(collection, document))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((collection, rows))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::from_sqlite("begin collection replace", err))?;
            for (collection, rows) in &batches {
                tx.execute(&format!("DELETE FROM {}", collection.table()), [])
                    .map_err(|err| StoreError::from_sqlite("clear collection", err))?;
                for row in rows {
                    upsert(&tx, *collection, row)?;
                }
            }
            schema::write_meta(&tx, meta.0, meta.1)?;
            tx.commit()
                .map_err(|err| StoreError::from_sqlite("commit collection replace", err))
        })
        .await
    }

    pub async fn count(&self, collection: Collection) -> Result<usize, StoreError> {
        self.execute(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .map_err(|err| StoreError::from_sqlite("count records", err))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    /// Newest `limit` records by the timestamp index. Collections without
    /// one fall back to reverse insertion order.
    pub async fn recent(
        &self,
        collection: Collection,
        limit: usize,
    ) -> Result<Vec<Value>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            let sql = format!(
                "SELECT document FROM {} ORDER BY {} LIMIT ?1",
                collection.table(),
                timeline_order(collection, true)
            );
            query_documents(conn, &sql, params![limit])
        })
        .await
    }

    /// Every record oldest first by the timestamp index.
    pub async fn chronological(&self, collection: Collection) -> Result<Vec<Value>, StoreError> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT document FROM {} ORDER BY {}",
                collection.table(),
                timeline_order(collection, false)
            );
            query_documents(conn, &sql, [])
        })
        .await
    }

    pub(crate) async fn read_meta(&self, name: &'static str) -> Result<Option<String>, StoreError> {
        self.execute(move |conn| schema::read_meta(conn, name)).await
    }

    /// Runs `op` on the current connection. If that connection was closed or
    /// superseded underneath the call, the cache is dropped and `op` runs
    /// once more on a freshly opened connection.
    async fn execute<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let conn = self.connections.ensure_connection().await?;
        let first = {
            let op = Arc::clone(&op);
            conn.run(move |raw| op(raw)).await
        };

        match first {
            Err(StoreError::ConnectionInvalidated(message)) => {
                tracing::warn!("store operation aborted, retrying on a new connection: {message}");
                if conn.is_live() {
                    self.connections.invalidate().await;
                }
                let conn = self.connections.open().await?;
                conn.run(move |raw| op(raw)).await
            }
            other => other,
        }
    }
}

/// A validated document ready to be written.
struct StoredRow {
    key: String,
    text: String,
    timestamp: Option<i64>,
    document: Value,
}

impl StoredRow {
    fn prepare(collection: Collection, document: Value) -> Result<Self, StoreError> {
        let key = document_key(collection, &document)?;
        Record::from_document(collection, &document)?;
        Ok(Self {
            key,
            text: serde_json::to_string(&document)?,
            timestamp: document_timestamp(collection, &document),
            document,
        })
    }
}

fn upsert(
    conn: &rusqlite::Connection,
    collection: Collection,
    row: &StoredRow,
) -> Result<(), StoreError> {
    let sql = format!(
        r#"
        INSERT INTO {} (key, document, timestamp) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
          document = excluded.document,
          timestamp = excluded.timestamp
        "#,
        collection.table()
    );
    conn.execute(&sql, params![row.key, row.text, row.timestamp])
        .map_err(|err| StoreError::from_sqlite("write record", err))?;
    Ok(())
}

fn select_document(
    conn: &rusqlite::Connection,
    collection: Collection,
    id: &str,
) -> Result<Option<Value>, StoreError> {
    let sql = format!("SELECT document FROM {} WHERE key = ?1", collection.table());
    let text: Option<String> = conn
        .query_row(&sql, params![id], |row| row.get(0))
        .optional()
        .map_err(|err| StoreError::from_sqlite("read record", err))?;
    text.map(|text| decode_document(&text)).transpose()
}

fn query_documents<P: rusqlite::Params>(
    conn: &rusqlite::Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Value>, StoreError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| StoreError::from_sqlite("prepare document query", err))?;
    let mut rows = stmt
        .query(params)
        .map_err(|err| StoreError::from_sqlite("query documents", err))?;

    let mut documents = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| StoreError::from_sqlite("iterate documents", err))?
    {
        let text: String = row
            .get(0)
            .map_err(|err| StoreError::from_sqlite("read document column", err))?;
        documents.push(decode_document(&text)?);
    }
    Ok(documents)
}

fn decode_document(text: &str) -> Result<Value, StoreError> {
    serde_json::from_str(text)
        .map_err(|err| StoreError::Serialization(format!("decode stored document: {err}")))
}

fn timeline_order(collection: Collection, newest_first: bool) -> &'static str {
    match (collection.has_timestamp_index(), newest_first) {
        (true, true) => "timestamp DESC, rowid DESC",
        (true, false) => "timestamp ASC, rowid ASC",
        (false, true) => "rowid DESC",
        (false, false) => "rowid ASC",
    }
}
