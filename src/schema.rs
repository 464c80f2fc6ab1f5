use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension as _, params};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const SCHEMA_VERSION: i32 = 3;

const META_TABLE: &str = "store_meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Nudges,
    Collections,
    Media,
    MediaFolders,
    Users,
    Errors,
    Network,
    MockResponses,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Nudges,
        Collection::Collections,
        Collection::Media,
        Collection::MediaFolders,
        Collection::Users,
        Collection::Errors,
        Collection::Network,
        Collection::MockResponses,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Nudges => "nudges",
            Self::Collections => "collections",
            Self::Media => "media",
            Self::MediaFolders => "mediaFolders",
            Self::Users => "users",
            Self::Errors => "errors",
            Self::Network => "network",
            Self::MockResponses => "mockResponses",
        }
    }

    /// Document field that holds the primary key.
    pub fn key_path(self) -> &'static str {
        match self {
            Self::MockResponses => "key",
            _ => "id",
        }
    }

    pub fn has_timestamp_index(self) -> bool {
        matches!(self, Self::Errors | Self::Network)
    }

    /// Captured traffic that is left out of default backups.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Network | Self::MockResponses)
    }

    pub fn persisted() -> impl Iterator<Item = Collection> {
        Self::ALL.into_iter().filter(|collection| !collection.is_ephemeral())
    }

    pub(crate) fn table(self) -> String {
        format!("\"{}\"", self.name())
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|collection| collection.name() == s)
            .ok_or_else(|| StoreError::UnknownCollection(s.to_owned()))
    }
}

/// One step of the schema history.
struct Migration {
    from: i32,
    to: i32,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        from: 1,
        to: 2,
        apply: migrate_v1_to_v2,
    },
    Migration {
        from: 2,
        to: 3,
        apply: migrate_v2_to_v3,
    },
];

pub(crate) fn read_version(conn: &Connection) -> Result<i32, StoreError> {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|err| StoreError::from_sqlite("read PRAGMA user_version", err))
}

pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version = read_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::UpgradeConflict(format!(
            "store schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().map_err(upgrade_error)?;
    if version == 0 {
        create_latest(&tx).map_err(upgrade_error)?;
        tracing::info!(version = SCHEMA_VERSION, "created store schema");
        version = SCHEMA_VERSION;
    }
    while version < SCHEMA_VERSION {
        let Some(step) = MIGRATIONS.iter().find(|step| step.from == version) else {
            return Err(StoreError::UpgradeConflict(format!(
                "no migration registered from schema version {version}"
            )));
        };
        (step.apply)(&tx).map_err(upgrade_error)?;
        tracing::info!(from = step.from, to = step.to, "migrated store schema");
        version = step.to;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(upgrade_error)?;
    tx.commit().map_err(upgrade_error)?;
    Ok(())
}

fn upgrade_error(err: rusqlite::Error) -> StoreError {
    match StoreError::from_sqlite("upgrade store schema", err) {
        StoreError::ConnectionInvalidated(message) => StoreError::UpgradeConflict(message),
        other => other,
    }
}

fn create_latest(conn: &Connection) -> rusqlite::Result<()> {
    for collection in Collection::ALL {
        create_collection(conn, collection)?;
    }
    create_meta_table(conn)
}

fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    create_collection(conn, Collection::MediaFolders)?;
    create_collection(conn, Collection::Network)
}

fn migrate_v2_to_v3(conn: &Connection) -> rusqlite::Result<()> {
    create_collection(conn, Collection::MockResponses)?;
    create_meta_table(conn)
}

pub(crate) fn create_collection(conn: &Connection, collection: Collection) -> rusqlite::Result<()> {
    let table = collection.table();
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
          key TEXT PRIMARY KEY NOT NULL,
          document TEXT NOT NULL,
          timestamp INTEGER
        );
        "#
    ))?;
    if collection.has_timestamp_index() {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"{name}_timestamp_idx\" ON {table}(timestamp);",
            name = collection.name()
        ))?;
    }
    Ok(())
}

fn create_meta_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {META_TABLE} (name TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);"
    ))
}

pub(crate) fn read_meta(conn: &Connection, name: &str) -> Result<Option<String>, StoreError> {
    conn.query_row(
        &format!("SELECT value FROM {META_TABLE} WHERE name = ?1"),
        params![name],
        |row| row.get(0),
    )
    .optional()
    .map_err(|err| StoreError::from_sqlite("read store metadata", err))
}

pub(crate) fn write_meta(conn: &Connection, name: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO {META_TABLE} (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value"
        ),
        params![name, value],
    )
    .map_err(|err| StoreError::from_sqlite("write store metadata", err))?;
    Ok(())
}
