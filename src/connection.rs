//! Lifecycle of the SQLite store: open, schema upgrade, reuse, reset.
//!
//! A [`ConnectionManager`] hands out cheap [`Connection`] clones that share one
//! underlying `rusqlite::Connection`. Every reset or close bumps a generation
//! counter; a clone from an older generation fails with
//! [`StoreError::ConnectionInvalidated`] instead of touching the new store.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use rusqlite::OpenFlags;
use tokio::sync::Mutex as AsyncMutex;

use crate::{config::StorageConfig, error::StoreError, schema};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type Engine = Arc<Mutex<rusqlite::Connection>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    File(PathBuf),
    /// A private in-memory database. Its contents survive invalidation and
    /// are dropped by `close`, `reset` or a failed revalidation.
    Memory,
}

impl StorageLocation {
    pub fn from_config(config: &StorageConfig) -> Self {
        if config.in_memory {
            Self::Memory
        } else {
            Self::File(config.path.clone())
        }
    }
}

#[derive(Clone)]
pub struct Connection {
    inner: Engine,
    generation: u64,
    live_generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.generation)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Connection {
    pub fn is_live(&self) -> bool {
        self.generation == self.live_generation.load(Ordering::Acquire)
    }

    /// Runs `op` against the engine on the blocking pool.
    pub(crate) async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            if !conn.is_live() {
                return Err(StoreError::ConnectionInvalidated(format!(
                    "connection generation {} was superseded",
                    conn.generation
                )));
            }
            let mut guard = conn
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut guard)
        })
        .await
        .map_err(|err| StoreError::join("storage", err))?
    }

    pub async fn schema_version(&self) -> Result<i32, StoreError> {
        self.run(|conn| schema::read_version(conn)).await
    }
}

#[derive(Debug, Default)]
struct ConnectionSlot {
    current: Option<Connection>,
    validated_at: Option<Instant>,
    /// Engine behind a [`StorageLocation::Memory`] store, reused by the next
    /// generation so invalidation does not lose data.
    memory_engine: Option<Engine>,
}

#[derive(Debug)]
pub struct ConnectionManager {
    location: StorageLocation,
    revalidate_after: Duration,
    busy_timeout: Duration,
    slot: AsyncMutex<ConnectionSlot>,
    generation: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(location: StorageLocation, revalidate_after: Duration) -> Self {
        Self {
            location,
            revalidate_after,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            slot: AsyncMutex::new(ConnectionSlot::default()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            StorageLocation::from_config(config),
            config.revalidate_after(),
        )
        .with_busy_timeout(config.busy_timeout())
    }

    /// Sets how long file-backed writes wait on a lock held elsewhere.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn in_memory() -> Self {
        Self::new(StorageLocation::Memory, Duration::from_millis(250))
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    /// Returns the live connection, opening it first if needed.
    ///
    /// Concurrent callers queue on the slot lock, so only one open runs and
    /// the rest receive its result.
    pub async fn open(&self) -> Result<Connection, StoreError> {
        let mut slot = self.slot.lock().await;
        if let Some(current) = slot.current.as_ref().filter(|conn| conn.is_live()) {
            return Ok(current.clone());
        }
        self.open_locked(&mut slot).await
    }

    /// Like [`open`](Self::open), but probes a cached connection that has not
    /// been validated within the cooldown window and reopens it on failure.
    pub async fn ensure_connection(&self) -> Result<Connection, StoreError> {
        let mut slot = self.slot.lock().await;
        let Some(current) = slot.current.clone().filter(|conn| conn.is_live()) else {
            return self.open_locked(&mut slot).await;
        };

        let fresh = slot
            .validated_at
            .is_some_and(|validated_at| validated_at.elapsed() < self.revalidate_after);
        if fresh {
            return Ok(current);
        }

        match current.schema_version().await {
            Ok(_) => {
                slot.validated_at = Some(Instant::now());
                Ok(current)
            }
            Err(err) => {
                tracing::warn!("cached connection failed validation, reopening: {err}");
                self.retire(&mut slot);
                slot.memory_engine = None;
                self.open_locked(&mut slot).await
            }
        }
    }

    /// Drops the cached connection so the next caller reopens.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if slot.current.is_some() {
            tracing::warn!("invalidating cached store connection");
        }
        self.retire(&mut slot);
    }

    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        self.retire(&mut slot);
        slot.memory_engine = None;
    }

    /// Closes the store, destroys its storage, and reopens it empty.
    pub async fn reset(&self) -> Result<Connection, StoreError> {
        let mut slot = self.slot.lock().await;
        self.retire(&mut slot);
        slot.memory_engine = None;

        if let StorageLocation::File(path) = &self.location {
            let path = path.clone();
            tokio::task::spawn_blocking(move || destroy_database_files(&path))
                .await
                .map_err(|err| StoreError::join("destroy store", err))??;
        }
        tracing::info!(location = ?self.location, "store reset");
        self.open_locked(&mut slot).await
    }

    fn retire(&self, slot: &mut ConnectionSlot) {
        slot.current = None;
        slot.validated_at = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    async fn open_locked(&self, slot: &mut ConnectionSlot) -> Result<Connection, StoreError> {
        let inner = match slot.memory_engine.clone() {
            Some(engine) => engine,
            None => {
                let location = self.location.clone();
                let busy_timeout = self.busy_timeout;
                let raw = tokio::task::spawn_blocking(move || open_engine(&location, busy_timeout))
                    .await
                    .map_err(|err| StoreError::join("open store", err))??;
                let engine = Arc::new(Mutex::new(raw));
                if self.location == StorageLocation::Memory {
                    slot.memory_engine = Some(Arc::clone(&engine));
                }
                engine
            }
        };

        let connection = Connection {
            inner,
            generation: self.generation.load(Ordering::Acquire),
            live_generation: Arc::clone(&self.generation),
        };
        slot.current = Some(connection.clone());
        slot.validated_at = Some(Instant::now());
        tracing::debug!(generation = connection.generation, "store connection opened");
        Ok(connection)
    }
}

fn open_engine(
    location: &StorageLocation,
    busy_timeout: Duration,
) -> Result<rusqlite::Connection, StoreError> {
    let mut conn = match location {
        StorageLocation::Memory => rusqlite::Connection::open_in_memory()
            .map_err(|err| unavailable("open in-memory sqlite", err))?,
        StorageLocation::File(path) => open_file(path, busy_timeout)?,
    };
    schema::migrate(&mut conn)?;
    Ok(conn)
}

fn open_file(path: &Path, busy_timeout: Duration) -> Result<rusqlite::Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            StoreError::ConnectionUnavailable(format!(
                "create storage dir {}: {err}",
                parent.display()
            ))
        })?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let context = format!("open sqlite {}", path.display());
    let conn =
        rusqlite::Connection::open_with_flags(path, flags).map_err(|err| unavailable(&context, err))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| unavailable("set PRAGMA journal_mode=WAL", err))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| StoreError::from_sqlite("set PRAGMA synchronous=NORMAL", err))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|err| StoreError::from_sqlite("set sqlite busy_timeout", err))?;

    Ok(conn)
}

fn unavailable(context: &str, err: rusqlite::Error) -> StoreError {
    StoreError::ConnectionUnavailable(format!("{context}: {err}"))
}

fn destroy_database_files(path: &Path) -> Result<(), StoreError> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        targets.push(PathBuf::from(sidecar));
    }

    for target in targets {
        match fs::remove_file(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StoreError::Storage(format!(
                    "remove store file {}: {err}",
                    target.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{ConnectionManager, StorageLocation};
    use crate::{error::StoreError, schema::SCHEMA_VERSION};

    fn file_manager(dir: &tempfile::TempDir) -> ConnectionManager {
        ConnectionManager::new(
            StorageLocation::File(dir.path().join("nested").join("console.db")),
            Duration::from_millis(250),
        )
    }

    async fn insert_user(conn: &super::Connection, id: &'static str) {
        conn.run(move |raw| {
            raw.execute(
                "INSERT INTO \"users\" (key, document) VALUES (?1, ?2)",
                [id, "{}"],
            )
            .map_err(|err| StoreError::from_sqlite("insert", err))?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn user_count(conn: &super::Connection) -> i64 {
        conn.run(|raw| {
            raw.query_row("SELECT COUNT(*) FROM \"users\"", [], |row| row.get(0))
                .map_err(|err| StoreError::from_sqlite("count", err))
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn open_creates_parent_dirs_and_latest_schema() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(&dir);

        let conn = manager.open().await.unwrap();

        assert!(dir.path().join("nested").join("console.db").exists());
        assert_eq!(conn.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn open_reuses_live_connection_for_concurrent_callers() {
        let manager = Arc::new(ConnectionManager::in_memory());

        let (first, second) = tokio::join!(manager.open(), manager.open());
        let (first, second) = (first.unwrap(), second.unwrap());

        insert_user(&first, "u1").await;
        assert_eq!(user_count(&second).await, 1);
    }

    #[tokio::test]
    async fn reset_empties_store_and_invalidates_old_handles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(&dir);
        let before = manager.open().await.unwrap();
        insert_user(&before, "u1").await;

        let after = manager.reset().await.unwrap();

        assert_eq!(user_count(&after).await, 0);
        assert!(!before.is_live());
        let err = before.schema_version().await.unwrap_err();
        assert!(matches!(err, StoreError::ConnectionInvalidated(_)), "{err:?}");
        assert!(!err.is_structural());
    }

    #[tokio::test]
    async fn in_memory_data_survives_invalidation_but_not_reset() {
        let manager = ConnectionManager::in_memory();
        let first = manager.open().await.unwrap();
        insert_user(&first, "u1").await;

        manager.invalidate().await;
        let second = manager.ensure_connection().await.unwrap();

        assert!(!first.is_live());
        assert_eq!(user_count(&second).await, 1);

        let after_reset = manager.reset().await.unwrap();
        assert_eq!(user_count(&after_reset).await, 0);
    }

    #[tokio::test]
    async fn migration_blocked_by_another_writer_is_an_upgrade_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.db");
        let holder = rusqlite::Connection::open(&path).unwrap();
        holder.pragma_update(None, "journal_mode", "WAL").unwrap();
        holder
            .execute_batch(
                r#"
                CREATE TABLE "nudges" (key TEXT PRIMARY KEY NOT NULL, document TEXT NOT NULL, timestamp INTEGER);
                CREATE TABLE "users" (key TEXT PRIMARY KEY NOT NULL, document TEXT NOT NULL, timestamp INTEGER);
                PRAGMA user_version = 1;
                BEGIN IMMEDIATE;
                "#,
            )
            .unwrap();
        let manager = ConnectionManager::new(
            StorageLocation::File(path),
            Duration::from_millis(250),
        )
        .with_busy_timeout(Duration::from_millis(50));

        let err = manager.open().await.unwrap_err();
        assert!(matches!(err, StoreError::UpgradeConflict(_)), "{err:?}");

        holder.execute_batch("ROLLBACK").unwrap();
        let conn = manager.open().await.unwrap();
        assert_eq!(conn.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn invalidate_forces_reopen_but_keeps_file_data() {
        let dir = tempfile::tempdir().unwrap();
        let manager = file_manager(&dir);
        let conn = manager.open().await.unwrap();
        insert_user(&conn, "u1").await;

        manager.invalidate().await;
        let reopened = manager.ensure_connection().await.unwrap();

        assert!(!conn.is_live());
        assert!(reopened.is_live());
        assert_eq!(user_count(&reopened).await, 1);
    }

    #[tokio::test]
    async fn ensure_connection_revalidates_after_cooldown() {
        let manager = ConnectionManager::new(StorageLocation::Memory, Duration::ZERO);
        let first = manager.ensure_connection().await.unwrap();
        insert_user(&first, "u1").await;

        let second = manager.ensure_connection().await.unwrap();

        assert_eq!(user_count(&second).await, 1);
    }

    #[tokio::test]
    async fn unwritable_location_is_connection_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let manager = ConnectionManager::new(
            StorageLocation::File(blocker.join("console.db")),
            Duration::from_millis(250),
        );

        let err = manager.open().await.unwrap_err();
        assert!(matches!(err, StoreError::ConnectionUnavailable(_)), "{err:?}");
    }
}
