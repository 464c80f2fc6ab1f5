//! Whole-store snapshots: export, import, and reset with an optional seed.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::StoreError,
    record::document_key,
    schema::Collection,
    store::RecordStore,
};

const INITIALIZED_META: &str = "initialized";

/// `{collectionName: [record, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupSnapshot(BTreeMap<String, Vec<Value>>);

impl BackupSnapshot {
    pub fn get(&self, collection: &str) -> Option<&[Value]> {
        self.0.get(collection).map(Vec::as_slice)
    }

    pub fn insert(&mut self, collection: impl Into<String>, records: Vec<Value>) {
        self.0.insert(collection.into(), records);
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn record_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportScope {
    /// Every collection except captured traffic.
    #[default]
    Persisted,
    All,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: BTreeMap<String, usize>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    store: RecordStore,
}

impl BackupManager {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub async fn export(&self) -> Result<BackupSnapshot, StoreError> {
        self.export_scope(ExportScope::Persisted).await
    }

    pub async fn export_scope(&self, scope: ExportScope) -> Result<BackupSnapshot, StoreError> {
        let mut snapshot = BackupSnapshot::default();
        for collection in Collection::ALL {
            if scope == ExportScope::Persisted && collection.is_ephemeral() {
                continue;
            }
            snapshot.insert(collection.name(), self.store.get_all(collection).await?);
        }
        Ok(snapshot)
    }

    /// Replaces the contents of every collection named in `snapshot`.
    /// Unknown collection names are skipped with a warning. The import is
    /// all or nothing: one invalid record leaves the store as it was.
    pub async fn import(&self, snapshot: &BackupSnapshot) -> Result<ImportSummary, StoreError> {
        let (batches, summary) = plan_import(snapshot);
        self.store
            .replace_collections(batches, (INITIALIZED_META, "true"))
            .await?;
        tracing::info!(
            collections = summary.imported.len(),
            records = snapshot.record_count(),
            "imported snapshot"
        );
        Ok(summary)
    }

    /// Empties every collection, then imports `seed` when given. Without a
    /// seed the store reports itself uninitialized. Both steps commit
    /// together.
    pub async fn reset_with_seed(
        &self,
        seed: Option<&BackupSnapshot>,
    ) -> Result<Option<ImportSummary>, StoreError> {
        let (mut batches, summary) = match seed {
            Some(snapshot) => {
                let (batches, summary) = plan_import(snapshot);
                (batches, Some(summary))
            }
            None => (Vec::new(), None),
        };
        for collection in Collection::ALL {
            if !batches.iter().any(|(seeded, _)| *seeded == collection) {
                batches.push((collection, Vec::new()));
            }
        }

        let initialized = if seed.is_some() { "true" } else { "false" };
        self.store
            .replace_collections(batches, (INITIALIZED_META, initialized))
            .await?;
        tracing::info!(seeded = seed.is_some(), "reset store contents");
        Ok(summary)
    }

    pub async fn is_initialized(&self) -> Result<bool, StoreError> {
        Ok(self.store.read_meta(INITIALIZED_META).await?.as_deref() == Some("true"))
    }

    pub async fn export_to_path(&self, path: &Path, scope: ExportScope) -> anyhow::Result<PathBuf> {
        let snapshot = self.export_scope(scope).await?;
        let path = path.to_path_buf();
        let written = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot))
            .await
            .context("join snapshot write task")??;
        Ok(written)
    }

    pub async fn import_from_path(&self, path: &Path) -> anyhow::Result<ImportSummary> {
        let snapshot = read_snapshot_file(path).await?;
        Ok(self.import(&snapshot).await?)
    }
}

/// Splits `snapshot` into per-collection batches, skipping unknown names.
fn plan_import(snapshot: &BackupSnapshot) -> (Vec<(Collection, Vec<Value>)>, ImportSummary) {
    let mut batches = Vec::new();
    let mut summary = ImportSummary::default();
    for (name, records) in &snapshot.0 {
        let Ok(collection) = name.parse::<Collection>() else {
            tracing::warn!(collection = %name, "skipping unknown collection in snapshot");
            summary.skipped.push(name.clone());
            continue;
        };

        let mut seen = BTreeSet::new();
        for record in records {
            if let Ok(key) = document_key(collection, record)
                && !seen.insert(key.clone())
            {
                tracing::warn!(collection = %collection, id = %key, "duplicate record in snapshot, replacing");
            }
        }
        batches.push((collection, records.clone()));
        summary.imported.insert(name.clone(), records.len());
    }
    (batches, summary)
}

pub async fn read_snapshot_file(path: &Path) -> anyhow::Result<BackupSnapshot> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("read snapshot {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse snapshot {}", path.display()))
    })
    .await
    .context("join snapshot read task")?
}

fn write_snapshot(path: &Path, snapshot: &BackupSnapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create snapshot dir {}", parent.display()))?;
    }
    let mut json = serde_json::to_vec_pretty(snapshot).context("serialize snapshot")?;
    json.push(b'\n');
    fs::write(path, json).with_context(|| format!("write snapshot {}", path.display()))
}
