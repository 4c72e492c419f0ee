// src/store.rs
//! `SyncStatus` persistence. The engine only needs get/upsert per (source, origin);
//! writes are last-writer-wins, so run exactly one orchestrator per store.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

use crate::model::SyncStatus;

#[async_trait::async_trait]
pub trait SyncStatusRepository: Send + Sync {
    async fn get(&self, source_id: &str, data_origin: &str) -> Result<Option<SyncStatus>>;
    async fn upsert(&self, status: SyncStatus) -> Result<()>;
    async fn list(&self) -> Result<Vec<SyncStatus>>;
}

/// Read-modify-write helper: loads the row (or a fresh one), applies `f`, upserts it.
pub async fn modify_status<F>(
    repo: &dyn SyncStatusRepository,
    source_id: &str,
    data_origin: &str,
    f: F,
) -> Result<SyncStatus>
where
    F: FnOnce(&mut SyncStatus),
{
    let mut row = repo
        .get(source_id, data_origin)
        .await?
        .unwrap_or_else(|| SyncStatus::new(source_id, data_origin));
    f(&mut row);
    repo.upsert(row.clone()).await?;
    Ok(row)
}

type Key = (String, String);

fn key_of(s: &SyncStatus) -> Key {
    (s.source_id.clone(), s.data_origin.clone())
}

#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    rows: Mutex<BTreeMap<Key, SyncStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SyncStatusRepository for MemoryStatusStore {
    async fn get(&self, source_id: &str, data_origin: &str) -> Result<Option<SyncStatus>> {
        let rows = self.rows.lock().expect("status store mutex poisoned");
        Ok(rows
            .get(&(source_id.to_string(), data_origin.to_string()))
            .cloned())
    }

    async fn upsert(&self, status: SyncStatus) -> Result<()> {
        let mut rows = self.rows.lock().expect("status store mutex poisoned");
        rows.insert(key_of(&status), status);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SyncStatus>> {
        let rows = self.rows.lock().expect("status store mutex poisoned");
        Ok(rows.values().cloned().collect())
    }
}

/// Whole-table JSON document on disk. Every upsert rewrites the file through a
/// temp file + rename.
#[derive(Debug)]
pub struct JsonFileStatusStore {
    path: PathBuf,
    rows: tokio::sync::Mutex<BTreeMap<Key, SyncStatus>>,
}

impl JsonFileStatusStore {
    /// Opens (or starts) the store at `path`. A missing file is an empty table;
    /// an unreadable one is an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let rows = match fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => BTreeMap::new(),
            Ok(s) => {
                let list: Vec<SyncStatus> = serde_json::from_str(&s)
                    .with_context(|| format!("parsing status table {}", path.display()))?;
                list.into_iter().map(|r| (key_of(&r), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading status table {}", path.display()))
            }
        };
        tracing::debug!(path = %path.display(), rows = rows.len(), "status store opened");
        Ok(Self {
            path,
            rows: tokio::sync::Mutex::new(rows),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, rows: &BTreeMap<Key, SyncStatus>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        let list: Vec<&SyncStatus> = rows.values().collect();
        let body = serde_json::to_vec_pretty(&list).context("serializing status table")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SyncStatusRepository for JsonFileStatusStore {
    async fn get(&self, source_id: &str, data_origin: &str) -> Result<Option<SyncStatus>> {
        let rows = self.rows.lock().await;
        Ok(rows
            .get(&(source_id.to_string(), data_origin.to_string()))
            .cloned())
    }

    async fn upsert(&self, status: SyncStatus) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.insert(key_of(&status), status);
        self.persist(&rows).await
    }

    async fn list(&self) -> Result<Vec<SyncStatus>> {
        let rows = self.rows.lock().await;
        Ok(rows.values().cloned().collect())
    }
}
