//! Durable storage boundary for recording artifacts
//!
//! The core persists finalized recordings through [`RecordingStore`] and
//! never reads them back itself; retrieval and deletion exist for the host
//! application. Two backends ship with the crate: an in-memory store for
//! tests and embedding, and a local filesystem store with a date-tree layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::recorder::RecordingArtifact;

/// Key-by-id object store for recording artifacts
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Persist one artifact. The core swallows any error from this call.
    async fn put(&self, artifact: &RecordingArtifact) -> anyhow::Result<()>;

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<RecordingArtifact>>;

    async fn delete(&self, id: Uuid) -> anyhow::Result<()>;

    async fn list(&self) -> anyhow::Result<Vec<RecordingArtifact>>;
}

/// In-memory store keyed by artifact id
#[derive(Default)]
pub struct MemoryRecordingStore {
    artifacts: RwLock<HashMap<Uuid, RecordingArtifact>>,
}

impl MemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.artifacts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.artifacts.read().await.is_empty()
    }
}

#[async_trait]
impl RecordingStore for MemoryRecordingStore {
    async fn put(&self, artifact: &RecordingArtifact) -> anyhow::Result<()> {
        self.artifacts
            .write()
            .await
            .insert(artifact.id, artifact.clone());
        tracing::debug!(artifact_id = %artifact.id, "stored recording in memory");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<RecordingArtifact>> {
        Ok(self.artifacts.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<()> {
        self.artifacts
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("recording not found: {id}"))
    }

    async fn list(&self) -> anyhow::Result<Vec<RecordingArtifact>> {
        let mut all: Vec<RecordingArtifact> = self.artifacts.read().await.values().cloned().collect();
        all.sort_by_key(|a| a.created_at);
        Ok(all)
    }
}

/// Local filesystem store.
///
/// Layout: `base_path/YYYY/MM/DD/{call_id}_{artifact_id}.wav`.
pub struct FileRecordingStore {
    base_path: PathBuf,
}

impl FileRecordingStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create the base directory if it does not exist yet
    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.base_path)
            .await
            .with_context(|| format!("creating recording store at {:?}", self.base_path))?;
        tracing::info!("initialized recording store at {:?}", self.base_path);
        Ok(())
    }

    fn artifact_path(&self, artifact: &RecordingArtifact) -> PathBuf {
        let date_path = artifact.created_at.format("%Y/%m/%d").to_string();
        let ext = match artifact.mime_type.as_str() {
            "audio/wav" => "wav",
            _ => "bin",
        };
        let filename = format!("{}_{}.{}", artifact.call_id, artifact.id, ext);
        self.base_path.join(date_path).join(filename)
    }

    /// Walk the date tree collecting every stored file
    async fn walk(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.base_path.exists() {
            return Ok(files);
        }

        let mut pending = vec![self.base_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(path);
                } else if metadata.is_file() {
                    files.push(path);
                }
            }
        }

        Ok(files)
    }

    async fn find(&self, id: Uuid) -> anyhow::Result<Option<PathBuf>> {
        let suffix = format!("_{id}");
        for path in self.walk().await? {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            if stem.ends_with(&suffix) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn load(&self, path: &Path) -> anyhow::Result<RecordingArtifact> {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow!("invalid recording filename: {path:?}"))?;
        let (call_id, artifact_id) = stem
            .split_once('_')
            .ok_or_else(|| anyhow!("invalid recording filename: {path:?}"))?;

        let data = fs::read(path)
            .await
            .with_context(|| format!("reading recording {path:?}"))?;
        let created_at: DateTime<Utc> = fs::metadata(path)
            .await?
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        let mime_type = match path.extension().and_then(|e| e.to_str()) {
            Some("wav") => "audio/wav",
            _ => "application/octet-stream",
        };

        Ok(RecordingArtifact {
            id: artifact_id.parse()?,
            call_id: call_id.parse()?,
            data: Bytes::from(data),
            mime_type: mime_type.to_string(),
            created_at,
        })
    }
}

#[async_trait]
impl RecordingStore for FileRecordingStore {
    async fn put(&self, artifact: &RecordingArtifact) -> anyhow::Result<()> {
        let path = self.artifact_path(artifact);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("creating {path:?}"))?;
        file.write_all(&artifact.data).await?;
        file.sync_all().await?;

        tracing::info!(
            artifact_id = %artifact.id,
            call_id = %artifact.call_id,
            size = artifact.size(),
            "stored recording at {path:?}"
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<RecordingArtifact>> {
        match self.find(id).await? {
            Some(path) => Ok(Some(self.load(&path).await?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<()> {
        let path = self
            .find(id)
            .await?
            .ok_or_else(|| anyhow!("recording not found: {id}"))?;
        fs::remove_file(&path).await?;
        tracing::info!(artifact_id = %id, "deleted recording at {path:?}");
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<Vec<RecordingArtifact>> {
        let mut all = Vec::new();
        for path in self.walk().await? {
            match self.load(&path).await {
                Ok(artifact) => all.push(artifact),
                Err(e) => tracing::warn!("skipping unreadable recording {path:?}: {e}"),
            }
        }
        all.sort_by_key(|a| a.created_at);
        Ok(all)
    }
}
