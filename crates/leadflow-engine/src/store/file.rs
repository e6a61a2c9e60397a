//! File-based checkpoint store
//!
//! # Directory Structure
//!
//! ```text
//! {base}/
//! └── {instance_id}/
//!     ├── checkpoint_00000001.ckpt
//!     ├── checkpoint_00000002.ckpt
//!     └── checkpoint_00000003.ckpt
//! ```
//!
//! A file holds either plain JSON or a zstd frame; readers tell them apart
//! by the zstd magic number, so the file name of a version does not depend
//! on the writer's compression setting.
//!
//! Each version is written to a temporary file, synced, and then hard-linked
//! to its final name. Linking fails if the name already exists, so two
//! writers racing for the same version cannot both succeed, even across
//! processes. Directories without checkpoint files (left behind by a write
//! that never completed) are not reported as instances.

use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Checkpoint, CheckpointStore};
use crate::error::EngineError;
use crate::instance::InstanceId;

const PREFIX: &str = "checkpoint_";
const SUFFIX: &str = ".ckpt";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Checkpoint store keeping one file per version
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_path: PathBuf,
    compression: bool,
    /// Serializes appends within this process
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Create a store rooted at `base_path`.
    ///
    /// `compression` controls how new checkpoints are written; existing
    /// files are read in whichever format they were written.
    pub fn new(base_path: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            base_path: base_path.into(),
            compression,
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn instance_dir(&self, id: &InstanceId) -> Result<PathBuf, EngineError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
        if !valid {
            return Err(EngineError::checkpoint(format!(
                "instance id not usable as a directory name: {raw:?}"
            )));
        }
        Ok(self.base_path.join(raw))
    }

    fn file_name(version: u64) -> String {
        format!("{PREFIX}{version:08}{SUFFIX}")
    }

    /// Parse the version from a checkpoint file name; temp files are ignored
    fn parse_version(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
            .map_err(|e| EngineError::checkpoint(format!("compression init failed: {e}")))?;
        encoder
            .write_all(data)
            .map_err(|e| EngineError::checkpoint(format!("compression write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| EngineError::checkpoint(format!("compression finish failed: {e}")))
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>, EngineError> {
        zstd::stream::decode_all(data)
            .map_err(|e| EngineError::checkpoint(format!("decompression failed: {e}")))
    }

    /// `(version, path)` of every checkpoint file, sorted by version
    async fn list_versions(&self, dir: &Path) -> Result<Vec<(u64, PathBuf)>, EngineError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::checkpoint(format!("failed to read {dir:?}: {e}"))),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to read entry: {e}")))?
        {
            let path = entry.path();
            if let Some(version) = Self::parse_version(&path) {
                versions.push((version, path));
            }
        }
        versions.sort_by_key(|(version, _)| *version);
        Ok(versions)
    }

    async fn read_checkpoint(path: &Path) -> Result<Checkpoint, EngineError> {
        let data = fs::read(path)
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to read {path:?}: {e}")))?;
        let json = if data.starts_with(&ZSTD_MAGIC) {
            Self::decompress(&data)?
        } else {
            data
        };
        serde_json::from_slice(&json)
            .map_err(|e| EngineError::checkpoint(format!("failed to decode {path:?}: {e}")))
    }

    async fn write_temp(path: &Path, data: &[u8]) -> Result<(), EngineError> {
        let mut file = fs::File::create(path)
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to create temp file: {e}")))?;
        file.write_all(data)
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to write data: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to sync file: {e}")))
    }

    /// Publish `data` as `version` in `dir`; fails with a conflict if any
    /// writer already published that version
    async fn publish(&self, id: &InstanceId, dir: &Path, version: u64, data: &[u8]) -> Result<(), EngineError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to create directory: {e}")))?;

        let temp_path = dir.join(format!("{PREFIX}{version:08}.{}.tmp", uuid::Uuid::new_v4().simple()));
        let final_path = dir.join(Self::file_name(version));

        let written = match Self::write_temp(&temp_path, data).await {
            Ok(()) => match fs::hard_link(&temp_path, &final_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Err(EngineError::conflict(id, version.saturating_sub(1), version))
                }
                Err(e) => Err(EngineError::checkpoint(format!("failed to link checkpoint: {e}"))),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = fs::remove_file(&temp_path).await {
            tracing::warn!(path = ?temp_path, error = %e, "failed to remove temp checkpoint");
        }
        written
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        let id = &checkpoint.instance_id;
        let dir = self.instance_dir(id)?;

        let latest = self.list_versions(&dir).await?.last().map(|(v, _)| *v).unwrap_or(0);
        if checkpoint.version != latest + 1 {
            return Err(EngineError::conflict(id, checkpoint.version.saturating_sub(1), latest));
        }

        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| EngineError::checkpoint(format!("serialization failed: {e}")))?;
        let data = if self.compression {
            Self::compress(&json)?
        } else {
            json
        };
        self.publish(id, &dir, checkpoint.version, &data).await
    }

    async fn chain(&self, id: &InstanceId) -> Result<Vec<Checkpoint>, EngineError> {
        let dir = self.instance_dir(id)?;
        let mut chain = Vec::new();
        for (_, path) in self.list_versions(&dir).await? {
            chain.push(Self::read_checkpoint(&path).await?);
        }
        Ok(chain)
    }

    async fn latest_version(&self, id: &InstanceId) -> Result<Option<u64>, EngineError> {
        let dir = self.instance_dir(id)?;
        Ok(self.list_versions(&dir).await?.last().map(|(v, _)| *v))
    }

    async fn instances(&self) -> Result<Vec<InstanceId>, EngineError> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::checkpoint(format!("failed to read store: {e}"))),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::checkpoint(format!("failed to read entry: {e}")))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.list_versions(&entry.path()).await?.is_empty() {
                tracing::debug!(dir = %name, "skipping directory without checkpoints");
                continue;
            }
            ids.push(InstanceId::new(name));
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::replay;
    use crate::store::tests::sample_chain;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_and_chain() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), false);
        let chain = sample_chain("lead-1", 2);
        for checkpoint in &chain {
            store.append(checkpoint).await.unwrap();
        }

        let id = InstanceId::new("lead-1");
        assert!(temp_dir.path().join("lead-1/checkpoint_00000001.ckpt").exists());
        assert_eq!(store.latest_version(&id).await.unwrap(), Some(3));
        assert_eq!(store.chain(&id).await.unwrap(), chain);
        assert_eq!(store.instances().await.unwrap(), vec![id.clone()]);

        let instance = store.load(&id).await.unwrap();
        assert_eq!(instance, replay(&chain).unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_compressed_store() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), true);
        let chain = sample_chain("lead-1", 1);
        for checkpoint in &chain {
            store.append(checkpoint).await.unwrap();
        }
        let raw = std::fs::read(temp_dir.path().join("lead-1/checkpoint_00000002.ckpt")).unwrap();
        assert!(raw.starts_with(&ZSTD_MAGIC));

        // An uncompressed store reads compressed files too
        let plain = FileCheckpointStore::new(temp_dir.path(), false);
        assert_eq!(plain.chain(&InstanceId::new("lead-1")).await.unwrap(), chain);
    }

    #[tokio::test]
    async fn test_mixed_compression_writers_share_version_names() {
        let temp_dir = tempdir().unwrap();
        let plain = FileCheckpointStore::new(temp_dir.path(), false);
        let zipped = FileCheckpointStore::new(temp_dir.path(), true);
        let chain = sample_chain("lead-1", 2);
        let id = InstanceId::new("lead-1");
        let dir = temp_dir.path().join("lead-1");

        zipped.append(&chain[0]).await.unwrap();
        plain.append(&chain[1]).await.unwrap();
        assert_eq!(plain.chain(&id).await.unwrap(), chain[..2].to_vec());

        // Both writers passed the version check for v3 before either linked
        let json = serde_json::to_vec(&chain[2]).unwrap();
        plain.publish(&id, &dir, 3, &json).await.unwrap();
        let compressed = FileCheckpointStore::compress(&json).unwrap();
        let err = zipped.publish(&id, &dir, 3, &compressed).await.unwrap_err();
        assert!(err.is_conflict());

        let files = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(files, 3);
        assert_eq!(zipped.chain(&id).await.unwrap(), chain);
    }

    #[tokio::test]
    async fn test_empty_instance_directory_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), false);
        for checkpoint in &sample_chain("lead-ok", 0) {
            store.append(checkpoint).await.unwrap();
        }
        std::fs::create_dir(temp_dir.path().join("lead-crashed")).unwrap();
        std::fs::write(temp_dir.path().join("lead-crashed/checkpoint_00000001.abc.tmp"), b"{").unwrap();

        assert_eq!(store.instances().await.unwrap(), vec![InstanceId::new("lead-ok")]);
    }

    #[tokio::test]
    async fn test_stale_append_conflicts() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), false);
        let chain = sample_chain("lead-1", 1);
        store.append(&chain[0]).await.unwrap();
        store.append(&chain[1]).await.unwrap();

        assert!(store.append(&chain[1]).await.unwrap_err().is_conflict());

        // Two stores on one directory behave like two processes
        let other = FileCheckpointStore::new(temp_dir.path(), true);
        assert!(other.append(&chain[1]).await.unwrap_err().is_conflict());

        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path().join("lead-1"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path().join("nothing"), false);
        assert!(store.instances().await.unwrap().is_empty());
        assert!(store.chain(&InstanceId::new("x")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let temp_dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(temp_dir.path(), false);
        assert!(store.chain(&InstanceId::new("../etc")).await.is_err());
        assert!(store.chain(&InstanceId::new("a/b")).await.is_err());
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            FileCheckpointStore::parse_version(Path::new("checkpoint_00000012.ckpt")),
            Some(12)
        );
        assert_eq!(
            FileCheckpointStore::parse_version(Path::new("checkpoint_00000012.json")),
            None
        );
        assert_eq!(
            FileCheckpointStore::parse_version(Path::new("checkpoint_00000012.abc.tmp")),
            None
        );
        assert_eq!(FileCheckpointStore::parse_version(Path::new("other.json")), None);
    }
}
