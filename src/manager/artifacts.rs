//! Destination for artifacts extracted from finished sandboxes.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::engine::ArtifactReader;
use crate::error::ArtifactError;
use crate::queue::RunKey;

/// Stores artifacts under a run.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `artifact` as `name`. Returns the number of bytes stored.
    async fn put(&self, run: &RunKey, name: &str, artifact: ArtifactReader) -> Result<u64, ArtifactError>;

    /// Stores a tar archive of a sandbox filesystem.
    async fn put_archive(
        &self,
        run: &RunKey,
        name: &str,
        artifact: ArtifactReader,
    ) -> Result<u64, ArtifactError> {
        self.put(run, name, artifact).await
    }
}

/// Writes artifacts to `<root>/<task_id>/<run_id>/<name>`.
///
/// Archives are gzipped and get a `.gz` suffix unless the name has one.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the artifacts of `run`.
    pub fn run_dir(&self, run: &RunKey) -> PathBuf {
        self.root.join(&run.task_id).join(run.run_id.to_string())
    }

    /// Resolves `name` below the run directory.
    ///
    /// Names must be relative and may not leave the run directory.
    pub fn path_for(&self, run: &RunKey, name: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(ArtifactError::InvalidName(name.to_string()));
        }
        Ok(self.run_dir(run).join(relative))
    }

    async fn create_parent(path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, run: &RunKey, name: &str, mut artifact: ArtifactReader) -> Result<u64, ArtifactError> {
        let path = self.path_for(run, name)?;
        Self::create_parent(&path).await?;

        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut artifact.reader, &mut file).await?;
        file.flush().await?;

        debug!(run = %run, artifact = name, bytes = written, "Artifact stored");
        Ok(written)
    }

    async fn put_archive(
        &self,
        run: &RunKey,
        name: &str,
        mut artifact: ArtifactReader,
    ) -> Result<u64, ArtifactError> {
        let name = if name.ends_with(".gz") {
            name.to_string()
        } else {
            format!("{name}.gz")
        };
        let path = self.path_for(run, &name)?;
        Self::create_parent(&path).await?;

        let mut tar = Vec::new();
        artifact.reader.read_to_end(&mut tar).await?;

        let compressed = tokio::task::spawn_blocking(move || {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&tar)?;
            encoder.finish()
        })
        .await
        .map_err(|e| ArtifactError::Compression(e.to_string()))?
        .map_err(|e| ArtifactError::Compression(e.to_string()))?;

        tokio::fs::write(&path, &compressed).await?;
        debug!(run = %run, artifact = %name, bytes = compressed.len(), "Archive stored");
        Ok(compressed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn run() -> RunKey {
        RunKey::new("task-1", 0)
    }

    #[tokio::test]
    async fn test_put_writes_under_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());

        let artifact = ArtifactReader::new("output/log.txt", std::io::Cursor::new(b"log".to_vec()));
        let written = store.put(&run(), "public/logs/log.txt", artifact).await.unwrap();
        assert_eq!(written, 3);

        let path = dir.path().join("task-1/0/public/logs/log.txt");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "log");
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        for name in ["", "../escape", "/abs/path", "a/../../b"] {
            let err = store.path_for(&run(), name).unwrap_err();
            assert!(matches!(err, ArtifactError::InvalidName(_)), "{name}");
        }
        assert!(store.path_for(&run(), "a/b.txt").is_ok());
    }

    #[tokio::test]
    async fn test_archive_is_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());

        let artifact = ArtifactReader::new("", std::io::Cursor::new(b"tar bytes".to_vec()));
        store.put_archive(&run(), "sandbox.tar", artifact).await.unwrap();

        let compressed = std::fs::read(dir.path().join("task-1/0/sandbox.tar.gz")).unwrap();
        let mut decoded = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "tar bytes");
    }
}
