//! `FileSystemAccess` over `tokio::fs`.

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    storage::{FileMetadata, FileSystemAccess},
};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::debug;

const APP_DIR: &str = "coda-outline-mover";

/// Desktop file system rooted at a data directory.
///
/// Relative paths resolve against the data directory. Writes go to a
/// sibling temp file that is renamed over the target, so a crash while
/// saving `coda.json` leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct TokioFileSystem {
    data_dir: PathBuf,
}

impl TokioFileSystem {
    /// Rooted at the platform data directory (`~/.local/share/coda-outline-mover`
    /// on Linux).
    pub fn new() -> Self {
        let base = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::with_data_directory(base.join(APP_DIR))
    }

    pub fn with_data_directory(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            self.data_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    fn temp_sibling(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".partial");
        path.with_file_name(name)
    }
}

impl Default for TokioFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_seconds(time: std::io::Result<SystemTime>) -> Option<i64> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| i64::try_from(d.as_secs()).ok())
}

#[async_trait]
impl FileSystemAccess for TokioFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(self.resolve(path)).await?)
    }

    async fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let metadata = fs::metadata(self.resolve(path)).await?;
        Ok(FileMetadata {
            size: metadata.len(),
            created_at: unix_seconds(metadata.created()),
            modified_at: unix_seconds(metadata.modified()),
            is_directory: metadata.is_dir(),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        Ok(fs::create_dir_all(self.resolve(path)).await?)
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes> {
        Ok(Bytes::from(fs::read(self.resolve(path)).await?))
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()> {
        let target = self.resolve(path);
        Self::ensure_parent(&target).await?;

        let partial = Self::temp_sibling(&target);
        fs::write(&partial, &data).await?;
        if let Err(e) = fs::rename(&partial, &target).await {
            fs::remove_file(&partial).await.ok();
            return Err(e.into());
        }

        debug!(path = ?target, size = data.len(), "Wrote file");
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let (from, to) = (self.resolve(from), self.resolve(to));
        Self::ensure_parent(&to).await?;
        fs::rename(&from, &to).await?;
        debug!(from = ?from, to = ?to, "Renamed path");
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(self.resolve(path)).await?)
    }
}
