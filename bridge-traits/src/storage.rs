//! File System Abstraction
//!
//! The local mirror (exported artifacts, item snapshot, import audit files)
//! goes through this trait so tests can observe every rename and write.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub size: u64,
    /// Unix seconds, when the platform records it
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub is_directory: bool,
}

/// Local file system as seen by the puller, item store and importer.
///
/// Relative paths are resolved by the implementation; the engine always
/// passes absolute paths derived from the configured data directory.
#[async_trait]
pub trait FileSystemAccess: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Used for upload size checks and staleness of local artifacts.
    async fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn read_file(&self, path: &Path) -> Result<Bytes>;

    /// Replace the file contents, creating parent directories as needed.
    /// Readers never observe a partially written file.
    async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;

    /// Move a file or a whole directory tree in one operation, creating the
    /// destination's parent directories as needed.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn delete_file(&self, path: &Path) -> Result<()>;
}
