//! # Mover Configuration Module
//!
//! Configuration for the Coda → Outline migration engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `MoverConfig`
//! holding the host bridges and tuning knobs for the scheduler, puller and
//! importer. `build()` validates everything up front so a misconfigured engine
//! fails before any remote call is made.
//!
//! ## Required Settings
//!
//! - `data_dir` - Root of the local mirror. Holds `coda.json` (item snapshot),
//!   `docs/` (exported artifacts) and `imports/` (audit snapshots).
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - HTTP operations (desktop default: reqwest)
//! - `FileSystemAccess` - File I/O (desktop default: tokio fs)
//! - `Clock` - Time source (default: system clock)
//!
//! When the `desktop-shims` feature is enabled, desktop defaults are injected
//! automatically if not provided. Without it, missing bridges are reported as
//! [`Error::CapabilityMissing`].
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::MoverConfig;
//!
//! let config = MoverConfig::builder()
//!     .data_dir("/home/me/.local/share/coda-outline-mover")
//!     .puller_concurrency(3)
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{Clock, ExportFormat, FileSystemAccess, HttpClient, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SOURCE_API_BASE: &str = "https://coda.io/apis/v1";
pub const DEFAULT_DESTINATION_API_BASE: &str = "https://app.getoutline.com/api";

pub const SNAPSHOT_FILE_NAME: &str = "coda.json";
pub const DOCS_DIR_NAME: &str = "docs";
pub const IMPORTS_DIR_NAME: &str = "imports";

const MAX_CONCURRENCY: usize = 10;
const MAX_DELAY_MS: u64 = 60_000;

/// Tuning for the priority scheduler shared by puller and importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Maximum number of tasks running at once
    pub concurrency: usize,
    /// Delay before a rate-limited task is re-queued at low priority
    pub rate_limit_retry_delay: Duration,
}

/// Puller-specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullerSettings {
    pub scheduler: SchedulerSettings,
    /// Per in-flight export initiation delay
    pub export_throttle: Duration,
    pub export_format: ExportFormat,
    /// Persist the item snapshot after this many completed exports
    pub snapshot_every_exports: usize,
}

/// Importer-specific settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImporterSettings {
    pub scheduler: SchedulerSettings,
    /// Artifacts above this size are flagged instead of uploaded
    pub max_upload_bytes: u64,
    /// Enables sibling reordering and the upload size check
    pub enhanced: bool,
}

/// Engine configuration. Use [`MoverConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct MoverConfig {
    pub data_dir: PathBuf,
    pub source_api_base: String,
    pub destination_api_base: String,
    pub puller: PullerSettings,
    pub importer: ImporterSettings,
    /// Interval at which coalesced statuses are forwarded
    pub status_flush_interval: Duration,
    /// Capacity of the engine → UI broadcast channel
    pub event_buffer_size: usize,
    pub http_client: Arc<dyn HttpClient>,
    pub file_system: Arc<dyn FileSystemAccess>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MoverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoverConfig")
            .field("data_dir", &self.data_dir)
            .field("source_api_base", &self.source_api_base)
            .field("destination_api_base", &self.destination_api_base)
            .field("puller", &self.puller)
            .field("importer", &self.importer)
            .field("status_flush_interval", &self.status_flush_interval)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("http_client", &"HttpClient { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl MoverConfig {
    pub fn builder() -> MoverConfigBuilder {
        MoverConfigBuilder::default()
    }

    /// Persisted item store snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE_NAME)
    }

    /// Root of the exported doc/page tree.
    pub fn docs_dir(&self) -> PathBuf {
        self.data_dir.join(DOCS_DIR_NAME)
    }

    /// Directory of timestamped import job snapshots.
    pub fn imports_dir(&self) -> PathBuf {
        self.data_dir.join(IMPORTS_DIR_NAME)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("Data directory cannot be empty".to_string()));
        }

        validate_concurrency("Puller", self.puller.scheduler.concurrency)?;
        validate_concurrency("Importer", self.importer.scheduler.concurrency)?;

        validate_delay("Export throttle", self.puller.export_throttle)?;
        validate_delay(
            "Puller rate limit retry delay",
            self.puller.scheduler.rate_limit_retry_delay,
        )?;
        validate_delay(
            "Importer rate limit retry delay",
            self.importer.scheduler.rate_limit_retry_delay,
        )?;

        if self.puller.snapshot_every_exports == 0 {
            return Err(Error::Config(
                "Snapshot interval must be at least 1 export".to_string(),
            ));
        }

        if self.importer.max_upload_bytes == 0 {
            return Err(Error::Config(
                "Maximum upload size must be greater than 0 bytes".to_string(),
            ));
        }

        if self.status_flush_interval < Duration::from_millis(10) {
            return Err(Error::Config(
                "Status flush interval must be at least 10ms".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.source_api_base.is_empty() || self.destination_api_base.is_empty() {
            return Err(Error::Config("API base URLs cannot be empty".to_string()));
        }

        Ok(())
    }
}

fn validate_concurrency(what: &str, value: usize) -> Result<()> {
    if value == 0 || value > MAX_CONCURRENCY {
        return Err(Error::Config(format!(
            "{} concurrency must be between 1 and {}, got {}",
            what, MAX_CONCURRENCY, value
        )));
    }
    Ok(())
}

fn validate_delay(what: &str, value: Duration) -> Result<()> {
    if value > Duration::from_millis(MAX_DELAY_MS) {
        return Err(Error::Config(format!(
            "{} exceeds maximum of 60 seconds (60,000ms)",
            what
        )));
    }
    Ok(())
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "No HTTP client implementation provided. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Otherwise inject an HttpClient implementation."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn file_system_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "FileSystemAccess".to_string(),
        message: "No file system implementation provided. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default TokioFileSystem. \
                 Otherwise inject a FileSystemAccess implementation."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    let client = bridge_desktop::ReqwestHttpClient::with_timeout(Duration::from_secs(30))
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system(data_dir: &Path) -> Result<Arc<dyn FileSystemAccess>> {
    Ok(Arc::new(bridge_desktop::TokioFileSystem::with_data_directory(
        data_dir.to_path_buf(),
    )))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system(_data_dir: &Path) -> Result<Arc<dyn FileSystemAccess>> {
    Err(file_system_missing_error())
}

/// Builder for [`MoverConfig`].
#[derive(Default)]
pub struct MoverConfigBuilder {
    data_dir: Option<PathBuf>,
    source_api_base: Option<String>,
    destination_api_base: Option<String>,
    puller_concurrency: Option<usize>,
    importer_concurrency: Option<usize>,
    export_throttle_ms: Option<u64>,
    export_format: Option<ExportFormat>,
    snapshot_every_exports: Option<usize>,
    rate_limit_retry_delay_ms: Option<u64>,
    status_flush_interval_ms: Option<u64>,
    max_upload_bytes: Option<u64>,
    enhanced_import: Option<bool>,
    event_buffer_size: Option<usize>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    clock: Option<Arc<dyn Clock>>,
}

impl MoverConfigBuilder {
    /// Sets the local mirror root (required).
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn source_api_base(mut self, url: impl Into<String>) -> Self {
        self.source_api_base = Some(url.into());
        self
    }

    pub fn destination_api_base(mut self, url: impl Into<String>) -> Self {
        self.destination_api_base = Some(url.into());
        self
    }

    /// Concurrent source tasks.
    ///
    /// Default: 5. Valid range 1..=10; lower values are gentler on the source API.
    pub fn puller_concurrency(mut self, value: usize) -> Self {
        self.puller_concurrency = Some(value);
        self
    }

    /// Concurrent destination tasks.
    ///
    /// Default: 3. Valid range 1..=10.
    pub fn importer_concurrency(mut self, value: usize) -> Self {
        self.importer_concurrency = Some(value);
        self
    }

    /// Delay per in-flight export initiation.
    ///
    /// Default: 1000ms
    pub fn export_throttle_ms(mut self, value: u64) -> Self {
        self.export_throttle_ms = Some(value);
        self
    }

    /// Default: markdown
    pub fn export_format(mut self, format: ExportFormat) -> Self {
        self.export_format = Some(format);
        self
    }

    /// Default: 10
    pub fn snapshot_every_exports(mut self, value: usize) -> Self {
        self.snapshot_every_exports = Some(value);
        self
    }

    /// Delay before a 429'd task is re-queued.
    ///
    /// Default: 1000ms
    pub fn rate_limit_retry_delay_ms(mut self, value: u64) -> Self {
        self.rate_limit_retry_delay_ms = Some(value);
        self
    }

    /// Default: 250ms
    pub fn status_flush_interval_ms(mut self, value: u64) -> Self {
        self.status_flush_interval_ms = Some(value);
        self
    }

    /// Default: 10 MiB
    pub fn max_upload_bytes(mut self, value: u64) -> Self {
        self.max_upload_bytes = Some(value);
        self
    }

    /// Default: true
    pub fn enhanced_import(mut self, enabled: bool) -> Self {
        self.enhanced_import = Some(enabled);
        self
    }

    /// Default: 100
    pub fn event_buffer_size(mut self, value: usize) -> Self {
        self.event_buffer_size = Some(value);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the final `MoverConfig` instance.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `data_dir` is missing
    /// - A bridge is missing and no desktop default is available
    /// - Any numeric setting is out of range
    pub fn build(self) -> Result<MoverConfig> {
        let data_dir = self.data_dir.ok_or_else(|| {
            Error::Config("Data directory is required. Use .data_dir() to set it.".to_string())
        })?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system(&data_dir)?,
        };

        let retry_delay = Duration::from_millis(self.rate_limit_retry_delay_ms.unwrap_or(1000));

        let config = MoverConfig {
            data_dir,
            source_api_base: self
                .source_api_base
                .unwrap_or_else(|| DEFAULT_SOURCE_API_BASE.to_string()),
            destination_api_base: self
                .destination_api_base
                .unwrap_or_else(|| DEFAULT_DESTINATION_API_BASE.to_string()),
            puller: PullerSettings {
                scheduler: SchedulerSettings {
                    concurrency: self.puller_concurrency.unwrap_or(5),
                    rate_limit_retry_delay: retry_delay,
                },
                export_throttle: Duration::from_millis(self.export_throttle_ms.unwrap_or(1000)),
                export_format: self.export_format.unwrap_or(ExportFormat::Markdown),
                snapshot_every_exports: self.snapshot_every_exports.unwrap_or(10),
            },
            importer: ImporterSettings {
                scheduler: SchedulerSettings {
                    concurrency: self.importer_concurrency.unwrap_or(3),
                    rate_limit_retry_delay: retry_delay,
                },
                max_upload_bytes: self.max_upload_bytes.unwrap_or(10 * 1024 * 1024),
                enhanced: self.enhanced_import.unwrap_or(true),
            },
            status_flush_interval: Duration::from_millis(
                self.status_flush_interval_ms.unwrap_or(250),
            ),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
            http_client,
            file_system,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{FileMetadata, HttpRequest, HttpResponse};
    use bytes::Bytes;

    struct MockHttpClient;

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            unimplemented!()
        }
    }

    struct MockFileSystem;

    #[async_trait]
    impl FileSystemAccess for MockFileSystem {
        async fn exists(&self, _path: &Path) -> BridgeResult<bool> {
            unimplemented!()
        }
        async fn metadata(&self, _path: &Path) -> BridgeResult<FileMetadata> {
            unimplemented!()
        }
        async fn create_dir_all(&self, _path: &Path) -> BridgeResult<()> {
            unimplemented!()
        }
        async fn read_file(&self, _path: &Path) -> BridgeResult<Bytes> {
            unimplemented!()
        }
        async fn write_file(&self, _path: &Path, _data: Bytes) -> BridgeResult<()> {
            unimplemented!()
        }
        async fn rename(&self, _from: &Path, _to: &Path) -> BridgeResult<()> {
            unimplemented!()
        }
        async fn delete_file(&self, _path: &Path) -> BridgeResult<()> {
            unimplemented!()
        }
    }

    fn builder() -> MoverConfigBuilder {
        MoverConfig::builder()
            .data_dir("/tmp/mover")
            .http_client(Arc::new(MockHttpClient))
            .file_system(Arc::new(MockFileSystem))
    }

    #[test]
    fn test_defaults() {
        let config = builder().build().unwrap();

        assert_eq!(config.puller.scheduler.concurrency, 5);
        assert_eq!(config.importer.scheduler.concurrency, 3);
        assert_eq!(config.puller.export_throttle, Duration::from_millis(1000));
        assert_eq!(config.puller.export_format, ExportFormat::Markdown);
        assert_eq!(config.puller.snapshot_every_exports, 10);
        assert_eq!(config.importer.max_upload_bytes, 10 * 1024 * 1024);
        assert!(config.importer.enhanced);
        assert_eq!(config.event_buffer_size, 100);
        assert_eq!(config.source_api_base, DEFAULT_SOURCE_API_BASE);
        assert_eq!(config.destination_api_base, DEFAULT_DESTINATION_API_BASE);
    }

    #[test]
    fn test_derived_paths() {
        let config = builder().build().unwrap();

        assert_eq!(config.snapshot_path(), PathBuf::from("/tmp/mover/coda.json"));
        assert_eq!(config.docs_dir(), PathBuf::from("/tmp/mover/docs"));
        assert_eq!(config.imports_dir(), PathBuf::from("/tmp/mover/imports"));
    }

    #[test]
    fn test_builder_requires_data_dir() {
        let result = MoverConfig::builder()
            .http_client(Arc::new(MockHttpClient))
            .file_system(Arc::new(MockFileSystem))
            .build();

        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Data directory is required"));
    }

    #[test]
    fn test_concurrency_operating_points() {
        for value in [1, 3, 5, 10] {
            assert!(builder().puller_concurrency(value).build().is_ok());
            assert!(builder().importer_concurrency(value).build().is_ok());
        }
        assert!(builder().puller_concurrency(0).build().is_err());
        assert!(builder().importer_concurrency(11).build().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(builder().export_throttle_ms(60_001).build().is_err());
        assert!(builder().rate_limit_retry_delay_ms(120_000).build().is_err());
        assert!(builder().snapshot_every_exports(0).build().is_err());
        assert!(builder().max_upload_bytes(0).build().is_err());
        assert!(builder().status_flush_interval_ms(1).build().is_err());
        assert!(builder().event_buffer_size(0).build().is_err());
        assert!(builder().source_api_base("").build().is_err());
    }

    #[cfg(not(feature = "desktop-shims"))]
    #[test]
    fn test_missing_http_client_is_capability_error() {
        let result = MoverConfig::builder()
            .data_dir("/tmp/mover")
            .file_system(Arc::new(MockFileSystem))
            .build();

        match result {
            Err(Error::CapabilityMissing { capability, .. }) => {
                assert_eq!(capability, "HttpClient")
            }
            other => panic!("expected capability error, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_build_with_desktop_defaults() {
        let config = MoverConfig::builder()
            .data_dir("/tmp/mover")
            .build()
            .expect("desktop defaults should succeed");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/mover"));
    }

    #[test]
    fn test_debug_hides_bridges() {
        let config = builder().build().unwrap();
        let debug = format!("{:?}", config);
        assert!(debug.contains("HttpClient { ... }"));
        assert!(debug.contains("data_dir"));
    }
}
