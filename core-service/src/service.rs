//! Request routing between the UI collaborator and the engine.

use std::collections::HashMap;
use std::sync::Arc;

use core_import::{DestinationImporter, ImportError, ImportJob};
use core_runtime::events::EventStream;
use core_runtime::{ClientRequest, EventBus, MoverConfig};
use core_sync::{ItemStore, SourcePuller, StatusBus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{CoreError, Result};
use crate::factory::{HttpProviderFactory, ProviderFactory};

/// Acknowledgement returned for every handled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ack {
    /// A listing sync was queued.
    Syncing,
    /// An import job was created and is validating.
    #[serde(rename_all = "camelCase")]
    ImportStarted { job_id: String },
    /// A confirm, reject or cancel request was applied.
    #[serde(rename_all = "camelCase")]
    Accepted { job_id: String },
}

struct ActivePuller {
    source_token: String,
    destination_token: Option<String>,
    puller: SourcePuller,
}

struct ServiceInner {
    config: MoverConfig,
    factory: Arc<dyn ProviderFactory>,
    events: EventBus,
    store: Arc<ItemStore>,
    status: Arc<StatusBus>,
    puller: Mutex<Option<ActivePuller>>,
    /// Importers keyed by destination token
    importers: Mutex<HashMap<String, DestinationImporter>>,
    /// Destination token owning each job
    job_owners: Mutex<HashMap<String, String>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Primary façade exposed to host applications.
///
/// Owns the shared item store and status bus, builds providers from the
/// tokens carried by requests and routes each request to the puller or to
/// the importer that owns the job.
#[derive(Clone)]
pub struct MoverService {
    inner: Arc<ServiceInner>,
}

impl MoverService {
    /// Create a service backed by the HTTP connectors.
    ///
    /// Must be called from within a Tokio runtime: the status flusher is
    /// spawned right away.
    pub fn new(config: MoverConfig) -> Result<Self> {
        let factory = Arc::new(HttpProviderFactory::from_config(&config));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: MoverConfig, factory: Arc<dyn ProviderFactory>) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.event_buffer_size);
        let store = Arc::new(ItemStore::new(
            config.file_system.clone(),
            config.snapshot_path(),
        ));
        let status = Arc::new(StatusBus::new(events.clone()));
        let flusher = status.spawn_flusher(config.status_flush_interval);

        info!(data_dir = %config.data_dir.display(), "Mover service started");

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                factory,
                events,
                store,
                status,
                puller: Mutex::new(None),
                importers: Mutex::new(HashMap::new()),
                job_owners: Mutex::new(HashMap::new()),
                flusher: Mutex::new(Some(flusher)),
            }),
        })
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.inner.events.subscribe())
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.inner.store
    }

    pub fn status(&self) -> &Arc<StatusBus> {
        &self.inner.status
    }

    /// Parse a raw UI message and handle it.
    pub async fn handle_json(&self, raw: &str) -> Result<Ack> {
        let request = ClientRequest::from_json(raw)?;
        self.handle(request).await
    }

    #[instrument(skip(self, request), fields(request = request.name()))]
    pub async fn handle(&self, request: ClientRequest) -> Result<Ack> {
        if self.inner.flusher.lock().await.is_none() {
            return Err(CoreError::ShutDown);
        }

        match request {
            ClientRequest::ListDocs {
                token,
                destination_token,
            } => {
                self.list_docs(token, destination_token).await?;
                Ok(Ack::Syncing)
            }
            ClientRequest::Import { token, item_ids } => {
                let job_id = self.import(token, &item_ids).await?;
                Ok(Ack::ImportStarted { job_id })
            }
            ClientRequest::ImportConfirm { job_id } => {
                self.importer_for_job(&job_id).await?.confirm(&job_id).await?;
                Ok(Ack::Accepted { job_id })
            }
            ClientRequest::ImportReject { job_id } => {
                self.importer_for_job(&job_id).await?.reject(&job_id).await?;
                Ok(Ack::Accepted { job_id })
            }
            ClientRequest::ImportCancel { job_id } => {
                self.importer_for_job(&job_id).await?.cancel(&job_id).await?;
                Ok(Ack::Accepted { job_id })
            }
        }
    }

    /// Current state of an import job, if any importer knows it.
    pub async fn job(&self, job_id: &str) -> Option<ImportJob> {
        let importer = self.importer_for_job(job_id).await.ok()?;
        importer.job(job_id).await
    }

    /// Await the puller and every importer until no work is left.
    pub async fn wait_idle(&self) {
        let puller = self
            .inner
            .puller
            .lock()
            .await
            .as_ref()
            .map(|active| active.puller.clone());
        if let Some(puller) = puller {
            puller.wait_idle().await;
        }

        let importers: Vec<DestinationImporter> =
            self.inner.importers.lock().await.values().cloned().collect();
        for importer in importers {
            importer.wait_idle().await;
        }
    }

    /// Dispose the puller and importers, then flush the last statuses.
    pub async fn shutdown(&self) {
        let flusher = self.inner.flusher.lock().await.take();
        let Some(flusher) = flusher else {
            return;
        };

        if let Some(active) = self.inner.puller.lock().await.take() {
            active.puller.dispose().await;
        }

        let importers: Vec<DestinationImporter> = self
            .inner
            .importers
            .lock()
            .await
            .drain()
            .map(|(_, importer)| importer)
            .collect();
        for importer in importers {
            importer.dispose().await;
        }

        flusher.abort();
        let flushed = self.inner.status.flush();
        info!(flushed, "Mover service stopped");
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Reuses the running puller while both tokens are unchanged; otherwise
    /// the old puller is disposed before its replacement starts.
    async fn list_docs(&self, token: String, destination_token: Option<String>) -> Result<()> {
        let inner = &self.inner;
        let mut slot = inner.puller.lock().await;

        let reusable = slot.as_ref().is_some_and(|active| {
            active.source_token == token && active.destination_token == destination_token
        });

        if !reusable {
            if let Some(previous) = slot.take() {
                info!("Source credentials changed, replacing puller");
                previous.puller.dispose().await;
            }

            let source = inner.factory.source(&token)?;
            let destination = destination_token
                .as_deref()
                .map(|token| inner.factory.destination(token))
                .transpose()?;
            let puller = SourcePuller::new(
                &inner.config,
                source,
                destination,
                inner.store.clone(),
                inner.status.clone(),
            );
            *slot = Some(ActivePuller {
                source_token: token,
                destination_token,
                puller,
            });
        }

        let puller = match slot.as_ref() {
            Some(active) => active.puller.clone(),
            None => return Err(CoreError::InitializationFailed("Puller missing".into())),
        };
        drop(slot);

        puller.sync_docs().await?;
        Ok(())
    }

    async fn import(&self, token: String, item_ids: &[String]) -> Result<String> {
        let importer = self.importer_for_token(&token).await?;
        let job_id = importer.start(item_ids).await?;

        self.inner
            .job_owners
            .lock()
            .await
            .insert(job_id.clone(), token);
        debug!(job_id = %job_id, items = item_ids.len(), "Import job registered");
        Ok(job_id)
    }

    async fn importer_for_token(&self, token: &str) -> Result<DestinationImporter> {
        let inner = &self.inner;
        let mut importers = inner.importers.lock().await;
        if let Some(importer) = importers.get(token) {
            return Ok(importer.clone());
        }

        let destination = inner.factory.destination(token)?;
        let importer = DestinationImporter::new(
            &inner.config,
            destination,
            inner.store.clone(),
            inner.status.clone(),
        );
        importers.insert(token.to_string(), importer.clone());
        Ok(importer)
    }

    async fn importer_for_job(&self, job_id: &str) -> Result<DestinationImporter> {
        let owner = self.inner.job_owners.lock().await.get(job_id).cloned();
        let importer = match owner {
            Some(token) => self.inner.importers.lock().await.get(&token).cloned(),
            None => None,
        };

        importer.ok_or_else(|| {
            warn!(job_id, "Request for unknown import job");
            CoreError::Import(ImportError::JobNotFound(job_id.to_string()))
        })
    }
}

impl std::fmt::Debug for MoverService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoverService")
            .field("data_dir", &self.inner.config.data_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::MockProviderFactory;
    use async_trait::async_trait;
    use bridge_desktop::TokioFileSystem;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::{
        BridgeError, Collection, CreateCollection, CreateDocument, DestinationProvider, Document,
        DocumentNode, ExportFormat, ExportJob, HttpClient, HttpRequest, HttpResponse, Listing,
        MoveDocument, PageExport, SourceDoc, SourcePage, SourceProvider, UpdateDocument, User,
    };
    use bytes::Bytes;
    use core_import::JobState;
    use std::path::Path;
    use tempfile::TempDir;

    struct NoHttp;

    #[async_trait]
    impl HttpClient for NoHttp {
        async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
            Err(BridgeError::NotAvailable("offline".into()))
        }
    }

    struct EmptySource;

    #[async_trait]
    impl SourceProvider for EmptySource {
        async fn list_docs(&self, _page_token: Option<&str>) -> BridgeResult<Listing<SourceDoc>> {
            Ok(Listing::last(Vec::new()))
        }
        async fn list_pages_for_doc(
            &self,
            _doc_id: &str,
            _page_token: Option<&str>,
        ) -> BridgeResult<Listing<SourcePage>> {
            Ok(Listing::last(Vec::new()))
        }
        async fn export_page(
            &self,
            _doc_id: &str,
            page_id: &str,
            _format: ExportFormat,
        ) -> BridgeResult<ExportJob> {
            Err(BridgeError::NotFound(page_id.to_string()))
        }
        async fn get_page_export(
            &self,
            _doc_id: &str,
            _page_id: &str,
            _export_id: &str,
        ) -> BridgeResult<PageExport> {
            Ok(PageExport::not_found())
        }
        async fn download(&self, url: &str) -> BridgeResult<Bytes> {
            Err(BridgeError::NotFound(url.to_string()))
        }
    }

    struct EmptyDestination;

    #[async_trait]
    impl DestinationProvider for EmptyDestination {
        async fn list_collections(&self, _offset: usize) -> BridgeResult<Vec<Collection>> {
            Ok(Vec::new())
        }
        async fn search_documents(
            &self,
            _collection_id: &str,
            _query: &str,
        ) -> BridgeResult<Vec<Document>> {
            Ok(Vec::new())
        }
        async fn create_collection(&self, _input: CreateCollection) -> BridgeResult<Collection> {
            Err(BridgeError::OperationFailed("read only".into()))
        }
        async fn create_document(&self, _input: CreateDocument) -> BridgeResult<Document> {
            Err(BridgeError::OperationFailed("read only".into()))
        }
        async fn get_document(&self, id: &str) -> BridgeResult<Document> {
            Err(BridgeError::NotFound(id.to_string()))
        }
        async fn archive_document(&self, _id: &str) -> BridgeResult<()> {
            Ok(())
        }
        async fn import_document_by_file(
            &self,
            _collection_id: &str,
            _file_path: &Path,
            _parent_document_id: Option<&str>,
        ) -> BridgeResult<Document> {
            Err(BridgeError::OperationFailed("read only".into()))
        }
        async fn update_document(&self, _input: UpdateDocument) -> BridgeResult<Document> {
            Err(BridgeError::OperationFailed("read only".into()))
        }
        async fn get_collection_tree(
            &self,
            _collection_id: &str,
        ) -> BridgeResult<Vec<DocumentNode>> {
            Ok(Vec::new())
        }
        async fn move_document(&self, _input: MoveDocument) -> BridgeResult<()> {
            Ok(())
        }
        async fn list_users(&self, _emails: &[String]) -> BridgeResult<Vec<User>> {
            Ok(Vec::new())
        }
    }

    fn service(dir: &TempDir, factory: MockProviderFactory) -> MoverService {
        let config = MoverConfig::builder()
            .data_dir(dir.path())
            .http_client(Arc::new(NoHttp))
            .file_system(Arc::new(TokioFileSystem::with_data_directory(
                dir.path().to_path_buf(),
            )))
            .rate_limit_retry_delay_ms(5)
            .build()
            .unwrap();
        MoverService::with_factory(config, Arc::new(factory)).unwrap()
    }

    fn list_docs(token: &str) -> ClientRequest {
        ClientRequest::ListDocs {
            token: token.into(),
            destination_token: None,
        }
    }

    #[test]
    fn test_ack_wire_format() {
        let ack = Ack::ImportStarted {
            job_id: "job-1".into(),
        };
        let json = serde_json::to_value(&ack).unwrap();

        assert_eq!(json["type"], "importStarted");
        assert_eq!(json["jobId"], "job-1");
        assert_eq!(
            serde_json::to_value(Ack::Syncing).unwrap()["type"],
            "syncing"
        );
    }

    #[tokio::test]
    async fn test_puller_replaced_only_when_token_changes() {
        let dir = TempDir::new().unwrap();
        let mut factory = MockProviderFactory::new();
        factory
            .expect_source()
            .withf(|token: &str| token == "first")
            .times(1)
            .returning(|_| Ok(Arc::new(EmptySource) as Arc<dyn SourceProvider>));
        factory
            .expect_source()
            .withf(|token: &str| token == "second")
            .times(1)
            .returning(|_| Ok(Arc::new(EmptySource) as Arc<dyn SourceProvider>));
        let service = service(&dir, factory);

        assert_eq!(service.handle(list_docs("first")).await.unwrap(), Ack::Syncing);
        service.wait_idle().await;
        service.handle(list_docs("first")).await.unwrap();
        service.wait_idle().await;
        service.handle(list_docs("second")).await.unwrap();
        service.wait_idle().await;

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_routed_to_owning_importer() {
        let dir = TempDir::new().unwrap();
        let mut factory = MockProviderFactory::new();
        factory
            .expect_destination()
            .withf(|token: &str| token == "outline")
            .times(1)
            .returning(|_| Ok(Arc::new(EmptyDestination) as Arc<dyn DestinationProvider>));
        let service = service(&dir, factory);

        let job_id = match service
            .handle(ClientRequest::Import {
                token: "outline".into(),
                item_ids: Vec::new(),
            })
            .await
            .unwrap()
        {
            Ack::ImportStarted { job_id } => job_id,
            other => panic!("unexpected ack {other:?}"),
        };
        service.wait_idle().await;
        assert_eq!(
            service.job(&job_id).await.unwrap().state,
            JobState::Confirming
        );

        let ack = service
            .handle(ClientRequest::ImportConfirm {
                job_id: job_id.clone(),
            })
            .await
            .unwrap();
        service.wait_idle().await;

        assert_eq!(
            ack,
            Ack::Accepted {
                job_id: job_id.clone()
            }
        );
        assert_eq!(service.job(&job_id).await.unwrap().state, JobState::Done);
    }

    #[tokio::test]
    async fn test_unknown_job_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockProviderFactory::new());

        let err = service
            .handle(ClientRequest::ImportCancel {
                job_id: "missing".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::Import(ImportError::JobNotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockProviderFactory::new());

        let err = service.handle_json("{\"type\":").await.unwrap_err();

        assert!(matches!(err, CoreError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces() {
        let dir = TempDir::new().unwrap();
        let mut factory = MockProviderFactory::new();
        factory.expect_source().returning(|_| {
            Err(CoreError::CapabilityMissing {
                capability: "source token".into(),
                message: "empty".into(),
            })
        });
        let service = service(&dir, factory);

        let err = service.handle(list_docs("")).await.unwrap_err();

        assert!(matches!(err, CoreError::CapabilityMissing { .. }));
    }

    #[tokio::test]
    async fn test_requests_rejected_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, MockProviderFactory::new());

        service.shutdown().await;
        let err = service.handle(list_docs("token")).await.unwrap_err();

        assert!(matches!(err, CoreError::ShutDown));
    }
}
