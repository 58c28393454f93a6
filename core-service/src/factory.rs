//! Construction of source and destination connectors from API tokens.

use std::sync::Arc;

use bridge_traits::{DestinationProvider, FileSystemAccess, HttpClient, SourceProvider};
use core_runtime::MoverConfig;
use provider_coda::CodaConnector;
use provider_outline::OutlineConnector;

use crate::error::{CoreError, Result};

/// Builds provider handles for the tokens carried by client requests.
#[cfg_attr(test, mockall::automock)]
pub trait ProviderFactory: Send + Sync {
    fn source(&self, token: &str) -> Result<Arc<dyn SourceProvider>>;

    fn destination(&self, token: &str) -> Result<Arc<dyn DestinationProvider>>;
}

/// Factory producing the HTTP connectors for the configured API bases.
pub struct HttpProviderFactory {
    http_client: Arc<dyn HttpClient>,
    file_system: Arc<dyn FileSystemAccess>,
    source_api_base: String,
    destination_api_base: String,
}

impl HttpProviderFactory {
    pub fn from_config(config: &MoverConfig) -> Self {
        Self {
            http_client: config.http_client.clone(),
            file_system: config.file_system.clone(),
            source_api_base: config.source_api_base.clone(),
            destination_api_base: config.destination_api_base.clone(),
        }
    }
}

fn require_token(kind: &str, token: &str) -> Result<()> {
    if token.trim().is_empty() {
        return Err(CoreError::CapabilityMissing {
            capability: format!("{kind} token"),
            message: format!("A {kind} API token is required"),
        });
    }
    Ok(())
}

impl ProviderFactory for HttpProviderFactory {
    fn source(&self, token: &str) -> Result<Arc<dyn SourceProvider>> {
        require_token("source", token)?;
        Ok(Arc::new(CodaConnector::with_base_url(
            self.http_client.clone(),
            token.to_string(),
            self.source_api_base.clone(),
        )))
    }

    fn destination(&self, token: &str) -> Result<Arc<dyn DestinationProvider>> {
        require_token("destination", token)?;
        Ok(Arc::new(OutlineConnector::with_base_url(
            self.http_client.clone(),
            self.file_system.clone(),
            token.to_string(),
            self.destination_api_base.clone(),
        )))
    }
}
