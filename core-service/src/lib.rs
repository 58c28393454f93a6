//! Core service façade.
//!
//! This crate wires the engine together for host applications: it builds the
//! source and destination connectors from the tokens carried by UI requests,
//! keeps one shared item store and status bus, and routes every
//! [`ClientRequest`](core_runtime::ClientRequest) to the source puller or to
//! the importer owning the job. Desktop hosts enable the `desktop-shims`
//! feature so [`MoverConfig`](core_runtime::MoverConfig) falls back to the
//! reqwest/tokio bridges.
//!
//! ```no_run
//! # async fn example() -> core_service::Result<()> {
//! use core_runtime::{ClientRequest, MoverConfig};
//! use core_runtime::logging::LoggingConfig;
//!
//! let config = MoverConfig::builder().data_dir("/tmp/mover").build()?;
//! let service = core_service::bootstrap(config, Some(LoggingConfig::default()))?;
//! let mut events = service.subscribe();
//!
//! service
//!     .handle(ClientRequest::ListDocs {
//!         token: "coda-token".into(),
//!         destination_token: None,
//!     })
//!     .await?;
//! let _first = events.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod factory;
pub mod service;

pub use error::{CoreError, Result};
pub use factory::{HttpProviderFactory, ProviderFactory};
pub use service::{Ack, MoverService};

use core_runtime::logging::{init_logging, LoggingConfig};
use core_runtime::MoverConfig;

/// Install logging (when `logging` is given) and start a service backed by
/// the HTTP connectors. Must be called from within a Tokio runtime.
pub fn bootstrap(config: MoverConfig, logging: Option<LoggingConfig>) -> Result<MoverService> {
    if let Some(logging) = logging {
        init_logging(logging)?;
    }
    MoverService::new(config)
}
