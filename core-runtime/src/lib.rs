//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the migration engine crates:
//! - Logging and tracing setup
//! - Engine configuration
//! - The typed request/event protocol and its broadcast bus
//!
//! ## Overview
//!
//! Nothing in here talks to a remote service. The puller, importer and
//! service façade depend on this crate for their configuration, their log
//! conventions and the event types they stream to the UI collaborator.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::MoverConfig;
pub use error::{Error, Result};
pub use events::{ClientRequest, EventBus, ItemState, ServerEvent};
