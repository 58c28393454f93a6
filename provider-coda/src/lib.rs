//! # Coda Provider
//!
//! Implements [`SourceProvider`](bridge_traits::SourceProvider) for the Coda REST API v1.
//!
//! ## Overview
//!
//! - Paginated doc listing (100 per page) and page listing (50 per page)
//! - Page export requests and export status polling
//! - Download of finished exports from their pre-signed links
//! - HTTP 429 surfaced as `BridgeError::RateLimited` for scheduler demotion

pub mod connector;
pub mod error;
pub mod types;

pub use connector::CodaConnector;
pub use error::{CodaError, Result};
