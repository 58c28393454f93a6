//! # Outline Provider
//!
//! Implements [`DestinationProvider`](bridge_traits::DestinationProvider) for the
//! Outline wiki RPC API.
//!
//! Every Outline endpoint is a `POST /api/{resource}.{action}` with a JSON
//! body and a `{ "data": ... }` envelope. Imports are multipart uploads.

pub mod connector;
pub mod error;
pub mod types;

pub use connector::OutlineConnector;
pub use error::{OutlineError, Result};
