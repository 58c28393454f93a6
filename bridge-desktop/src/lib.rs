//! # Desktop Bridges
//!
//! Host capabilities for desktop builds, selected by `core-runtime`'s
//! `desktop-shims` feature when the embedding application does not supply
//! its own:
//!
//! - [`ReqwestHttpClient`]: pooled reqwest transport with 5xx backoff and
//!   multipart uploads
//! - [`TokioFileSystem`]: `tokio::fs` rooted at the data directory, with
//!   atomic file replacement

mod filesystem;
mod http;

pub use filesystem::TokioFileSystem;
pub use http::ReqwestHttpClient;
