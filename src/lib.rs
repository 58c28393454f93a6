//! Workspace umbrella crate.
//!
//! Exposes the `desktop-shims` feature flag so host applications can depend
//! on `mover-workspace` and get the service façade with the desktop bridges
//! wired in, without naming each workspace crate.

#[cfg(feature = "desktop-shims")]
pub use core_service::{bootstrap, Ack, CoreError, MoverService};
