//! # Destination Import Engine
//!
//! Validates a selection of mirrored items against the destination wiki,
//! waits for confirmation, then executes the resulting instruction plan in
//! dependency order.
//!
//! ## Components
//!
//! - **Job** (`job`): Import job state machine and instruction model
//! - **Importer** (`importer`): Validation, confirmation and processing
//! - **Ordering** (`ordering`): Sibling move planning for the enhanced mode

pub mod error;
pub mod importer;
pub mod job;
pub mod ordering;

pub use error::{ImportError, Result};
pub use importer::DestinationImporter;
pub use job::{ImportJob, Instruction, InstructionKind, JobState};
