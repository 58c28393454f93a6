//! # Import Job State Machine
//!
//! One migration attempt, from validation to its audit snapshot.
//!
//! ## State Machine
//!
//! ```text
//! Validating → Confirming → Importing → Done
//!      ↓            ↓            ↓
//!      └──────→ Error / Cancelled ←┘
//! ```
//!
//! A job holds the selected items, the planned [`Instruction`]s, the
//! accumulated issues and logs, and the source → destination id map built
//! while validating and processing.

use chrono::{DateTime, Utc};
use core_runtime::events::{ImportLogEntry, ItemState};
use core_sync::Item;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{ImportError, Result};

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Validating,
    /// Plan ready, waiting for the caller to confirm or reject
    Confirming,
    Importing,
    Done,
    Error,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error | JobState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Validating => "validating",
            JobState::Confirming => "confirming",
            JobState::Importing => "importing",
            JobState::Done => "done",
            JobState::Error => "error",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Status reported on the job's status id.
    pub fn item_state(&self) -> ItemState {
        match self {
            JobState::Validating => ItemState::Validating,
            JobState::Confirming => ItemState::Confirming,
            JobState::Importing => ItemState::Importing,
            JobState::Done => ItemState::Done,
            JobState::Error => ItemState::Error,
            JobState::Cancelled => ItemState::Cancelled,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Instructions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstructionKind {
    CreateCollectionAsPrivate,
    ArchiveOutdatedPage,
    ImportAndPublishPage,
    Skip,
    /// Reorder an imported document among its siblings
    MoveDocument,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::CreateCollectionAsPrivate => "createCollectionAsPrivate",
            InstructionKind::ArchiveOutdatedPage => "archiveOutdatedPage",
            InstructionKind::ImportAndPublishPage => "importAndPublishPage",
            InstructionKind::Skip => "skip",
            InstructionKind::MoveDocument => "moveDocument",
        }
    }
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One planned action against the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// Sequence number within the job, starting at 1
    pub id: u32,
    #[serde(rename = "name")]
    pub kind: InstructionKind,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Instruction {
    /// Unnumbered instruction; [`ImportJob::push`] assigns the id.
    pub fn new(kind: InstructionKind, item_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            kind,
            item_id: item_id.into(),
            document_id: None,
            collection_id: None,
            parent_document_id: None,
            index: None,
            reason: None,
        }
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn moved_to(mut self, parent_document_id: Option<String>, index: usize) -> Self {
        self.parent_document_id = parent_document_id;
        self.index = Some(index);
        self
    }
}

// ============================================================================
// Import Job
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub state: JobState,
    /// Selected items, parents before children
    pub items: Vec<Item>,
    pub issues: Vec<String>,
    pub logs: Vec<ImportLogEntry>,
    pub instructions: Vec<Instruction>,
    /// Source id → destination id (collection or document)
    pub item_id_map: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn new(mut items: Vec<Item>, created_at: DateTime<Utc>) -> Self {
        items.sort_by(|a, b| {
            (a.depth(), a.position, &a.id).cmp(&(b.depth(), b.position, &b.id))
        });

        Self {
            id: Uuid::new_v4().to_string(),
            state: JobState::Validating,
            items,
            issues: Vec::new(),
            logs: Vec::new(),
            instructions: Vec::new(),
            item_id_map: BTreeMap::new(),
            created_at,
            completed_at: None,
        }
    }

    pub fn item(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.item(id).is_some()
    }

    /// Append an instruction, numbering it. Returns the assigned id.
    pub fn push(&mut self, mut instruction: Instruction) -> u32 {
        instruction.id = self.instructions.len() as u32 + 1;
        let id = instruction.id;
        self.instructions.push(instruction);
        id
    }

    pub fn instructions_for(&self, item_id: &str) -> Vec<Instruction> {
        self.instructions
            .iter()
            .filter(|i| i.item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    pub fn log(&mut self, entry: ImportLogEntry) {
        self.logs.push(entry);
    }

    pub fn map_id(&mut self, item_id: impl Into<String>, destination_id: impl Into<String>) {
        self.item_id_map.insert(item_id.into(), destination_id.into());
    }

    pub fn destination_id(&self, item_id: &str) -> Option<&str> {
        self.item_id_map.get(item_id).map(String::as_str)
    }

    /// Drop a previous plan so validation can run again.
    pub fn reset_plan(&mut self) {
        self.issues.clear();
        self.instructions.clear();
        self.item_id_map.clear();
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Validation finished; wait for confirmation.
    pub fn await_confirmation(&mut self) -> Result<()> {
        self.transition(JobState::Confirming)
    }

    pub fn start_import(&mut self) -> Result<()> {
        self.transition(JobState::Importing)
    }

    pub fn finish(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Done)?;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Error)?;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Cancelled)?;
        self.completed_at = Some(at);
        Ok(())
    }

    /// File name of the audit snapshot written when the job ends.
    pub fn audit_file_name(&self) -> String {
        let at = self.completed_at.unwrap_or(self.created_at);
        format!("outline-{}.json", at.format("%Y-%m-%dT%H%M%S"))
    }

    fn transition(&mut self, to: JobState) -> Result<()> {
        let valid = match (self.state, to) {
            (JobState::Validating, JobState::Confirming) => true,
            (JobState::Confirming, JobState::Importing) => true,
            (JobState::Importing, JobState::Done) => true,

            (from, JobState::Error) | (from, JobState::Cancelled) => !from.is_terminal(),

            _ => false,
        };

        if !valid {
            return Err(ImportError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
                reason: format!("Cannot transition from {} to {}", self.state, to),
            });
        }

        self.state = to;
        Ok(())
    }
}
