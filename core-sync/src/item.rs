//! Indexed source items and tree-path helpers.
//!
//! A tree path is the chain of ancestor ids, each written as `{id}/`, behind
//! a leading `/`. Docs live at the root path `/`; a top-level page of doc `D`
//! has `/D/`; its child has `/D/P/`.

use bridge_traits::source::SourcePage;
use chrono::{DateTime, Utc};
use core_runtime::events::{ItemKindTag, ItemPayload};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ROOT_TREE_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Doc,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub tree_path: String,
    /// Source content type for pages; only `canvas` pages are exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Folder for docs, exported artifact for pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    /// Order among siblings in the source listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl Item {
    pub fn doc(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ItemKind::Doc,
            tree_path: ROOT_TREE_PATH.to_string(),
            content_type: None,
            file_path: None,
            synced_at: None,
            position: None,
        }
    }

    pub fn page(
        id: impl Into<String>,
        name: impl Into<String>,
        content_type: impl Into<String>,
        tree_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: ItemKind::Page,
            tree_path: tree_path.into(),
            content_type: Some(content_type.into()),
            file_path: None,
            synced_at: None,
            position: None,
        }
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_synced_at(mut self, at: DateTime<Utc>) -> Self {
        self.synced_at = Some(at);
        self
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn is_doc(&self) -> bool {
        self.kind == ItemKind::Doc
    }

    pub fn is_root(&self) -> bool {
        self.tree_path == ROOT_TREE_PATH
    }

    pub fn is_exportable(&self) -> bool {
        self.kind == ItemKind::Page && self.content_type.as_deref() == Some(SourcePage::CANVAS)
    }

    /// Tree path shared by this item's direct children.
    pub fn child_tree_path(&self) -> String {
        format!("{}{}/", self.tree_path, self.id)
    }

    /// Ancestor ids from the root doc down to the direct parent.
    pub fn ancestor_ids(&self) -> Vec<&str> {
        ancestor_ids(&self.tree_path)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.ancestor_ids().last().copied()
    }

    /// Id of the doc this item belongs to (itself for docs).
    pub fn root_id(&self) -> &str {
        self.ancestor_ids().first().copied().unwrap_or(self.id.as_str())
    }

    pub fn depth(&self) -> usize {
        self.ancestor_ids().len()
    }

    /// Whether `self` sits anywhere below `ancestor_id`.
    pub fn is_descendant_of(&self, ancestor_id: &str) -> bool {
        self.ancestor_ids().contains(&ancestor_id)
    }

    /// Directory that holds this item's children: the doc folder itself, or
    /// a folder named after a page's file stem next to the page artifact.
    pub fn children_dir(&self) -> Option<PathBuf> {
        let path = self.file_path.as_deref()?;
        match self.kind {
            ItemKind::Doc => Some(path.to_path_buf()),
            ItemKind::Page => Some(path.with_extension("")),
        }
    }

    /// Whether the remote copy changed after the last local materialization.
    pub fn is_stale(&self, remote_updated_at: DateTime<Utc>) -> bool {
        match self.synced_at {
            Some(synced_at) => synced_at < remote_updated_at,
            None => true,
        }
    }

    pub fn to_payload(&self) -> ItemPayload {
        ItemPayload {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: match self.kind {
                ItemKind::Doc => ItemKindTag::Doc,
                ItemKind::Page => ItemKindTag::Page,
            },
            tree_path: self.tree_path.clone(),
            synced_at: self.synced_at,
            exportable: self.is_exportable(),
        }
    }
}

impl From<&Item> for ItemPayload {
    fn from(item: &Item) -> Self {
        item.to_payload()
    }
}

pub fn ancestor_ids(tree_path: &str) -> Vec<&str> {
    tree_path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Tree paths start at the root and every segment is terminated by `/`.
pub fn is_valid_tree_path(tree_path: &str) -> bool {
    tree_path.starts_with('/')
        && tree_path.ends_with('/')
        && !tree_path[1..].contains("//")
}

/// File-system safe name: path separators become spaces.
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\'], " ")
}

/// Rewrite `path` from under `old_prefix` to under `new_prefix`.
pub fn rebase_path(path: &Path, old_prefix: &Path, new_prefix: &Path) -> Option<PathBuf> {
    path.strip_prefix(old_prefix)
        .ok()
        .map(|rest| new_prefix.join(rest))
}
