//! # Item Store
//!
//! Encapsulated index of docs and pages keyed by id.
//!
//! All writes go through [`ItemStore::put`], which enforces the tree-path
//! invariant: an item's children are exactly the items whose tree path is
//! `{parent.tree_path}{parent.id}/`, so a page may only be stored once its
//! parent is indexed.
//!
//! The store persists to one JSON array sorted by id. Saving unchanged data
//! produces byte-identical output.

use bridge_traits::storage::FileSystemAccess;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::error::{Result, SyncError};
use crate::item::{is_valid_tree_path, rebase_path, Item};

pub struct ItemStore {
    items: RwLock<HashMap<String, Item>>,
    file_system: Arc<dyn FileSystemAccess>,
    snapshot_path: PathBuf,
    save_lock: Mutex<()>,
    /// Set once the persisted snapshot has been read into memory
    hydrated: Mutex<bool>,
}

impl ItemStore {
    pub fn new(file_system: Arc<dyn FileSystemAccess>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            file_system,
            snapshot_path: snapshot_path.into(),
            save_lock: Mutex::new(()),
            hydrated: Mutex::new(false),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Replace the in-memory index with the persisted snapshot, if any.
    ///
    /// Returns the number of restored items.
    #[instrument(skip(self), fields(path = ?self.snapshot_path))]
    pub async fn load(&self) -> Result<usize> {
        if !self.file_system.exists(&self.snapshot_path).await? {
            debug!("No item snapshot to restore");
            return Ok(0);
        }

        let data = self.file_system.read_file(&self.snapshot_path).await?;
        let restored: Vec<Item> = serde_json::from_slice(&data)
            .map_err(|e| SyncError::Snapshot(format!("Corrupt item snapshot: {}", e)))?;

        let count = restored.len();
        let mut items = self.items.write().await;
        *items = restored
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();

        info!(count, "Restored item snapshot");
        Ok(count)
    }

    /// Load the persisted snapshot the first time the store is used.
    ///
    /// Later calls are no-ops, so a store shared by successive pullers keeps
    /// records written after the last save. Returns whether a load happened.
    pub async fn hydrate(&self) -> Result<bool> {
        let mut hydrated = self.hydrated.lock().await;
        if *hydrated {
            return Ok(false);
        }
        self.load().await?;
        *hydrated = true;
        Ok(true)
    }

    pub async fn is_hydrated(&self) -> bool {
        *self.hydrated.lock().await
    }

    /// Serialized snapshot of the whole index, sorted by id.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        let items = self.all().await;
        Ok(serde_json::to_vec_pretty(&items)?)
    }

    #[instrument(skip(self), fields(path = ?self.snapshot_path))]
    pub async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let data = self.snapshot().await?;
        let size = data.len();

        self.file_system
            .write_file(&self.snapshot_path, Bytes::from(data))
            .await?;

        debug!(size, "Saved item snapshot");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Item> {
        self.items.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.items.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Insert or replace an item, returning the previous record.
    ///
    /// Fails with [`SyncError::MissingParent`] when the item's direct parent
    /// is not indexed.
    pub async fn put(&self, item: Item) -> Result<Option<Item>> {
        if !is_valid_tree_path(&item.tree_path) {
            return Err(SyncError::InvalidTreePath {
                item_id: item.id,
                tree_path: item.tree_path,
            });
        }

        let mut items = self.items.write().await;
        if let Some(parent_id) = item.parent_id() {
            match items.get(parent_id) {
                Some(parent) if parent.child_tree_path() == item.tree_path => {}
                _ => {
                    return Err(SyncError::MissingParent {
                        item_id: item.id.clone(),
                        parent_id: parent_id.to_string(),
                    })
                }
            }
        }

        Ok(items.insert(item.id.clone(), item))
    }

    /// Mutate an existing item in place.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Item>
    where
        F: FnOnce(&mut Item),
    {
        let mut items = self.items.write().await;
        let item = items
            .get_mut(id)
            .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))?;
        mutate(item);
        Ok(item.clone())
    }

    pub async fn remove(&self, id: &str) -> Option<Item> {
        self.items.write().await.remove(id)
    }

    /// Direct children in source order.
    pub async fn children_of(&self, id: &str) -> Vec<Item> {
        let items = self.items.read().await;
        let Some(parent) = items.get(id) else {
            return Vec::new();
        };
        let tree_path = parent.child_tree_path();

        let mut children: Vec<Item> = items
            .values()
            .filter(|item| item.tree_path == tree_path)
            .cloned()
            .collect();
        children.sort_by(|a, b| (a.position, &a.id).cmp(&(b.position, &b.id)));
        children
    }

    /// Every item below `id`, at any depth.
    pub async fn descendants_of(&self, id: &str) -> Vec<Item> {
        self.descendants_of_any(&[id.to_string()]).await
    }

    /// Every item below any of `ids`, ordered by depth then id.
    pub async fn descendants_of_any(&self, ids: &[String]) -> Vec<Item> {
        let items = self.items.read().await;
        let mut found: Vec<Item> = items
            .values()
            .filter(|item| ids.iter().any(|id| item.is_descendant_of(id)))
            .cloned()
            .collect();
        found.sort_by(|a, b| (a.depth(), &a.id).cmp(&(b.depth(), &b.id)));
        found
    }

    /// Rewrite the `file_path` of every descendant of `id` that lives under
    /// `old_prefix` so it lives under `new_prefix` instead.
    ///
    /// Returns the number of rewritten items. Touches no files.
    pub async fn rebase_descendants(&self, id: &str, old_prefix: &Path, new_prefix: &Path) -> usize {
        let mut items = self.items.write().await;
        let mut rewritten = 0;

        for item in items.values_mut().filter(|item| item.is_descendant_of(id)) {
            let rebased = item
                .file_path
                .as_deref()
                .and_then(|path| rebase_path(path, old_prefix, new_prefix));
            if let Some(path) = rebased {
                item.file_path = Some(path);
                rewritten += 1;
            }
        }

        debug!(item_id = %id, rewritten, "Rebased descendant paths");
        rewritten
    }

    /// All items sorted by id.
    pub async fn all(&self) -> Vec<Item> {
        let items = self.items.read().await;
        let mut all: Vec<Item> = items.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl std::fmt::Debug for ItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStore")
            .field("snapshot_path", &self.snapshot_path)
            .finish_non_exhaustive()
    }
}
