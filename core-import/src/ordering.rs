//! Sibling reordering for imported documents.
//!
//! The destination appends imported documents in completion order, which
//! under concurrency differs from the source order. After every child of a
//! parent has been processed the destination tree is compared with the
//! source order and the minimal sequence of moves is derived here.

use bridge_traits::destination::DocumentNode;
use std::collections::HashSet;

/// A document to move to `index` among its destination siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub document_id: String,
    pub index: usize,
}

/// Ids of the direct children of `parent_id` in a collection tree, or of the
/// top-level documents when `parent_id` is `None`.
pub fn sibling_ids(tree: &[DocumentNode], parent_id: Option<&str>) -> Vec<String> {
    let nodes = match parent_id {
        None => tree,
        Some(id) => match tree.iter().find_map(|node| node.find(id)) {
            Some(parent) => parent.children.as_slice(),
            None => &[],
        },
    };
    nodes.iter().map(|node| node.id.clone()).collect()
}

/// Moves that bring the documents listed in `desired` into that relative
/// order within `siblings`.
///
/// Only documents listed in `desired` are moved. Siblings that existed
/// before the import keep their relative order but may shift. Ids in
/// `desired` that are missing from `siblings` are ignored, and repeated ids
/// only count at their first position. Indices refer to the sibling list as
/// it is after the preceding moves have been applied.
pub fn plan_moves(desired: &[String], siblings: &[String]) -> Vec<Move> {
    let mut seen = HashSet::new();
    let desired: Vec<&String> = desired
        .iter()
        .filter(|id| siblings.contains(id) && seen.insert(id.as_str()))
        .collect();
    let mut current: Vec<String> = siblings.to_vec();
    let mut moves = Vec::new();

    for (rank, id) in desired.iter().enumerate() {
        let slots: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(_, sibling)| desired.contains(sibling))
            .map(|(index, _)| index)
            .collect();
        let Some(&slot) = slots.get(rank) else {
            break;
        };
        if current[slot] == **id {
            continue;
        }

        let Some(from) = current.iter().position(|sibling| sibling == *id) else {
            continue;
        };
        let moved = current.remove(from);
        current.insert(slot, moved);
        moves.push(Move {
            document_id: (*id).clone(),
            index: slot,
        });
    }

    moves
}
