//! # Last-Write-Wins Merge
//!
//! Merges aggregate category documents one `(category, itemType)` node at a
//! time. An incoming node replaces the cached one when its `last_updated` is
//! at least the cached one, or when nothing is cached for that item type.
//! Item types missing from the incoming document are left alone.
//!
//! The live change feed and sibling-tab notifications both go through these
//! functions, so a given pair of snapshots merges to the same state whichever
//! path delivered it.

use crate::types::{CategoryDocument, CategoryMap, ItemTypeNode};

/// Whether `incoming` should replace `cached`.
#[inline]
pub fn incoming_wins(incoming: &ItemTypeNode, cached: Option<&ItemTypeNode>) -> bool {
    match cached {
        None => true,
        Some(cached) => incoming.last_updated >= cached.last_updated,
    }
}

/// Merges `incoming` into `cached` node by node.
///
/// Returns `true` only if some node actually changed value.
pub fn merge_document(cached: &mut CategoryDocument, incoming: &CategoryDocument) -> bool {
    let mut changed = false;
    for (item_type, node) in incoming {
        let current = cached.get(item_type);
        if incoming_wins(node, current) && current != Some(node) {
            cached.insert(item_type.clone(), node.clone());
            changed = true;
        }
    }
    changed
}

/// Merges one category document into the map, creating the category if it
/// is not cached yet.
pub fn merge_category(map: &mut CategoryMap, category: &str, incoming: &CategoryDocument) -> bool {
    match map.get_mut(category) {
        Some(cached) => merge_document(cached, incoming),
        None => {
            map.insert(category.to_string(), incoming.clone());
            true
        }
    }
}

/// Merges a whole category map (e.g. a sibling tab's persisted snapshot).
pub fn merge_category_map(map: &mut CategoryMap, incoming: &CategoryMap) -> bool {
    let mut changed = false;
    for (category, document) in incoming {
        changed |= merge_category(map, category, document);
    }
    changed
}
