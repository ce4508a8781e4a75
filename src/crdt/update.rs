//! Per-node storage update descriptors delivered to observers.
//!
//! Within one apply pass, updates for the same node are coalesced with a
//! kind-specific merger: keyed kinds merge their key sets, lists
//! concatenate index-tagged entries. Observers therefore see exactly one
//! emission per affected node no matter how many ops touched it.

use std::collections::BTreeMap;

/// What happened to one key of an Object or Map node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    Updated,
    Deleted,
}

/// Merged key-level changes for a keyed node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapLikeUpdate {
    pub changes: BTreeMap<String, KeyChange>,
}

impl MapLikeUpdate {
    pub fn single(key: impl Into<String>, change: KeyChange) -> Self {
        let mut changes = BTreeMap::new();
        changes.insert(key.into(), change);
        MapLikeUpdate { changes }
    }

    fn merge(&mut self, other: MapLikeUpdate) {
        // Later changes win per key.
        self.changes.extend(other.changes);
    }
}

/// What happened at one index of a List node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangeKind {
    Insert,
    Delete,
    Move,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListChange {
    pub kind: ListChangeKind,
    pub index: usize,
    pub id: String,
}

/// A coalesced update for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeUpdate {
    Object(MapLikeUpdate),
    Map(MapLikeUpdate),
    List { changes: Vec<ListChange> },
}

impl NodeUpdate {
    /// Merge a later update for the same node into this one.
    /// Mismatched kinds (node replaced mid-pass) keep the later update.
    pub fn merge(&mut self, other: NodeUpdate) {
        match (self, other) {
            (NodeUpdate::Object(a), NodeUpdate::Object(b)) => a.merge(b),
            (NodeUpdate::Map(a), NodeUpdate::Map(b)) => a.merge(b),
            (NodeUpdate::List { changes: a }, NodeUpdate::List { changes: b }) => {
                a.extend(b);
            }
            (this, other) => *this = other,
        }
    }
}

/// An update descriptor tagged with the node it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageUpdate {
    pub node_id: String,
    pub update: NodeUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maplike_merge_unions_keys() {
        let mut a = MapLikeUpdate::single("x", KeyChange::Updated);
        a.merge(MapLikeUpdate::single("y", KeyChange::Updated));
        assert_eq!(a.changes.len(), 2);
    }

    #[test]
    fn test_maplike_merge_later_wins() {
        let mut a = MapLikeUpdate::single("x", KeyChange::Updated);
        a.merge(MapLikeUpdate::single("x", KeyChange::Deleted));
        assert_eq!(a.changes["x"], KeyChange::Deleted);
    }

    #[test]
    fn test_list_merge_concatenates() {
        let mut a = NodeUpdate::List {
            changes: vec![ListChange {
                kind: ListChangeKind::Insert,
                index: 0,
                id: "1:1".into(),
            }],
        };
        a.merge(NodeUpdate::List {
            changes: vec![ListChange {
                kind: ListChangeKind::Delete,
                index: 0,
                id: "1:1".into(),
            }],
        });
        match a {
            NodeUpdate::List { changes } => assert_eq!(changes.len(), 2),
            other => panic!("unexpected update: {other:?}"),
        }
    }
}
