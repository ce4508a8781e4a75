//! Node kinds and their serialized form.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::protocol::{
    JsonMap, SerializedCrdt, CRDT_LIST, CRDT_MAP, CRDT_OBJECT, CRDT_REGISTER,
};

/// Link from a node to its parent: the parent's id plus the key under
/// which this node is attached (field name, map key, or list position).
#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    pub id: String,
    pub key: String,
}

/// One child of a List node. Entries are kept sorted by position.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub pos: String,
    pub id: String,
}

/// Kind-specific node content. Child links are ids into the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeBody {
    Object {
        data: JsonMap,
        children: BTreeMap<String, String>,
    },
    Map {
        children: BTreeMap<String, String>,
    },
    List {
        children: Vec<ListEntry>,
    },
    Register {
        data: Value,
    },
}

/// A live node in the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub parent: Option<ParentLink>,
    pub body: NodeBody,
}

impl Node {
    pub fn new_object(id: String, parent: Option<ParentLink>, data: JsonMap) -> Self {
        Node {
            id,
            parent,
            body: NodeBody::Object {
                data,
                children: BTreeMap::new(),
            },
        }
    }

    pub fn new_map(id: String, parent: ParentLink) -> Self {
        Node {
            id,
            parent: Some(parent),
            body: NodeBody::Map {
                children: BTreeMap::new(),
            },
        }
    }

    pub fn new_list(id: String, parent: ParentLink) -> Self {
        Node {
            id,
            parent: Some(parent),
            body: NodeBody::List {
                children: Vec::new(),
            },
        }
    }

    pub fn new_register(id: String, parent: ParentLink, data: Value) -> Self {
        Node {
            id,
            parent: Some(parent),
            body: NodeBody::Register { data },
        }
    }

    /// The wire kind tag for this node.
    pub fn kind(&self) -> u64 {
        match &self.body {
            NodeBody::Object { .. } => CRDT_OBJECT,
            NodeBody::Register { .. } => CRDT_REGISTER,
            NodeBody::List { .. } => CRDT_LIST,
            NodeBody::Map { .. } => CRDT_MAP,
        }
    }

    /// Serialize to the form used in INITIAL_STORAGE_STATE items and in
    /// reconnect diffing. Child links are not part of the serialized node;
    /// children carry their own parent links.
    pub fn serialize(&self) -> SerializedCrdt {
        SerializedCrdt {
            kind: self.kind(),
            parent_id: self.parent.as_ref().map(|p| p.id.clone()),
            parent_key: self.parent.as_ref().map(|p| p.key.clone()),
            data: match &self.body {
                NodeBody::Object { data, .. } => Some(Value::Object(data.clone())),
                NodeBody::Register { data } => Some(data.clone()),
                NodeBody::List { .. } | NodeBody::Map { .. } => None,
            },
        }
    }

    /// Child id bound under `key` for keyed kinds.
    pub fn child_at_key(&self, key: &str) -> Option<&str> {
        match &self.body {
            NodeBody::Object { children, .. } | NodeBody::Map { children } => {
                children.get(key).map(String::as_str)
            }
            NodeBody::List { children } => children
                .iter()
                .find(|e| e.pos == key)
                .map(|e| e.id.as_str()),
            NodeBody::Register { .. } => None,
        }
    }

    /// Ids of all direct children, in deterministic order.
    pub fn child_ids(&self) -> Vec<String> {
        match &self.body {
            NodeBody::Object { children, .. } | NodeBody::Map { children } => {
                children.values().cloned().collect()
            }
            NodeBody::List { children } => children.iter().map(|e| e.id.clone()).collect(),
            NodeBody::Register { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn link(id: &str, key: &str) -> ParentLink {
        ParentLink {
            id: id.into(),
            key: key.into(),
        }
    }

    #[test]
    fn test_kinds() {
        let root = Node::new_object("0:0".into(), None, JsonMap::new());
        assert_eq!(root.kind(), CRDT_OBJECT);
        assert_eq!(
            Node::new_list("0:1".into(), link("0:0", "l")).kind(),
            CRDT_LIST
        );
        assert_eq!(
            Node::new_map("0:2".into(), link("0:0", "m")).kind(),
            CRDT_MAP
        );
        assert_eq!(
            Node::new_register("0:3".into(), link("0:2", "k"), json!(1)).kind(),
            CRDT_REGISTER
        );
    }

    #[test]
    fn test_serialize_root_has_no_parent() {
        let mut data = JsonMap::new();
        data.insert("a".into(), json!(0));
        let root = Node::new_object("0:0".into(), None, data);
        let s = root.serialize();
        assert!(s.parent_id.is_none() && s.parent_key.is_none());
        assert_eq!(s.data.unwrap()["a"], json!(0));
    }

    #[test]
    fn test_child_lookup() {
        let mut node = Node::new_map("0:1".into(), link("0:0", "m"));
        if let NodeBody::Map { children } = &mut node.body {
            children.insert("k".into(), "0:2".into());
        }
        assert_eq!(node.child_at_key("k"), Some("0:2"));
        assert_eq!(node.child_at_key("missing"), None);
        assert_eq!(node.child_ids(), vec!["0:2".to_string()]);
    }
}
