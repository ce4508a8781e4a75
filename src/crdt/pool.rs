//! Arena of live nodes plus the op apply dispatch.
//!
//! All tree mutation funnels through [`NodePool::apply_op`], which returns
//! the per-node update descriptor for observers and the compensating ops
//! that undo the mutation. Compensating ops are emitted in an order that
//! re-applies cleanly front to back (creates list parents before children,
//! restores displaced values after re-creating displaced nodes).

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::crdt::node::{ListEntry, Node, NodeBody, ParentLink};
use crate::crdt::update::{
    KeyChange, ListChange, ListChangeKind, MapLikeUpdate, NodeUpdate,
};
use crate::crdt::OpSource;
use crate::error::RoomError;
use crate::pos;
use crate::protocol::{
    JsonMap, Op, SerializedCrdt, CRDT_LIST, CRDT_MAP, CRDT_OBJECT, CRDT_REGISTER,
};

/// Outcome of applying one op to the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResult {
    pub modified: bool,
    /// Node whose observers should be notified, with the merged-ready
    /// update descriptor. Attach/detach report on the parent node.
    pub update: Option<(String, NodeUpdate)>,
    /// Compensating ops, in re-apply order.
    pub reverse: Vec<Op>,
}

impl ApplyResult {
    fn unmodified() -> Self {
        ApplyResult {
            modified: false,
            update: None,
            reverse: Vec::new(),
        }
    }
}

/// Registry of live nodes keyed by id. Owns node lifecycle; the root is
/// the unique node without a parent link.
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: HashMap<String, Node>,
    root: Option<String>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk parent links from `id` to the root, inclusive of `id`.
    /// Used by deep storage subscriptions to filter by ancestor identity.
    pub fn ancestor_chain(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            if out.contains(&current) {
                break; // defensive against malformed links
            }
            cursor = self
                .nodes
                .get(&current)
                .and_then(|n| n.parent.as_ref())
                .map(|p| p.id.clone());
            out.push(current);
        }
        out
    }

    // ── Construction from INITIAL_STORAGE_STATE ─────────────────────

    /// Build a pool from the item list of an initial storage message.
    /// Fails unless exactly one item is a parentless Object (the root).
    pub fn build_from_items(items: &[(String, SerializedCrdt)]) -> Result<NodePool, RoomError> {
        let mut roots = items.iter().filter(|(_, c)| c.parent_id.is_none());
        let root = roots.next();
        let (root_id, root_crdt) = match (root, roots.next()) {
            (Some(r), None) => r,
            (None, _) => {
                return Err(RoomError::InvariantViolation(
                    "initial storage has no root item".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(RoomError::InvariantViolation(
                    "initial storage has more than one root item".into(),
                ))
            }
        };
        if root_crdt.kind != CRDT_OBJECT {
            return Err(RoomError::InvariantViolation(
                "initial storage root is not an object".into(),
            ));
        }

        let mut pool = NodePool::new();
        for (id, crdt) in items {
            let parent = match (&crdt.parent_id, &crdt.parent_key) {
                (Some(pid), Some(key)) => Some(ParentLink {
                    id: pid.clone(),
                    key: key.clone(),
                }),
                (None, _) => None,
                (Some(_), None) => continue, // malformed item
            };
            let node = match crdt.kind {
                CRDT_OBJECT => Node::new_object(
                    id.clone(),
                    parent,
                    crdt.data
                        .as_ref()
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                ),
                CRDT_LIST => match parent {
                    Some(link) => Node::new_list(id.clone(), link),
                    None => continue,
                },
                CRDT_MAP => match parent {
                    Some(link) => Node::new_map(id.clone(), link),
                    None => continue,
                },
                CRDT_REGISTER => match parent {
                    Some(link) => Node::new_register(
                        id.clone(),
                        link,
                        crdt.data.clone().unwrap_or(Value::Null),
                    ),
                    None => continue,
                },
                _ => continue,
            };
            pool.nodes.insert(id.clone(), node);
        }
        pool.root = Some(root_id.clone());

        // Wire child links from the parent side.
        for (id, _) in items {
            let Some(link) = pool
                .nodes
                .get(id)
                .and_then(|n| n.parent.clone())
            else {
                continue;
            };
            pool.attach_existing(&link.id, &link.key, id);
        }

        pool.retain_reachable();
        Ok(pool)
    }

    fn attach_existing(&mut self, parent_id: &str, key: &str, child_id: &str) {
        let Some(parent) = self.nodes.get_mut(parent_id) else {
            return;
        };
        match &mut parent.body {
            NodeBody::Object { children, .. } | NodeBody::Map { children } => {
                children.insert(key.to_string(), child_id.to_string());
            }
            NodeBody::List { children } => {
                let entry = ListEntry {
                    pos: key.to_string(),
                    id: child_id.to_string(),
                };
                let at = children
                    .binary_search_by(|e| (e.pos.as_str(), e.id.as_str()).cmp(&(key, child_id)))
                    .unwrap_or_else(|i| i);
                children.insert(at, entry);
            }
            NodeBody::Register { .. } => {}
        }
    }

    /// Drop nodes not reachable from the root (orphans in malformed input).
    fn retain_reachable(&mut self) {
        let Some(root) = self.root.clone() else {
            self.nodes.clear();
            return;
        };
        let reachable: HashSet<String> = self.subtree_ids(&root).into_iter().collect();
        self.nodes.retain(|id, _| reachable.contains(id));
    }

    // ── Serialization & snapshots ───────────────────────────────────

    /// Serialize every node, sorted by id for determinism.
    pub fn serialize_all(&self) -> Vec<(String, SerializedCrdt)> {
        let mut out: Vec<(String, SerializedCrdt)> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.serialize()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Render the subtree rooted at `id` as plain JSON.
    pub fn to_json(&self, id: &str) -> Option<Value> {
        let node = self.nodes.get(id)?;
        Some(match &node.body {
            NodeBody::Object { data, children } => {
                let mut out = data.clone();
                for (key, child) in children {
                    if let Some(v) = self.to_json(child) {
                        out.insert(key.clone(), v);
                    }
                }
                Value::Object(out)
            }
            NodeBody::Map { children } => {
                let mut out = JsonMap::new();
                for (key, child) in children {
                    if let Some(v) = self.to_json(child) {
                        out.insert(key.clone(), v);
                    }
                }
                Value::Object(out)
            }
            NodeBody::List { children } => Value::Array(
                children
                    .iter()
                    .filter_map(|e| self.to_json(&e.id))
                    .collect(),
            ),
            NodeBody::Register { data } => data.clone(),
        })
    }

    /// Ids of the subtree rooted at `id`, pre-order.
    pub fn subtree_ids(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            let mut kids = node.child_ids();
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Ops that recreate the subtree rooted at `id`, parents first.
    /// Ops carry no op ids; dispatch assigns them when re-applied.
    pub fn creation_ops(&self, id: &str) -> Vec<Op> {
        let mut out = Vec::new();
        self.push_creation_ops(id, &mut out);
        out
    }

    fn push_creation_ops(&self, id: &str, out: &mut Vec<Op>) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let Some(link) = &node.parent else {
            return; // the root is never recreated through ops
        };
        let op = match &node.body {
            NodeBody::Object { data, .. } => Op::CreateObject {
                op_id: None,
                id: id.to_string(),
                parent_id: link.id.clone(),
                parent_key: link.key.clone(),
                data: data.clone(),
            },
            NodeBody::Map { .. } => Op::CreateMap {
                op_id: None,
                id: id.to_string(),
                parent_id: link.id.clone(),
                parent_key: link.key.clone(),
            },
            NodeBody::List { .. } => Op::CreateList {
                op_id: None,
                id: id.to_string(),
                parent_id: link.id.clone(),
                parent_key: link.key.clone(),
            },
            NodeBody::Register { data } => Op::CreateRegister {
                op_id: None,
                id: id.to_string(),
                parent_id: link.id.clone(),
                parent_key: link.key.clone(),
                data: data.clone(),
            },
        };
        out.push(op);
        for child in self.nodes[id].child_ids() {
            self.push_creation_ops(&child, out);
        }
    }

    fn remove_subtree(&mut self, id: &str) {
        for node_id in self.subtree_ids(id) {
            self.nodes.remove(&node_id);
        }
    }

    // ── Apply dispatch ──────────────────────────────────────────────

    /// Apply one op. Source `Ack` never reaches the pool; the dispatcher
    /// handles it as a ledger-only operation.
    pub fn apply_op(&mut self, op: &Op, source: OpSource) -> ApplyResult {
        match op {
            Op::Ack { .. } => ApplyResult::unmodified(),
            Op::UpdateObject { id, data, .. } => self.apply_update_object(id, data),
            Op::DeleteObjectKey { id, key, .. } => self.apply_delete_object_key(id, key),
            Op::DeleteCrdt { id, .. } => self.apply_delete_crdt(id),
            Op::SetParentKey {
                id, parent_key, ..
            } => self.apply_set_parent_key(id, parent_key),
            Op::CreateObject {
                id,
                parent_id,
                parent_key,
                data,
                ..
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                NewNode::Object(data.clone()),
                source,
            ),
            Op::CreateList {
                id,
                parent_id,
                parent_key,
                ..
            } => self.apply_create(id, parent_id, parent_key, NewNode::List, source),
            Op::CreateMap {
                id,
                parent_id,
                parent_key,
                ..
            } => self.apply_create(id, parent_id, parent_key, NewNode::Map, source),
            Op::CreateRegister {
                id,
                parent_id,
                parent_key,
                data,
                ..
            } => self.apply_create(
                id,
                parent_id,
                parent_key,
                NewNode::Register(data.clone()),
                source,
            ),
        }
    }

    fn apply_update_object(&mut self, id: &str, data: &JsonMap) -> ApplyResult {
        // Plan against an immutable borrow, then mutate.
        let (prior, deleted_keys, detached, changed_keys) = {
            let Some(node) = self.nodes.get(id) else {
                return ApplyResult::unmodified();
            };
            let NodeBody::Object {
                data: current,
                children,
            } = &node.body
            else {
                return ApplyResult::unmodified();
            };

            let mut prior = JsonMap::new();
            let mut deleted_keys: Vec<String> = Vec::new();
            let mut detached: Vec<String> = Vec::new();
            let mut changed_keys: Vec<String> = Vec::new();
            for (key, value) in data {
                if let Some(child) = children.get(key) {
                    detached.push(child.clone());
                    changed_keys.push(key.clone());
                } else if let Some(old) = current.get(key) {
                    if old != value {
                        prior.insert(key.clone(), old.clone());
                        changed_keys.push(key.clone());
                    }
                } else {
                    deleted_keys.push(key.clone());
                    changed_keys.push(key.clone());
                }
            }
            (prior, deleted_keys, detached, changed_keys)
        };

        if changed_keys.is_empty() {
            return ApplyResult::unmodified();
        }

        let mut reverse = Vec::new();
        if !prior.is_empty() {
            reverse.push(Op::UpdateObject {
                op_id: None,
                id: id.to_string(),
                data: prior,
            });
        }
        for key in &deleted_keys {
            reverse.push(Op::DeleteObjectKey {
                op_id: None,
                id: id.to_string(),
                key: key.clone(),
            });
        }
        for child in &detached {
            reverse.extend(self.creation_ops(child));
        }
        for child in &detached {
            self.remove_subtree(child);
        }

        if let Some(node) = self.nodes.get_mut(id) {
            if let NodeBody::Object {
                data: current,
                children,
            } = &mut node.body
            {
                for (key, value) in data {
                    children.remove(key);
                    current.insert(key.clone(), value.clone());
                }
            }
        }

        let mut changes = BTreeMap::new();
        for key in changed_keys {
            changes.insert(key, KeyChange::Updated);
        }
        ApplyResult {
            modified: true,
            update: Some((id.to_string(), NodeUpdate::Object(MapLikeUpdate { changes }))),
            reverse,
        }
    }

    fn apply_delete_object_key(&mut self, id: &str, key: &str) -> ApplyResult {
        enum Plan {
            Child(String),
            Data(Value),
        }
        let plan = {
            let Some(node) = self.nodes.get(id) else {
                return ApplyResult::unmodified();
            };
            let NodeBody::Object { data, children } = &node.body else {
                return ApplyResult::unmodified();
            };
            if let Some(child) = children.get(key) {
                Plan::Child(child.clone())
            } else if let Some(old) = data.get(key) {
                Plan::Data(old.clone())
            } else {
                return ApplyResult::unmodified();
            }
        };

        let reverse = match &plan {
            Plan::Child(child) => {
                let ops = self.creation_ops(child);
                self.remove_subtree(child);
                ops
            }
            Plan::Data(old) => {
                let mut data = JsonMap::new();
                data.insert(key.to_string(), old.clone());
                vec![Op::UpdateObject {
                    op_id: None,
                    id: id.to_string(),
                    data,
                }]
            }
        };

        if let Some(node) = self.nodes.get_mut(id) {
            if let NodeBody::Object { data, children } = &mut node.body {
                children.remove(key);
                data.remove(key);
            }
        }

        ApplyResult {
            modified: true,
            update: Some((
                id.to_string(),
                NodeUpdate::Object(MapLikeUpdate::single(key, KeyChange::Deleted)),
            )),
            reverse,
        }
    }

    fn apply_delete_crdt(&mut self, id: &str) -> ApplyResult {
        let Some(link) = self.nodes.get(id).and_then(|n| n.parent.clone()) else {
            // Missing node or the root: nothing to do.
            return ApplyResult::unmodified();
        };
        let reverse = self.creation_ops(id);

        let update = {
            let Some(parent) = self.nodes.get_mut(&link.id) else {
                self.remove_subtree(id);
                return ApplyResult {
                    modified: true,
                    update: None,
                    reverse,
                };
            };
            match &mut parent.body {
                NodeBody::Object { children, .. } => {
                    children.remove(&link.key);
                    NodeUpdate::Object(MapLikeUpdate::single(link.key.clone(), KeyChange::Deleted))
                }
                NodeBody::Map { children } => {
                    children.remove(&link.key);
                    NodeUpdate::Map(MapLikeUpdate::single(link.key.clone(), KeyChange::Deleted))
                }
                NodeBody::List { children } => {
                    let index = children
                        .iter()
                        .position(|e| e.id == id)
                        .unwrap_or(children.len());
                    if index < children.len() {
                        children.remove(index);
                    }
                    NodeUpdate::List {
                        changes: vec![ListChange {
                            kind: ListChangeKind::Delete,
                            index,
                            id: id.to_string(),
                        }],
                    }
                }
                NodeBody::Register { .. } => {
                    self.remove_subtree(id);
                    return ApplyResult {
                        modified: true,
                        update: None,
                        reverse,
                    };
                }
            }
        };
        self.remove_subtree(id);

        ApplyResult {
            modified: true,
            update: Some((link.id, update)),
            reverse,
        }
    }

    fn apply_set_parent_key(&mut self, id: &str, new_key: &str) -> ApplyResult {
        let Some(link) = self.nodes.get(id).and_then(|n| n.parent.clone()) else {
            return ApplyResult::unmodified();
        };
        let is_list_parent = matches!(
            self.nodes.get(&link.id).map(|p| &p.body),
            Some(NodeBody::List { .. })
        );
        if !is_list_parent || link.key == new_key {
            return ApplyResult::unmodified();
        }

        let effective = {
            let Some(parent) = self.nodes.get_mut(&link.id) else {
                return ApplyResult::unmodified();
            };
            let NodeBody::List { children } = &mut parent.body else {
                return ApplyResult::unmodified();
            };
            if let Some(old_index) = children.iter().position(|e| e.id == id) {
                children.remove(old_index);
            }
            let effective = resolve_list_pos(children, new_key);
            let at = children
                .binary_search_by(|e| {
                    (e.pos.as_str(), e.id.as_str()).cmp(&(effective.as_str(), id))
                })
                .unwrap_or_else(|i| i);
            children.insert(
                at,
                ListEntry {
                    pos: effective.clone(),
                    id: id.to_string(),
                },
            );
            effective
        };

        let new_index = {
            let Some(parent) = self.nodes.get(&link.id) else {
                return ApplyResult::unmodified();
            };
            match &parent.body {
                NodeBody::List { children } => {
                    children.iter().position(|e| e.id == id).unwrap_or(0)
                }
                _ => 0,
            }
        };

        if let Some(node) = self.nodes.get_mut(id) {
            if let Some(parent) = &mut node.parent {
                parent.key = effective;
            }
        }

        ApplyResult {
            modified: true,
            update: Some((
                link.id,
                NodeUpdate::List {
                    changes: vec![ListChange {
                        kind: ListChangeKind::Move,
                        index: new_index,
                        id: id.to_string(),
                    }],
                },
            )),
            reverse: vec![Op::SetParentKey {
                op_id: None,
                id: id.to_string(),
                parent_key: link.key,
            }],
        }
    }

    fn apply_create(
        &mut self,
        id: &str,
        parent_id: &str,
        parent_key: &str,
        new_node: NewNode,
        _source: OpSource,
    ) -> ApplyResult {
        // A node that already exists means a duplicate delivery or a
        // reliable local reapply; either way the create is a no-op.
        if self.nodes.contains_key(id) {
            return ApplyResult::unmodified();
        }
        let Some(parent) = self.nodes.get(parent_id) else {
            return ApplyResult::unmodified();
        };

        match &parent.body {
            NodeBody::Object { data, children } => {
                let displaced_child = children.get(parent_key).cloned();
                let displaced_data = data.get(parent_key).cloned();
                self.attach_keyed(
                    id,
                    parent_id,
                    parent_key,
                    new_node,
                    displaced_child,
                    displaced_data,
                    true,
                )
            }
            NodeBody::Map { children } => {
                let displaced_child = children.get(parent_key).cloned();
                self.attach_keyed(
                    id,
                    parent_id,
                    parent_key,
                    new_node,
                    displaced_child,
                    None,
                    false,
                )
            }
            NodeBody::List { children } => {
                let effective = resolve_list_pos(children, parent_key);
                let index = children.iter().filter(|e| e.pos < effective).count();
                let node = new_node.build(
                    id,
                    ParentLink {
                        id: parent_id.to_string(),
                        key: effective.clone(),
                    },
                );
                self.nodes.insert(id.to_string(), node);
                if let Some(parent) = self.nodes.get_mut(parent_id) {
                    if let NodeBody::List { children } = &mut parent.body {
                        let at = children
                            .binary_search_by(|e| {
                                (e.pos.as_str(), e.id.as_str()).cmp(&(effective.as_str(), id))
                            })
                            .unwrap_or_else(|i| i);
                        children.insert(
                            at,
                            ListEntry {
                                pos: effective,
                                id: id.to_string(),
                            },
                        );
                    }
                }
                ApplyResult {
                    modified: true,
                    update: Some((
                        parent_id.to_string(),
                        NodeUpdate::List {
                            changes: vec![ListChange {
                                kind: ListChangeKind::Insert,
                                index,
                                id: id.to_string(),
                            }],
                        },
                    )),
                    reverse: vec![Op::DeleteCrdt {
                        op_id: None,
                        id: id.to_string(),
                    }],
                }
            }
            NodeBody::Register { .. } => ApplyResult::unmodified(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_keyed(
        &mut self,
        id: &str,
        parent_id: &str,
        key: &str,
        new_node: NewNode,
        displaced_child: Option<String>,
        displaced_data: Option<Value>,
        parent_is_object: bool,
    ) -> ApplyResult {
        let mut reverse = vec![Op::DeleteCrdt {
            op_id: None,
            id: id.to_string(),
        }];
        if let Some(child) = &displaced_child {
            reverse.extend(self.creation_ops(child));
            self.remove_subtree(child);
        }
        if let Some(old) = displaced_data {
            let mut data = JsonMap::new();
            data.insert(key.to_string(), old);
            reverse.push(Op::UpdateObject {
                op_id: None,
                id: parent_id.to_string(),
                data,
            });
        }

        let node = new_node.build(
            id,
            ParentLink {
                id: parent_id.to_string(),
                key: key.to_string(),
            },
        );
        self.nodes.insert(id.to_string(), node);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            match &mut parent.body {
                NodeBody::Object { data, children } => {
                    data.remove(key);
                    children.insert(key.to_string(), id.to_string());
                }
                NodeBody::Map { children } => {
                    children.insert(key.to_string(), id.to_string());
                }
                _ => {}
            }
        }

        let update = MapLikeUpdate::single(key, KeyChange::Updated);
        ApplyResult {
            modified: true,
            update: Some((
                parent_id.to_string(),
                if parent_is_object {
                    NodeUpdate::Object(update)
                } else {
                    NodeUpdate::Map(update)
                },
            )),
            reverse,
        }
    }

    // ── Reconnect diff ──────────────────────────────────────────────

    /// Compute ops that transform this pool into the incoming item set:
    /// creates for incoming-only nodes, deletes for current-only nodes,
    /// updates for overlapping nodes whose content changed. Applied with
    /// `is_local = false`.
    ///
    /// Precondition: the incoming items contain the current root id
    /// (the caller rebuilds from scratch otherwise).
    pub fn diff_against(&self, items: &[(String, SerializedCrdt)]) -> Vec<Op> {
        let incoming: HashMap<&str, &SerializedCrdt> =
            items.iter().map(|(id, c)| (id.as_str(), c)).collect();
        let mut ops = Vec::new();

        let mut current_ids: Vec<&String> = self.nodes.keys().collect();
        current_ids.sort();

        // Deletes: topmost current-only nodes.
        for id in &current_ids {
            if incoming.contains_key(id.as_str()) {
                continue;
            }
            let Some(link) = &self.nodes[*id].parent else {
                continue;
            };
            let parent_also_gone = self.nodes.contains_key(&link.id)
                && !incoming.contains_key(link.id.as_str());
            if !parent_also_gone {
                ops.push(Op::DeleteCrdt {
                    op_id: None,
                    id: (*id).clone(),
                });
            }
        }

        // Structural replaces: kind change, reparent, or register content
        // change. Their whole current subtree is replaced from incoming.
        let mut replaced: HashSet<String> = HashSet::new();
        for id in &current_ids {
            let Some(inc) = incoming.get(id.as_str()) else {
                continue;
            };
            let cur = self.nodes[*id].serialize();
            let same_shape = cur.kind == inc.kind && cur.parent_id == inc.parent_id;
            let register_changed = inc.kind == CRDT_REGISTER && cur.data != inc.data;
            if !same_shape || register_changed {
                for sub in self.subtree_ids(id) {
                    replaced.insert(sub);
                }
            }
        }
        for id in &current_ids {
            if !replaced.contains(*id) {
                continue;
            }
            let covered = self.nodes[*id]
                .parent
                .as_ref()
                .is_some_and(|link| replaced.contains(&link.id));
            if !covered {
                ops.push(Op::DeleteCrdt {
                    op_id: None,
                    id: (*id).clone(),
                });
            }
        }

        // Content updates for overlapping same-shape nodes.
        for id in &current_ids {
            if replaced.contains(*id) {
                continue;
            }
            let Some(inc) = incoming.get(id.as_str()) else {
                continue;
            };
            let cur = self.nodes[*id].serialize();
            if cur == **inc {
                continue;
            }
            if inc.kind == CRDT_OBJECT {
                let empty = JsonMap::new();
                let cur_data = cur
                    .data
                    .as_ref()
                    .and_then(Value::as_object)
                    .unwrap_or(&empty);
                let new_data = inc
                    .data
                    .as_ref()
                    .and_then(Value::as_object)
                    .unwrap_or(&empty);
                let mut changed = JsonMap::new();
                for (k, v) in new_data {
                    if cur_data.get(k) != Some(v) {
                        changed.insert(k.clone(), v.clone());
                    }
                }
                if !changed.is_empty() {
                    ops.push(Op::UpdateObject {
                        op_id: None,
                        id: (*id).clone(),
                        data: changed,
                    });
                }
                for k in cur_data.keys() {
                    if !new_data.contains_key(k) {
                        ops.push(Op::DeleteObjectKey {
                            op_id: None,
                            id: (*id).clone(),
                            key: k.clone(),
                        });
                    }
                }
            }
            if cur.parent_key != inc.parent_key {
                if let Some(key) = &inc.parent_key {
                    ops.push(Op::SetParentKey {
                        op_id: None,
                        id: (*id).clone(),
                        parent_key: key.clone(),
                    });
                }
            }
        }

        // Creates: incoming-only nodes and replaced overlaps, parents first.
        let to_create: HashSet<&str> = items
            .iter()
            .filter(|(id, _)| !self.nodes.contains_key(id) || replaced.contains(id))
            .map(|(id, _)| id.as_str())
            .collect();
        let mut children_of: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, crdt) in items {
            if let Some(pid) = &crdt.parent_id {
                children_of.entry(pid.as_str()).or_default().push(id);
            }
        }
        let mut attach_points: Vec<&str> = to_create
            .iter()
            .copied()
            .filter(|id| {
                incoming[id]
                    .parent_id
                    .as_ref()
                    .map(|p| !to_create.contains(p.as_str()))
                    .unwrap_or(false)
            })
            .collect();
        attach_points.sort();
        for start in attach_points {
            let mut stack = vec![start];
            while let Some(id) = stack.pop() {
                if let Some(op) = create_op_from(id, incoming[id]) {
                    ops.push(op);
                }
                if let Some(kids) = children_of.get(id) {
                    for kid in kids.iter().rev() {
                        if to_create.contains(kid) {
                            stack.push(kid);
                        }
                    }
                }
            }
        }

        ops
    }
}

/// Template for a node being created by an op.
enum NewNode {
    Object(JsonMap),
    Map,
    List,
    Register(Value),
}

impl NewNode {
    fn build(self, id: &str, link: ParentLink) -> Node {
        match self {
            NewNode::Object(data) => Node::new_object(id.to_string(), Some(link), data),
            NewNode::Map => Node::new_map(id.to_string(), link),
            NewNode::List => Node::new_list(id.to_string(), link),
            NewNode::Register(data) => Node::new_register(id.to_string(), link, data),
        }
    }
}

/// Pick the actual position for a list attach: on a collision with an
/// existing sibling, shift to a fresh position between the occupant and
/// its successor so concurrent inserts interleave deterministically.
fn resolve_list_pos(children: &[ListEntry], wanted: &str) -> String {
    if !children.iter().any(|e| e.pos == wanted) {
        return wanted.to_string();
    }
    let next = children
        .iter()
        .map(|e| e.pos.as_str())
        .filter(|p| *p > wanted)
        .min();
    pos::between(Some(wanted), next)
}

fn create_op_from(id: &str, crdt: &SerializedCrdt) -> Option<Op> {
    let parent_id = crdt.parent_id.clone()?;
    let parent_key = crdt.parent_key.clone()?;
    Some(match crdt.kind {
        CRDT_OBJECT => Op::CreateObject {
            op_id: None,
            id: id.to_string(),
            parent_id,
            parent_key,
            data: crdt
                .data
                .as_ref()
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        },
        CRDT_LIST => Op::CreateList {
            op_id: None,
            id: id.to_string(),
            parent_id,
            parent_key,
        },
        CRDT_MAP => Op::CreateMap {
            op_id: None,
            id: id.to_string(),
            parent_id,
            parent_key,
        },
        CRDT_REGISTER => Op::CreateRegister {
            op_id: None,
            id: id.to_string(),
            parent_id,
            parent_key,
            data: crdt.data.clone().unwrap_or(Value::Null),
        },
        _ => return None,
    })
}
