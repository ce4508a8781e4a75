//! Presence state: "me" (the local user's ephemeral record) and "others"
//! (per-actor presence plus connection metadata).
//!
//! A peer becomes *visible* in the others collection only when both its
//! connection metadata (from USER_JOINED / ROOM_STATE) and its presence
//! data (from UPDATE_PRESENCE) are known. Messages for peers that are not
//! yet visible mutate state silently; no events fire for them.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::JsonMap;

/// The local user's presence record.
///
/// Reads always see a snapshot; writes go through [`MyPresence::patch`],
/// which shallow-merges the keys present in the delta. A `null` value
/// removes the key (the JSON analogue of an absent field).
#[derive(Debug, Clone, Default)]
pub struct MyPresence {
    data: JsonMap,
}

impl MyPresence {
    pub fn new(initial: JsonMap) -> Self {
        Self { data: initial }
    }

    pub fn get(&self) -> &JsonMap {
        &self.data
    }

    pub fn snapshot(&self) -> JsonMap {
        self.data.clone()
    }

    /// Apply a shallow patch and return the reverse delta: for every key
    /// in `patch`, the prior value, or `null` when the key was absent.
    pub fn patch(&mut self, patch: &JsonMap) -> JsonMap {
        let mut reverse = JsonMap::new();
        for (key, value) in patch {
            let prior = self.data.get(key).cloned().unwrap_or(Value::Null);
            reverse.insert(key.clone(), prior);
            if value.is_null() {
                self.data.remove(key);
            } else {
                self.data.insert(key.clone(), value.clone());
            }
        }
        reverse
    }
}

/// Merge `patch` into `base` with the same null-removes semantics.
pub fn merge_patch(base: &mut JsonMap, patch: &JsonMap) {
    for (key, value) in patch {
        if value.is_null() {
            base.remove(key);
        } else {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// A visible peer, as handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub connection_id: i64,
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
    pub is_read_only: bool,
    pub presence: JsonMap,
}

#[derive(Debug, Clone, Default)]
struct OtherEntry {
    user_id: Option<String>,
    user_info: Option<Value>,
    is_read_only: bool,
    has_connection: bool,
    presence: Option<JsonMap>,
}

impl OtherEntry {
    fn is_visible(&self) -> bool {
        self.has_connection && self.presence.is_some()
    }

    fn to_user(&self, actor: i64) -> Option<User> {
        if !self.is_visible() {
            return None;
        }
        Some(User {
            connection_id: actor,
            user_id: self.user_id.clone(),
            user_info: self.user_info.clone(),
            is_read_only: self.is_read_only,
            presence: self.presence.clone().unwrap_or_default(),
        })
    }
}

/// Tracks every peer in the room, keyed by actor id.
///
/// Any mutation invalidates the cached visible-users projection.
#[derive(Debug, Default)]
pub struct Others {
    entries: HashMap<i64, OtherEntry>,
    cache: Option<Vec<User>>,
}

impl Others {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record connection metadata for an actor. Returns the user if this
    /// made them visible (their presence was already known).
    pub fn set_connection(
        &mut self,
        actor: i64,
        user_id: Option<String>,
        user_info: Option<Value>,
        is_read_only: bool,
    ) -> Option<User> {
        self.cache = None;
        let entry = self.entries.entry(actor).or_default();
        let was_visible = entry.is_visible();
        entry.user_id = user_id;
        entry.user_info = user_info;
        entry.is_read_only = is_read_only;
        entry.has_connection = true;
        if !was_visible {
            entry.to_user(actor)
        } else {
            None
        }
    }

    /// Replace an actor's presence wholesale (full keyframe). Returns
    /// `(user, newly_entered)` when the actor is visible afterwards.
    pub fn set_other(&mut self, actor: i64, presence: JsonMap) -> Option<(User, bool)> {
        self.cache = None;
        let entry = self.entries.entry(actor).or_default();
        let was_visible = entry.is_visible();
        entry.presence = Some(presence);
        entry.to_user(actor).map(|u| (u, !was_visible))
    }

    /// Shallow-patch an actor's presence. Returns the updated user only
    /// when they are visible.
    pub fn patch_other(&mut self, actor: i64, patch: &JsonMap) -> Option<User> {
        self.cache = None;
        let entry = self.entries.get_mut(&actor)?;
        let presence = entry.presence.get_or_insert_with(JsonMap::new);
        merge_patch(presence, patch);
        entry.to_user(actor)
    }

    /// Drop an actor entirely. Returns the user iff they were visible.
    pub fn remove_connection(&mut self, actor: i64) -> Option<User> {
        self.cache = None;
        let entry = self.entries.remove(&actor)?;
        entry.to_user(actor)
    }

    /// Drop every actor not present in `keep`.
    pub fn retain_actors(&mut self, keep: impl Fn(i64) -> bool) {
        self.cache = None;
        self.entries.retain(|actor, _| keep(*actor));
    }

    pub fn clear(&mut self) {
        self.cache = None;
        self.entries.clear();
    }

    pub fn contains(&self, actor: i64) -> bool {
        self.entries.contains_key(&actor)
    }

    pub fn is_visible(&self, actor: i64) -> bool {
        self.entries
            .get(&actor)
            .map(OtherEntry::is_visible)
            .unwrap_or(false)
    }

    /// The visible users, sorted by connection id. The projection is
    /// cached until the next mutation.
    pub fn visible(&mut self) -> &[User] {
        if self.cache.is_none() {
            let mut users: Vec<User> = self
                .entries
                .iter()
                .filter_map(|(actor, entry)| entry.to_user(*actor))
                .collect();
            users.sort_by_key(|u| u.connection_id);
            self.cache = Some(users);
        }
        self.cache.as_deref().unwrap_or_default()
    }
}
