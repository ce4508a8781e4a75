//! Observable event bus: named channels with typed payloads.
//!
//! Hosts subscribe per channel and get back a [`SubscriptionId`] for
//! unsubscribing. Storage subscriptions are node-scoped with a
//! shallow/deep flag; the deep variant matches updates for the node or
//! any of its descendants (the dispatcher resolves ancestry against the
//! pool before emitting).
//!
//! Grouped emissions run inside the host-supplied `batch_updates`
//! wrapper so downstream UI frameworks can coalesce renders. The default
//! wrapper is a pass-through.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::connection::ConnectionStatus;
use crate::crdt::StorageUpdate;
use crate::error::RoomError;
use crate::presence::User;
use crate::protocol::JsonMap;
use crate::room::StorageStatus;

/// Handle returned by every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Host hook wrapping grouped notification dispatch.
pub type BatchUpdatesHook = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// A pass-through `batch_updates` wrapper.
pub fn passthrough_hook() -> BatchUpdatesHook {
    Arc::new(|f| f())
}

/// Events on the `others` channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OthersEvent {
    Enter(User),
    Leave(User),
    Update { user: User, patch: JsonMap },
    Reset,
}

/// A custom room event broadcast by some peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomEvent {
    pub connection_id: i64,
    pub event: Value,
}

/// History affordances, emitted when either flag flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEvent {
    pub can_undo: bool,
    pub can_redo: bool,
}

type Callback<T> = Box<dyn Fn(&T) + Send>;

enum Subscriber {
    Connection(Callback<ConnectionStatus>),
    StorageStatus(Callback<StorageStatus>),
    MyPresence(Callback<JsonMap>),
    Others(Callback<OthersEvent>),
    Custom(Callback<CustomEvent>),
    Error(Callback<RoomError>),
    History(Callback<HistoryEvent>),
    StorageDidLoad(Callback<()>),
    Storage {
        node_id: String,
        deep: bool,
        callback: Callback<Vec<StorageUpdate>>,
    },
}

/// The subscriber registry.
#[derive(Default)]
pub struct EventBus {
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, subscriber: Subscriber) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, subscriber);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id.0).is_some()
    }

    /// Remove every subscriber. Part of `disconnect()` teardown.
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    // ── Subscribe surface ───────────────────────────────────────────

    pub fn on_connection(
        &mut self,
        f: impl Fn(&ConnectionStatus) + Send + 'static,
    ) -> SubscriptionId {
        self.add(Subscriber::Connection(Box::new(f)))
    }

    pub fn on_storage_status(
        &mut self,
        f: impl Fn(&StorageStatus) + Send + 'static,
    ) -> SubscriptionId {
        self.add(Subscriber::StorageStatus(Box::new(f)))
    }

    pub fn on_my_presence(&mut self, f: impl Fn(&JsonMap) + Send + 'static) -> SubscriptionId {
        self.add(Subscriber::MyPresence(Box::new(f)))
    }

    pub fn on_others(&mut self, f: impl Fn(&OthersEvent) + Send + 'static) -> SubscriptionId {
        self.add(Subscriber::Others(Box::new(f)))
    }

    pub fn on_event(&mut self, f: impl Fn(&CustomEvent) + Send + 'static) -> SubscriptionId {
        self.add(Subscriber::Custom(Box::new(f)))
    }

    pub fn on_error(&mut self, f: impl Fn(&RoomError) + Send + 'static) -> SubscriptionId {
        self.add(Subscriber::Error(Box::new(f)))
    }

    pub fn on_history(&mut self, f: impl Fn(&HistoryEvent) + Send + 'static) -> SubscriptionId {
        self.add(Subscriber::History(Box::new(f)))
    }

    pub fn on_storage_did_load(&mut self, f: impl Fn(&()) + Send + 'static) -> SubscriptionId {
        self.add(Subscriber::StorageDidLoad(Box::new(f)))
    }

    /// Node-scoped storage subscription. Shallow matches updates for the
    /// node itself; deep also matches its descendants.
    pub fn on_storage(
        &mut self,
        node_id: impl Into<String>,
        deep: bool,
        f: impl Fn(&Vec<StorageUpdate>) + Send + 'static,
    ) -> SubscriptionId {
        self.add(Subscriber::Storage {
            node_id: node_id.into(),
            deep,
            callback: Box::new(f),
        })
    }

    // ── Emit surface ────────────────────────────────────────────────

    pub fn emit_connection(&self, status: ConnectionStatus) {
        for sub in self.subscribers.values() {
            if let Subscriber::Connection(f) = sub {
                f(&status);
            }
        }
    }

    pub fn emit_storage_status(&self, status: StorageStatus) {
        for sub in self.subscribers.values() {
            if let Subscriber::StorageStatus(f) = sub {
                f(&status);
            }
        }
    }

    pub fn emit_error(&self, error: &RoomError) {
        for sub in self.subscribers.values() {
            if let Subscriber::Error(f) = sub {
                f(error);
            }
        }
    }

    pub fn emit_history(&self, event: HistoryEvent) {
        for sub in self.subscribers.values() {
            if let Subscriber::History(f) = sub {
                f(&event);
            }
        }
    }

    pub fn emit_storage_did_load(&self) {
        for sub in self.subscribers.values() {
            if let Subscriber::StorageDidLoad(f) = sub {
                f(&());
            }
        }
    }

    /// Emit one grouped round of notifications inside the wrapper hook.
    ///
    /// `storage` carries, per storage subscription id, the updates that
    /// matched it (the dispatcher resolves shallow/deep filtering since
    /// ancestry lives in the pool).
    pub fn emit_grouped(
        &self,
        hook: &BatchUpdatesHook,
        storage: &[(SubscriptionId, Vec<StorageUpdate>)],
        my_presence: Option<&JsonMap>,
        others: &[OthersEvent],
        custom: &[CustomEvent],
    ) {
        if storage.is_empty() && my_presence.is_none() && others.is_empty() && custom.is_empty() {
            return;
        }
        hook(&mut || {
            for (sub_id, updates) in storage {
                if let Some(Subscriber::Storage { callback, .. }) =
                    self.subscribers.get(&sub_id.0)
                {
                    callback(updates);
                }
            }
            if let Some(me) = my_presence {
                for sub in self.subscribers.values() {
                    if let Subscriber::MyPresence(f) = sub {
                        f(me);
                    }
                }
            }
            for event in others {
                for sub in self.subscribers.values() {
                    if let Subscriber::Others(f) = sub {
                        f(event);
                    }
                }
            }
            for event in custom {
                for sub in self.subscribers.values() {
                    if let Subscriber::Custom(f) = sub {
                        f(event);
                    }
                }
            }
        });
    }

    /// Resolve which storage subscriptions match a set of updates.
    /// `ancestors(id)` returns the chain from a node up to the root.
    pub fn match_storage_subs<F>(
        &self,
        updates: &HashMap<String, StorageUpdate>,
        ancestors: F,
    ) -> Vec<(SubscriptionId, Vec<StorageUpdate>)>
    where
        F: Fn(&str) -> Vec<String>,
    {
        if updates.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut ids: Vec<&u64> = self.subscribers.keys().collect();
        ids.sort();
        for id in ids {
            let Some(Subscriber::Storage { node_id, deep, .. }) = self.subscribers.get(id) else {
                continue;
            };
            let mut matched: Vec<StorageUpdate> = Vec::new();
            for update in updates.values() {
                let hit = if *deep {
                    ancestors(&update.node_id).iter().any(|a| a == node_id)
                } else {
                    update.node_id == *node_id
                };
                if hit {
                    matched.push(update.clone());
                }
            }
            if !matched.is_empty() {
                matched.sort_by(|a, b| a.node_id.cmp(&b.node_id));
                out.push((SubscriptionId(*id), matched));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::update::{KeyChange, MapLikeUpdate, NodeUpdate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn object_update(node_id: &str, key: &str) -> StorageUpdate {
        StorageUpdate {
            node_id: node_id.into(),
            update: NodeUpdate::Object(MapLikeUpdate::single(key, KeyChange::Updated)),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = bus.on_connection(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_connection(ConnectionStatus::Open);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit_connection(ConnectionStatus::Closed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_removes_everyone() {
        let mut bus = EventBus::new();
        bus.on_error(|_| {});
        bus.on_history(|_| {});
        assert_eq!(bus.subscriber_count(), 2);
        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_shallow_storage_match() {
        let mut bus = EventBus::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.on_storage("0:1", false, move |updates| {
            let mut lock = s.lock().unwrap();
            for u in updates {
                lock.push(u.node_id.clone());
            }
        });

        let mut updates = HashMap::new();
        updates.insert("0:1".to_string(), object_update("0:1", "a"));
        updates.insert("0:2".to_string(), object_update("0:2", "b"));

        let matched = bus.match_storage_subs(&updates, |id| vec![id.to_string()]);
        assert_eq!(matched.len(), 1);
        bus.emit_grouped(&passthrough_hook(), &matched, None, &[], &[]);
        assert_eq!(&*seen.lock().unwrap(), &["0:1".to_string()]);
    }

    #[test]
    fn test_deep_storage_match_uses_ancestors() {
        let mut bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.on_storage("0:0", true, move |updates| {
            h.fetch_add(updates.len(), Ordering::SeqCst);
        });

        let mut updates = HashMap::new();
        updates.insert("0:5".to_string(), object_update("0:5", "a"));

        // "0:5" is a descendant of the root "0:0".
        let matched = bus.match_storage_subs(&updates, |id| {
            vec![id.to_string(), "0:0".to_string()]
        });
        bus.emit_grouped(&passthrough_hook(), &matched, None, &[], &[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_grouped_emission_runs_inside_hook() {
        let mut bus = EventBus::new();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        bus.on_my_presence(move |_| o.lock().unwrap().push("presence"));
        let o = order.clone();
        bus.on_others(move |_| o.lock().unwrap().push("others"));

        let o = order.clone();
        let hook: BatchUpdatesHook = Arc::new(move |f| {
            o.lock().unwrap().push("hook-start");
            f();
            o.lock().unwrap().push("hook-end");
        });

        bus.emit_grouped(
            &hook,
            &[],
            Some(&JsonMap::new()),
            &[OthersEvent::Reset],
            &[],
        );
        assert_eq!(
            &*order.lock().unwrap(),
            &["hook-start", "presence", "others", "hook-end"]
        );
    }

    #[test]
    fn test_grouped_emission_skips_hook_when_empty() {
        let bus = EventBus::new();
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let hook: BatchUpdatesHook = Arc::new(move |f| {
            c.fetch_add(1, Ordering::SeqCst);
            f();
        });
        bus.emit_grouped(&hook, &[], None, &[], &[]);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
