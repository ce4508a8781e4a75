//! The operation-based storage replica.
//!
//! Nodes live in an arena ([`pool::NodePool`]) keyed by `"<actor>:<n>"`
//! ids; parent and child links hold ids only, so the tree never forms
//! ownership cycles. The root is the unique node with no parent.
//!
//! Four node kinds exist: Object (keyed map with plain-JSON fields plus
//! child nodes), Map (keyed map whose values are child nodes), List
//! (ordered sequence keyed by fractional positions) and Register (an
//! immutable JSON leaf). Applying an op yields a per-node update
//! descriptor for observers and the compensating ops that undo it.

pub mod node;
pub mod pool;
pub mod update;

pub use node::{ListEntry, Node, NodeBody, ParentLink};
pub use pool::{ApplyResult, NodePool};
pub use update::{KeyChange, ListChange, ListChangeKind, MapLikeUpdate, NodeUpdate, StorageUpdate};

/// Where an op came from, decided at apply time.
///
/// Local fresh mutations apply as `Local`. Replays of our own ops (undo,
/// redo, post-reconnect resend) apply as `UndoRedoReconnect` so nodes can
/// treat them as reliable local reapplies. Ops whose id is found in the
/// unacknowledged ledger are `Ack` echoes and never touch the replica;
/// everything else from the wire is `Remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    Local,
    Remote,
    Ack,
    UndoRedoReconnect,
}
