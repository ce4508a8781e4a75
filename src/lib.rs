//! # liveroom — client-side runtime for real-time collaborative rooms
//!
//! A single process connects to a coordination server over a persistent
//! bidirectional message channel, maintains a replica of a shared
//! tree-structured document, synchronizes ephemeral per-user presence,
//! and exposes a local, observable, mutable API to the host application.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────┐   ┌────────────┐   ┌───────────────┐   ┌─────────┐
//! │ host │──►│ Room facade│──►│ Batch & History│──►│ Ledger  │
//! └──────┘   └─────┬──────┘   └───────┬───────┘   └────┬────┘
//!                  │                  ▼                 ▼
//!                  │           ┌────────────┐   ┌──────────────┐
//!                  │           │ Node Pool  │   │ Flush (throt)│──► channel
//!                  │           └────────────┘   └──────────────┘
//!                  ▼                  ▲
//!            ┌───────────┐    ┌──────┴────────┐
//!            │ Event Bus │◄───│ Inbound       │◄─────────────── channel
//!            └───────────┘    │ Dispatcher    │
//!                             └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages with integer opcodes
//! - [`token`] / [`auth`] — bearer tokens and the auth endpoint modes
//! - [`crdt`] — the operation-based storage replica (arena of nodes)
//! - [`presence`] — "me" and "others" with the visibility rule
//! - [`history`] — bounded undo/redo stacks and paused history
//! - [`connection`] — connection states, backoff tables, heartbeat
//! - [`room`] — the room core, flush pipeline, dispatcher, and facade
//! - [`channel`] — the WebSocket transport
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative: all state is owned by one logical task
//! and mutated only within host calls, timer callbacks, and channel
//! callbacks. Only [`Room::storage`] suspends.

pub mod auth;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod error;
pub mod events;
pub mod history;
pub mod pos;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod token;

pub use auth::{AuthEndpoint, Authenticator};
pub use channel::{ChannelEvent, ChannelSender};
pub use config::RoomConfig;
pub use connection::{Connection, ConnectionStatus, SessionInfo};
pub use crdt::{NodePool, NodeUpdate, OpSource, StorageUpdate};
pub use error::RoomError;
pub use events::{
    BatchUpdatesHook, CustomEvent, EventBus, HistoryEvent, OthersEvent, SubscriptionId,
};
pub use history::{HistoryOp, MAX_UNDO_DEPTH};
pub use presence::{MyPresence, Others, User};
pub use protocol::{ClientMsg, JsonMap, Op, SerializedCrdt, ServerMsg};
pub use room::{LiveValue, Room, RoomCore, StorageStatus};
pub use token::AuthToken;
