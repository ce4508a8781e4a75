//! The room core: everything between the host application and the wire.
//!
//! ```text
//! host ──► Room (facade) ──► RoomCore ──► ledger ──► flush ──► channel
//!                               ▲                                 │
//!                               └── inbound dispatcher ◄──────────┘
//! ```
//!
//! [`RoomCore`] is the single-owner state machine: the connection state,
//! the node pool, presence, the batch & history engine, the
//! unacknowledged-op ledger, and the throttled outbound buffer all live
//! here. Every mutation happens inside a host call, a timer callback, or
//! a channel callback, so the core is synchronous and fully drivable
//! from tests with fabricated instants and frames.
//!
//! [`Room`] wraps the core in a mutex, spawns the driver task
//! (authenticate, open the channel, pump events, fire deadlines), and
//! exposes the host-facing surface. Host calls are synchronous; only
//! [`Room::storage`] suspends, waiting for the initial storage state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::auth::Authenticator;
use crate::channel::{open_channel, ChannelEvent, ChannelSender};
use crate::config::RoomConfig;
use crate::connection::{
    retry_delay, Connection, ConnectionStatus, SessionInfo, HEARTBEAT_INTERVAL, PONG_TIMEOUT,
};
use crate::crdt::node::NodeBody;
use crate::crdt::{NodePool, NodeUpdate, OpSource, StorageUpdate};
use crate::error::RoomError;
use crate::events::{CustomEvent, EventBus, HistoryEvent, OthersEvent, SubscriptionId};
use crate::history::{History, HistoryOp};
use crate::pos;
use crate::presence::{MyPresence, Others, User};
use crate::protocol::{
    encode_frame, parse_frame, ClientMsg, JsonMap, Op, SerializedCrdt, ServerMsg,
    CLOSE_WITHOUT_RETRY, KEYFRAME_TARGET, REJECT_CODE_MAX, REJECT_CODE_MIN,
};
use crate::token::{now_secs, scopes_are_read_only, AuthToken};

/// Derived storage lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStatus {
    NotLoaded,
    Loading,
    Synchronizing,
    Synchronized,
}

/// A value being written into storage: plain JSON or a new live subtree.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveValue {
    Json(Value),
    Object(Vec<(String, LiveValue)>),
    List(Vec<LiveValue>),
    Map(Vec<(String, LiveValue)>),
}

impl From<Value> for LiveValue {
    fn from(v: Value) -> Self {
        LiveValue::Json(v)
    }
}

/// Outbound presence waiting for the next flush.
#[derive(Debug, Clone, PartialEq)]
enum PresenceBuffer {
    /// Incremental patch; `null` values travel as explicit removals.
    Patch(JsonMap),
    /// Full keyframe, broadcast with `targetActor: -1`.
    Full(JsonMap),
}

/// Everything queued for the next outbound frame.
#[derive(Debug, Default)]
struct OutBuffer {
    me: Option<PresenceBuffer>,
    messages: Vec<ClientMsg>,
    storage_ops: Vec<Op>,
}

/// Ops sent but not yet confirmed, in production order.
#[derive(Debug, Default)]
pub struct OpLedger {
    entries: Vec<(String, Op)>,
}

impl OpLedger {
    fn insert(&mut self, op_id: String, op: Op) -> bool {
        if self.contains(&op_id) {
            return false;
        }
        self.entries.push((op_id, op));
        true
    }

    fn remove(&mut self, op_id: &str) -> Option<Op> {
        let at = self.entries.iter().position(|(id, _)| id == op_id)?;
        Some(self.entries.remove(at).1)
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == op_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Every unacknowledged op, oldest first.
    pub fn snapshot(&self) -> Vec<Op> {
        self.entries.iter().map(|(_, op)| op.clone()).collect()
    }
}

/// Accumulator for one active batch.
#[derive(Debug, Default)]
struct BatchAcc {
    ops: Vec<Op>,
    reverse: Vec<HistoryOp>,
    updates: HashMap<String, StorageUpdate>,
    created: HashSet<String>,
    presence_changed: bool,
}

/// Result of one `apply_ops` pass.
#[derive(Debug, Default)]
struct Applied {
    ops: Vec<Op>,
    reverse: Vec<HistoryOp>,
    updates: HashMap<String, StorageUpdate>,
    presence_changed: bool,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverWork {
    Authenticate,
    OpenChannel { url: String, generation: u64 },
    Idle,
}

/// The synchronous room state machine.
pub struct RoomCore {
    config: RoomConfig,

    connection: Connection,
    token: Option<AuthToken>,
    /// Cached from the token so the restriction survives connection
    /// loss; `session()` is None while unavailable.
    session_read_only: bool,
    retry_count: u32,
    slow_backoff: bool,
    last_connection_id: Option<i64>,
    auth_inflight: bool,
    open_inflight: bool,

    transport: Option<ChannelSender>,
    channel_generation: u64,

    pool: NodePool,
    node_seq: u64,
    op_seq: u64,

    me: MyPresence,
    others: Others,
    history: History,
    batch: Option<BatchAcc>,
    ledger: OpLedger,
    buffer: OutBuffer,

    last_flush: Option<Instant>,
    flush_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
    pong_deadline: Option<Instant>,
    retry_at: Option<Instant>,

    storage_requested: bool,
    storage_loaded_once: bool,
    last_storage_status: StorageStatus,
    storage_waiters: Vec<oneshot::Sender<()>>,
    last_history_event: Option<HistoryEvent>,

    events: EventBus,
}

impl RoomCore {
    pub fn new(config: RoomConfig) -> Self {
        let me = MyPresence::new(config.initial_presence.clone());
        RoomCore {
            config,
            connection: Connection::Closed,
            token: None,
            session_read_only: false,
            retry_count: 0,
            slow_backoff: false,
            last_connection_id: None,
            auth_inflight: false,
            open_inflight: false,
            transport: None,
            channel_generation: 0,
            pool: NodePool::new(),
            node_seq: 0,
            op_seq: 0,
            me,
            others: Others::new(),
            history: History::new(),
            batch: None,
            ledger: OpLedger::default(),
            buffer: OutBuffer::default(),
            last_flush: None,
            flush_at: None,
            next_heartbeat: None,
            pong_deadline: None,
            retry_at: None,
            storage_requested: false,
            storage_loaded_once: false,
            last_storage_status: StorageStatus::NotLoaded,
            storage_waiters: Vec::new(),
            last_history_event: None,
            events: EventBus::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.connection.session()
    }

    pub fn presence(&self) -> JsonMap {
        self.me.snapshot()
    }

    pub fn others_snapshot(&mut self) -> Vec<User> {
        self.others.visible().to_vec()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn undo_stack_depth(&self) -> usize {
        self.history.undo_depth()
    }

    pub fn ledger(&self) -> &OpLedger {
        &self.ledger
    }

    pub fn root_id(&self) -> Option<String> {
        self.pool.root_id().map(String::from)
    }

    pub fn node_json(&self, id: &str) -> Option<Value> {
        self.pool.to_json(id)
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Current channel generation, for routing events from a test or
    /// driver-held socket.
    pub fn channel_generation(&self) -> u64 {
        self.channel_generation
    }

    pub fn storage_status(&self) -> StorageStatus {
        if self.pool.has_root() {
            if self.ledger.is_empty() {
                StorageStatus::Synchronized
            } else {
                StorageStatus::Synchronizing
            }
        } else if self.storage_requested {
            StorageStatus::Loading
        } else {
            StorageStatus::NotLoaded
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Begin connecting. Valid from closed, unavailable and failed.
    pub fn connect(&mut self, now: Instant) {
        match self.connection {
            Connection::Closed | Connection::Unavailable | Connection::Failed => {}
            _ => return,
        }
        self.retry_at = None;
        self.begin_connect(now);
    }

    fn begin_connect(&mut self, _now: Instant) {
        let cached_valid = self
            .token
            .as_ref()
            .map(|t| !t.is_expired(now_secs()))
            .unwrap_or(false);
        if cached_valid {
            // Skip the auth endpoint and open a channel with the cached
            // raw token.
            let info = self
                .token
                .as_ref()
                .map(SessionInfo::from_token)
                .unwrap_or_else(|| SessionInfo {
                    actor: 0,
                    user_id: None,
                    user_info: None,
                    is_read_only: false,
                });
            self.session_read_only = info.is_read_only;
            self.connection = Connection::Connecting(info);
            self.events.emit_connection(ConnectionStatus::Connecting);
        } else {
            self.token = None;
            self.connection = Connection::Authenticating;
            self.events.emit_connection(ConnectionStatus::Authenticating);
        }
    }

    pub fn auth_succeeded(&mut self, token: AuthToken, _now: Instant) {
        self.auth_inflight = false;
        if !matches!(self.connection, Connection::Authenticating) {
            return;
        }
        let info = SessionInfo::from_token(&token);
        log::debug!("authenticated as actor {}", info.actor);
        self.token = Some(token);
        self.session_read_only = info.is_read_only;
        self.connection = Connection::Connecting(info);
        self.events.emit_connection(ConnectionStatus::Connecting);
    }

    pub fn auth_failed(&mut self, error: RoomError, now: Instant) {
        self.auth_inflight = false;
        if !matches!(self.connection, Connection::Authenticating) {
            return;
        }
        log::warn!("{error}");
        self.events.emit_error(&error);
        self.enter_unavailable(now);
    }

    /// The channel is open: enter `open`, reset the backoff, queue the
    /// presence keyframe, and resync storage when reconnecting.
    pub fn channel_opened(&mut self, sender: ChannelSender, now: Instant) {
        self.open_inflight = false;
        let Connection::Connecting(info) = self.connection.clone() else {
            log::warn!("channel opened while not connecting; dropping it");
            return;
        };
        log::info!("room channel open (actor {})", info.actor);
        self.transport = Some(sender);
        self.retry_count = 0;
        self.slow_backoff = false;
        self.retry_at = None;
        self.connection = Connection::Open(info.clone());
        self.events.emit_connection(ConnectionStatus::Open);

        self.buffer.me = Some(PresenceBuffer::Full(self.me.snapshot()));
        let reconnected = self.last_connection_id.is_some();
        if (reconnected && self.pool.has_root())
            || (self.storage_requested && !self.pool.has_root())
        {
            self.buffer.messages.push(ClientMsg::FetchStorage);
        }
        self.last_connection_id = Some(info.actor);
        self.next_heartbeat = Some(now + HEARTBEAT_INTERVAL);
        self.pong_deadline = None;
        self.try_flushing(now);
    }

    pub fn channel_open_failed(&mut self, error: RoomError, now: Instant) {
        self.open_inflight = false;
        if !matches!(self.connection, Connection::Connecting(_)) {
            return;
        }
        log::warn!("channel connect failed: {error}");
        self.enter_unavailable(now);
    }

    /// Route one event from the channel. Stale generations are ignored.
    pub fn handle_channel_event(&mut self, generation: u64, event: ChannelEvent, now: Instant) {
        if generation != self.channel_generation {
            return;
        }
        match event {
            ChannelEvent::Message(text) => self.handle_message(&text, now),
            ChannelEvent::Error(e) => log::warn!("channel error: {e}"),
            ChannelEvent::Closed { code, reason } => self.channel_closed(code, reason, now),
        }
    }

    fn channel_closed(&mut self, code: Option<u16>, reason: String, now: Instant) {
        self.transport = None;
        self.channel_generation += 1;
        self.open_inflight = false;
        self.next_heartbeat = None;
        self.pong_deadline = None;
        self.stash_pending_ops();

        match code {
            Some(CLOSE_WITHOUT_RETRY) => {
                log::info!("server ended the session (code {CLOSE_WITHOUT_RETRY})");
                self.enter_closed();
            }
            Some(code) if (REJECT_CODE_MIN..=REJECT_CODE_MAX).contains(&code) => {
                let error = RoomError::Rejected { code, reason };
                log::error!("{error}");
                self.connection = Connection::Failed;
                self.events.emit_connection(ConnectionStatus::Failed);
                self.events.emit_error(&error);
                self.slow_backoff = true;
                self.enter_unavailable(now);
            }
            _ => {
                log::info!("channel closed (code {code:?}); scheduling reconnect");
                self.enter_unavailable(now);
            }
        }
    }

    fn enter_unavailable(&mut self, now: Instant) {
        self.connection = Connection::Unavailable;
        self.clear_others_with_reset();
        self.events.emit_connection(ConnectionStatus::Unavailable);
        let delay = retry_delay(self.retry_count, self.slow_backoff);
        self.retry_count += 1;
        self.retry_at = Some(now + delay);
    }

    fn enter_closed(&mut self) {
        self.connection = Connection::Closed;
        self.retry_at = None;
        self.flush_at = None;
        self.clear_others_with_reset();
        self.events.emit_connection(ConnectionStatus::Closed);
    }

    fn clear_others_with_reset(&mut self) {
        self.others.clear();
        self.events.emit_grouped(
            &self.config.batch_updates,
            &[],
            None,
            &[OthersEvent::Reset],
            &[],
        );
    }

    /// Tear down any pending channel and timers, then re-enter the
    /// machine. Idempotent.
    pub fn reconnect(&mut self, now: Instant) {
        let was_open = self.connection.is_open();
        self.transport = None;
        self.channel_generation += 1;
        self.auth_inflight = false;
        self.open_inflight = false;
        self.retry_at = None;
        self.next_heartbeat = None;
        self.pong_deadline = None;
        self.stash_pending_ops();
        if was_open {
            self.clear_others_with_reset();
        }
        self.begin_connect(now);
    }

    /// Hard stop: clear every timer, clear others, drop all subscribers.
    pub fn disconnect(&mut self) {
        self.transport = None;
        self.channel_generation += 1;
        self.auth_inflight = false;
        self.open_inflight = false;
        self.retry_at = None;
        self.flush_at = None;
        self.next_heartbeat = None;
        self.pong_deadline = None;
        self.batch = None;
        self.stash_pending_ops();
        self.connection = Connection::Closed;
        self.clear_others_with_reset();
        self.events.emit_connection(ConnectionStatus::Closed);
        self.events.clear();
    }

    /// The network came back (host-visible connectivity signal): retry
    /// immediately instead of waiting out the backoff timer.
    pub fn network_online(&mut self, now: Instant) {
        if matches!(self.connection, Connection::Unavailable) {
            self.retry_at = None;
            self.begin_connect(now);
        }
    }

    /// The host surface became visible again: probe the channel with an
    /// immediate heartbeat while staying open.
    pub fn visibility_visible(&mut self, now: Instant) {
        if self.connection.is_open() {
            self.send_heartbeat(now);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Earliest pending deadline, for the driver's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.retry_at,
            self.flush_at,
            self.next_heartbeat,
            self.pong_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every deadline that is due.
    pub fn tick(&mut self, now: Instant) {
        if let Some(at) = self.retry_at {
            if now >= at && matches!(self.connection, Connection::Unavailable) {
                self.retry_at = None;
                self.begin_connect(now);
            }
        }
        if let Some(at) = self.flush_at {
            if now >= at {
                self.flush_at = None;
                self.try_flushing(now);
            }
        }
        if self.connection.is_open() {
            if let Some(at) = self.pong_deadline {
                if now >= at {
                    log::warn!("pong timeout; recycling the channel");
                    self.pong_deadline = None;
                    self.transport = None;
                    self.channel_generation += 1;
                    self.stash_pending_ops();
                    self.enter_unavailable(now);
                    return;
                }
            }
            if let Some(at) = self.next_heartbeat {
                if now >= at {
                    self.send_heartbeat(now);
                }
            }
        }
    }

    fn send_heartbeat(&mut self, now: Instant) {
        if let Some(tx) = &self.transport {
            if tx.send("ping".to_string()).is_ok() {
                self.pong_deadline = Some(now + PONG_TIMEOUT);
            }
        }
        self.next_heartbeat = Some(now + HEARTBEAT_INTERVAL);
    }

    /// What the driver should do right now. Marks the work as in flight.
    pub fn pending_work(&mut self) -> DriverWork {
        match &self.connection {
            Connection::Authenticating if !self.auth_inflight => {
                self.auth_inflight = true;
                DriverWork::Authenticate
            }
            Connection::Connecting(_) if self.transport.is_none() && !self.open_inflight => {
                match &self.token {
                    Some(token) => {
                        self.open_inflight = true;
                        self.channel_generation += 1;
                        DriverWork::OpenChannel {
                            url: self.config.channel_url(&token.raw),
                            generation: self.channel_generation,
                        }
                    }
                    None => DriverWork::Idle,
                }
            }
            _ => DriverWork::Idle,
        }
    }

    // ── Presence, events, batching ──────────────────────────────────

    /// Merge a patch into the local presence. With an active batch the
    /// reverse delta joins the batch; otherwise the change applies and
    /// flushes eagerly.
    pub fn update_presence(&mut self, patch: JsonMap, add_to_history: bool, now: Instant) {
        if patch.is_empty() {
            return;
        }
        let reverse = self.me.patch(&patch);
        self.buffer_presence_patch(&patch);

        if let Some(mut acc) = self.batch.take() {
            if add_to_history {
                let mut reversed = vec![HistoryOp::Presence { data: reverse }];
                reversed.append(&mut acc.reverse);
                acc.reverse = reversed;
            }
            acc.presence_changed = true;
            self.batch = Some(acc);
        } else {
            if add_to_history {
                self.history.push_undo(vec![HistoryOp::Presence { data: reverse }]);
                self.emit_history_change();
            }
            self.emit_batch_events(HashMap::new(), true, Vec::new(), Vec::new());
            self.try_flushing(now);
        }
    }

    fn buffer_presence_patch(&mut self, patch: &JsonMap) {
        match &mut self.buffer.me {
            // A pending keyframe absorbs the patch (null removes keys).
            Some(PresenceBuffer::Full(data)) => crate::presence::merge_patch(data, patch),
            // Patches stack; explicit nulls must survive to the wire.
            Some(PresenceBuffer::Patch(data)) => {
                for (key, value) in patch {
                    data.insert(key.clone(), value.clone());
                }
            }
            None => self.buffer.me = Some(PresenceBuffer::Patch(patch.clone())),
        }
    }

    /// Run `f` with an active batch. Nested calls contribute to the
    /// outermost batch; commit happens when the outermost scope ends.
    pub fn batch<R>(&mut self, now: Instant, f: impl FnOnce(&mut Self) -> R) -> R {
        if self.batch.is_some() {
            return f(self);
        }
        self.batch = Some(BatchAcc::default());
        let result = f(self);
        if let Some(acc) = self.batch.take() {
            self.commit_batch(acc, now);
        }
        result
    }

    fn run_in_batch<R>(&mut self, now: Instant, f: impl FnOnce(&mut Self, &mut BatchAcc) -> R) -> R {
        if let Some(mut acc) = self.batch.take() {
            let result = f(self, &mut acc);
            self.batch = Some(acc);
            result
        } else {
            let mut acc = BatchAcc::default();
            let result = f(self, &mut acc);
            self.commit_batch(acc, now);
            result
        }
    }

    fn commit_batch(&mut self, acc: BatchAcc, now: Instant) {
        if !acc.reverse.is_empty() {
            self.history.push_undo(acc.reverse);
        }
        if !acc.ops.is_empty() {
            self.history.clear_redo();
            self.buffer.storage_ops.extend(acc.ops);
        }
        self.emit_batch_events(acc.updates, acc.presence_changed, Vec::new(), Vec::new());
        self.emit_history_change();
        self.try_flushing(now);
    }

    fn emit_batch_events(
        &mut self,
        updates: HashMap<String, StorageUpdate>,
        presence_changed: bool,
        others: Vec<OthersEvent>,
        custom: Vec<CustomEvent>,
    ) {
        let matched = self
            .events
            .match_storage_subs(&updates, |id| self.pool.ancestor_chain(id));
        let me = if presence_changed {
            Some(self.me.snapshot())
        } else {
            None
        };
        self.events.emit_grouped(
            &self.config.batch_updates,
            &matched,
            me.as_ref(),
            &others,
            &custom,
        );
    }

    fn emit_history_change(&mut self) {
        let event = HistoryEvent {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        };
        if self.last_history_event != Some(event) {
            self.last_history_event = Some(event);
            self.events.emit_history(event);
        }
    }

    // ── Undo / redo ─────────────────────────────────────────────────

    pub fn undo(&mut self, now: Instant) -> Result<(), RoomError> {
        if self.batch.is_some() {
            return Err(RoomError::InvariantViolation(
                "undo is not allowed while a batch is active".into(),
            ));
        }
        let Some(batch) = self.history.pop_undo() else {
            return Ok(());
        };
        let applied = self.apply_ops(batch, true);
        self.history.push_redo(applied.reverse);
        self.buffer.storage_ops.extend(applied.ops);
        self.emit_batch_events(applied.updates, applied.presence_changed, Vec::new(), Vec::new());
        self.emit_history_change();
        self.try_flushing(now);
        Ok(())
    }

    pub fn redo(&mut self, now: Instant) -> Result<(), RoomError> {
        if self.batch.is_some() {
            return Err(RoomError::InvariantViolation(
                "redo is not allowed while a batch is active".into(),
            ));
        }
        let Some(batch) = self.history.pop_redo() else {
            return Ok(());
        };
        let applied = self.apply_ops(batch, true);
        self.history.push_undo(applied.reverse);
        self.buffer.storage_ops.extend(applied.ops);
        self.emit_batch_events(applied.updates, applied.presence_changed, Vec::new(), Vec::new());
        self.emit_history_change();
        self.try_flushing(now);
        Ok(())
    }

    pub fn pause_history(&mut self) {
        self.history.pause();
    }

    pub fn resume_history(&mut self) {
        self.history.resume();
        self.emit_history_change();
    }

    // ── Custom events ───────────────────────────────────────────────

    /// Queue a broadcast event. Without `queue_if_not_ready`, a closed
    /// channel makes this a silent drop.
    pub fn broadcast_event(&mut self, event: Value, queue_if_not_ready: bool, now: Instant) {
        if !self.connection.is_open() && !queue_if_not_ready {
            log::debug!("dropping broadcast event: channel not open");
            return;
        }
        self.buffer.messages.push(ClientMsg::BroadcastEvent { event });
        self.try_flushing(now);
    }

    // ── Storage mutators ────────────────────────────────────────────

    fn assert_storage_writable(&self) -> Result<(), RoomError> {
        // The cached flag, not the live session: a read-only token stays
        // read-only while the channel is down.
        if self.session_read_only {
            return Err(RoomError::WriteDenied);
        }
        Ok(())
    }

    fn current_actor(&self) -> i64 {
        self.connection
            .session()
            .map(|s| s.actor)
            .or(self.last_connection_id)
            .unwrap_or(0)
    }

    fn next_node_id(&mut self) -> String {
        let id = format!("{}:{}", self.current_actor(), self.node_seq);
        self.node_seq += 1;
        id
    }

    fn next_op_id(&mut self) -> String {
        let id = format!("{}:{}", self.current_actor(), self.op_seq);
        self.op_seq += 1;
        id
    }

    /// Set a key on an Object node.
    pub fn object_set(
        &mut self,
        node_id: &str,
        key: &str,
        value: LiveValue,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let Some(NodeBody::Object { .. }) = self.pool.get(node_id).map(|n| &n.body) else {
            return Err(RoomError::InvariantViolation(format!(
                "no object node {node_id}"
            )));
        };
        let ops = match value {
            LiveValue::Json(v) => {
                let mut data = JsonMap::new();
                data.insert(key.to_string(), v);
                vec![Op::UpdateObject {
                    op_id: Some(self.next_op_id()),
                    id: node_id.to_string(),
                    data,
                }]
            }
            live => {
                let mut ops = Vec::new();
                self.build_subtree_ops(node_id.to_string(), key.to_string(), live, &mut ops);
                ops
            }
        };
        self.run_in_batch(now, |room, acc| room.apply_local_ops(ops, acc));
        Ok(())
    }

    /// Delete a key (plain field or child node) from an Object node.
    pub fn object_delete_key(
        &mut self,
        node_id: &str,
        key: &str,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let op = Op::DeleteObjectKey {
            op_id: Some(self.next_op_id()),
            id: node_id.to_string(),
            key: key.to_string(),
        };
        self.run_in_batch(now, |room, acc| room.apply_local_ops(vec![op], acc));
        Ok(())
    }

    /// Set a key on a Map node.
    pub fn map_set(
        &mut self,
        node_id: &str,
        key: &str,
        value: LiveValue,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let Some(NodeBody::Map { .. }) = self.pool.get(node_id).map(|n| &n.body) else {
            return Err(RoomError::InvariantViolation(format!(
                "no map node {node_id}"
            )));
        };
        let mut ops = Vec::new();
        self.build_subtree_ops(node_id.to_string(), key.to_string(), value, &mut ops);
        self.run_in_batch(now, |room, acc| room.apply_local_ops(ops, acc));
        Ok(())
    }

    /// Delete a key from a Map node. Unknown keys are a no-op.
    pub fn map_delete(&mut self, node_id: &str, key: &str, now: Instant) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let Some(child) = self
            .pool
            .get(node_id)
            .and_then(|n| n.child_at_key(key))
            .map(String::from)
        else {
            return Ok(());
        };
        let op = Op::DeleteCrdt {
            op_id: Some(self.next_op_id()),
            id: child,
        };
        self.run_in_batch(now, |room, acc| room.apply_local_ops(vec![op], acc));
        Ok(())
    }

    /// Append to a List node.
    pub fn list_push(
        &mut self,
        node_id: &str,
        value: LiveValue,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let len = self.list_len(node_id)?;
        self.list_insert(node_id, len, value, now)
    }

    /// Insert into a List node at `index` (clamped to the length).
    pub fn list_insert(
        &mut self,
        node_id: &str,
        index: usize,
        value: LiveValue,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let position = {
            let entries = self.list_entries(node_id)?;
            let index = index.min(entries.len());
            let lo = index.checked_sub(1).and_then(|i| entries.get(i));
            let hi = entries.get(index);
            pos::between(lo.map(|e| e.0.as_str()), hi.map(|e| e.0.as_str()))
        };
        let mut ops = Vec::new();
        self.build_subtree_ops(node_id.to_string(), position, value, &mut ops);
        self.run_in_batch(now, |room, acc| room.apply_local_ops(ops, acc));
        Ok(())
    }

    /// Move a List child from `from` to `to`.
    pub fn list_move(
        &mut self,
        node_id: &str,
        from: usize,
        to: usize,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let (child, position) = {
            let entries = self.list_entries(node_id)?;
            let Some(moving) = entries.get(from) else {
                return Err(RoomError::InvariantViolation(format!(
                    "list index {from} out of bounds"
                )));
            };
            let rest: Vec<&(String, String)> =
                entries.iter().filter(|e| e.1 != moving.1).collect();
            let to = to.min(rest.len());
            let lo = to.checked_sub(1).and_then(|i| rest.get(i));
            let hi = rest.get(to);
            (
                moving.1.clone(),
                pos::between(lo.map(|e| e.0.as_str()), hi.map(|e| e.0.as_str())),
            )
        };
        let op = Op::SetParentKey {
            op_id: Some(self.next_op_id()),
            id: child,
            parent_key: position,
        };
        self.run_in_batch(now, |room, acc| room.apply_local_ops(vec![op], acc));
        Ok(())
    }

    /// Delete the List child at `index`.
    pub fn list_delete(
        &mut self,
        node_id: &str,
        index: usize,
        now: Instant,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let child = {
            let entries = self.list_entries(node_id)?;
            let Some(entry) = entries.get(index) else {
                return Err(RoomError::InvariantViolation(format!(
                    "list index {index} out of bounds"
                )));
            };
            entry.1.clone()
        };
        let op = Op::DeleteCrdt {
            op_id: Some(self.next_op_id()),
            id: child,
        };
        self.run_in_batch(now, |room, acc| room.apply_local_ops(vec![op], acc));
        Ok(())
    }

    fn list_entries(&self, node_id: &str) -> Result<Vec<(String, String)>, RoomError> {
        match self.pool.get(node_id).map(|n| &n.body) {
            Some(NodeBody::List { children }) => Ok(children
                .iter()
                .map(|e| (e.pos.clone(), e.id.clone()))
                .collect()),
            _ => Err(RoomError::InvariantViolation(format!(
                "no list node {node_id}"
            ))),
        }
    }

    fn list_len(&self, node_id: &str) -> Result<usize, RoomError> {
        Ok(self.list_entries(node_id)?.len())
    }

    fn build_subtree_ops(
        &mut self,
        parent_id: String,
        parent_key: String,
        value: LiveValue,
        ops: &mut Vec<Op>,
    ) {
        match value {
            LiveValue::Json(data) => {
                let op_id = Some(self.next_op_id());
                ops.push(Op::CreateRegister {
                    op_id,
                    id: self.next_node_id(),
                    parent_id,
                    parent_key,
                    data,
                });
            }
            LiveValue::Object(fields) => {
                let id = self.next_node_id();
                let mut data = JsonMap::new();
                let mut live_fields = Vec::new();
                for (key, field) in fields {
                    match field {
                        LiveValue::Json(v) => {
                            data.insert(key, v);
                        }
                        other => live_fields.push((key, other)),
                    }
                }
                ops.push(Op::CreateObject {
                    op_id: Some(self.next_op_id()),
                    id: id.clone(),
                    parent_id,
                    parent_key,
                    data,
                });
                for (key, field) in live_fields {
                    self.build_subtree_ops(id.clone(), key, field, ops);
                }
            }
            LiveValue::List(items) => {
                let id = self.next_node_id();
                ops.push(Op::CreateList {
                    op_id: Some(self.next_op_id()),
                    id: id.clone(),
                    parent_id,
                    parent_key,
                });
                let mut last: Option<String> = None;
                for item in items {
                    let position = pos::after(last.as_deref());
                    self.build_subtree_ops(id.clone(), position.clone(), item, ops);
                    last = Some(position);
                }
            }
            LiveValue::Map(entries) => {
                let id = self.next_node_id();
                ops.push(Op::CreateMap {
                    op_id: Some(self.next_op_id()),
                    id: id.clone(),
                    parent_id,
                    parent_key,
                });
                for (key, entry) in entries {
                    self.build_subtree_ops(id.clone(), key, entry, ops);
                }
            }
        }
    }

    fn apply_local_ops(&mut self, ops: Vec<Op>, acc: &mut BatchAcc) {
        for op in ops {
            let result = self.pool.apply_op(&op, OpSource::Local);
            if !result.modified {
                continue;
            }
            if op.is_create() {
                if let Some(id) = create_target(&op) {
                    acc.created.insert(id.to_string());
                }
            }
            if let Some((node_id, update)) = result.update {
                merge_node_update(&mut acc.updates, &acc.created, &self.pool, node_id, update);
            }
            let mut reversed: Vec<HistoryOp> =
                result.reverse.into_iter().map(HistoryOp::Op).collect();
            reversed.append(&mut acc.reverse);
            acc.reverse = reversed;
            acc.ops.push(op);
        }
    }

    // ── Apply pipeline ──────────────────────────────────────────────

    /// Apply a batch of history ops. `is_local` marks undo/redo and
    /// reconnect replays; everything else is wire input whose source is
    /// decided per op against the ledger.
    fn apply_ops(&mut self, items: Vec<HistoryOp>, is_local: bool) -> Applied {
        let mut out = Applied::default();
        let mut created: HashSet<String> = HashSet::new();

        for item in items {
            match item {
                HistoryOp::Presence { data } => {
                    let reverse = self.me.patch(&data);
                    self.buffer_presence_patch(&data);
                    let mut reversed = vec![HistoryOp::Presence { data: reverse }];
                    reversed.append(&mut out.reverse);
                    out.reverse = reversed;
                    out.presence_changed = true;
                }
                HistoryOp::Op(mut op) => {
                    if let Op::Ack { op_id } = &op {
                        // The echo only clears the ledger entry.
                        self.ledger.remove(op_id);
                        continue;
                    }
                    if op.op_id().is_none() {
                        op.set_op_id(self.next_op_id());
                    }
                    let source = if is_local {
                        OpSource::UndoRedoReconnect
                    } else {
                        let acked = op
                            .op_id()
                            .map(|id| self.ledger.remove(id).is_some())
                            .unwrap_or(false);
                        if acked {
                            OpSource::Ack
                        } else {
                            OpSource::Remote
                        }
                    };
                    if source == OpSource::Ack {
                        // Replica already reflects the local value.
                        continue;
                    }

                    let result = self.pool.apply_op(&op, source);
                    if result.modified && op.is_create() {
                        if let Some(id) = create_target(&op) {
                            created.insert(id.to_string());
                        }
                    }
                    if let Some((node_id, update)) = result.update {
                        merge_node_update(&mut out.updates, &created, &self.pool, node_id, update);
                    }
                    if result.modified {
                        let mut reversed: Vec<HistoryOp> =
                            result.reverse.into_iter().map(HistoryOp::Op).collect();
                        reversed.append(&mut out.reverse);
                        out.reverse = reversed;
                    }
                    out.ops.push(op);
                }
            }
        }
        out
    }

    // ── Outbound flush pipeline ─────────────────────────────────────

    /// Move buffered storage ops into the ledger without sending. Used
    /// when the channel dies so the ops survive for resend.
    fn stash_pending_ops(&mut self) {
        let ops = std::mem::take(&mut self.buffer.storage_ops);
        for op in ops {
            if let Some(id) = op.op_id().map(String::from) {
                self.ledger.insert(id, op);
            }
        }
        self.refresh_storage_status();
    }

    /// At most one outbound frame per throttle interval.
    pub fn try_flushing(&mut self, now: Instant) {
        // Every buffered storage op becomes unacknowledged first.
        for op in &self.buffer.storage_ops {
            if let Some(id) = op.op_id().map(String::from) {
                self.ledger.insert(id, op.clone());
            }
        }
        self.refresh_storage_status();

        if !self.connection.is_open() || self.transport.is_none() {
            // Ops stay in the ledger for resend after reconnect.
            self.buffer.storage_ops.clear();
            return;
        }

        let throttle = self.config.effective_throttle();
        let due = self
            .last_flush
            .map_or(true, |at| now.duration_since(at) >= throttle);
        if !due {
            let deadline = self.last_flush.map(|at| at + throttle).unwrap_or(now);
            self.flush_at = Some(match self.flush_at {
                Some(existing) => existing.min(deadline),
                None => deadline,
            });
            return;
        }

        let messages = self.compose_messages();
        if messages.is_empty() {
            return;
        }
        let frame = encode_frame(&messages);
        self.send_frame(frame);
        self.last_flush = Some(now);
        self.flush_at = None;
    }

    /// Frame composition order: presence, broadcasts, storage ops.
    fn compose_messages(&mut self) -> Vec<ClientMsg> {
        let mut messages = Vec::new();
        if let Some(me) = self.buffer.me.take() {
            messages.push(match me {
                PresenceBuffer::Full(data) => ClientMsg::UpdatePresence {
                    data,
                    target_actor: Some(KEYFRAME_TARGET),
                },
                PresenceBuffer::Patch(data) => ClientMsg::UpdatePresence {
                    data,
                    target_actor: None,
                },
            });
        }
        messages.append(&mut self.buffer.messages);
        let ops = std::mem::take(&mut self.buffer.storage_ops);
        if !ops.is_empty() {
            messages.push(ClientMsg::UpdateStorage { ops });
        }
        messages
    }

    fn send_frame(&mut self, frame: String) {
        if let Some(tx) = &self.transport {
            if let Err(e) = tx.send(frame) {
                log::error!("outbound send failed: {e}");
            }
        }
    }

    fn refresh_storage_status(&mut self) {
        let status = self.storage_status();
        if status != self.last_storage_status {
            self.last_storage_status = status;
            self.events.emit_storage_status(status);
        }
    }

    // ── Storage loading ─────────────────────────────────────────────

    /// Ensure initial storage is being fetched. Returns a waiter that
    /// resolves when the root exists, or `None` if it already does.
    pub fn request_storage(&mut self, now: Instant) -> Option<oneshot::Receiver<()>> {
        if self.pool.has_root() {
            return None;
        }
        if !self.storage_requested {
            self.storage_requested = true;
            self.refresh_storage_status();
        }
        if self.connection.is_open()
            && !self
                .buffer
                .messages
                .iter()
                .any(|m| matches!(m, ClientMsg::FetchStorage))
        {
            self.buffer.messages.push(ClientMsg::FetchStorage);
            self.try_flushing(now);
        }
        let (tx, rx) = oneshot::channel();
        self.storage_waiters.push(tx);
        Some(rx)
    }

    /// Synchronous snapshot of the whole document; kicks off loading
    /// when the root is not yet present.
    pub fn storage_snapshot(&mut self, now: Instant) -> Option<Value> {
        match self.pool.root_id().map(String::from) {
            Some(root) => self.pool.to_json(&root),
            None => {
                let _ = self.request_storage(now);
                None
            }
        }
    }

    // ── Inbound dispatcher ──────────────────────────────────────────

    /// Route one inbound text frame. The literal `"pong"` cancels the
    /// pong timeout; anything else is parsed as one or more messages.
    /// Handler errors never tear down the dispatcher.
    pub fn handle_message(&mut self, text: &str, now: Instant) {
        if text == "pong" {
            self.pong_deadline = None;
            return;
        }
        let messages = parse_frame(text);
        if messages.is_empty() {
            log::debug!("ignoring unparseable frame");
            return;
        }

        let mut updates: HashMap<String, StorageUpdate> = HashMap::new();
        let mut others_events: Vec<OthersEvent> = Vec::new();
        let mut custom_events: Vec<CustomEvent> = Vec::new();
        let mut needs_flush = false;

        for message in messages {
            match message {
                ServerMsg::UserJoined {
                    actor,
                    user_id,
                    user_info,
                    scopes,
                } => {
                    let read_only = scopes_are_read_only(&scopes);
                    if let Some(user) =
                        self.others.set_connection(actor, user_id, user_info, read_only)
                    {
                        others_events.push(OthersEvent::Enter(user));
                    }
                    // Greet the joining actor with a direct full snapshot.
                    self.buffer.messages.push(ClientMsg::UpdatePresence {
                        data: self.me.snapshot(),
                        target_actor: Some(actor),
                    });
                    needs_flush = true;
                }
                ServerMsg::UpdatePresence {
                    actor,
                    data,
                    target_actor,
                } => {
                    if target_actor.is_some() {
                        if let Some((user, entered)) = self.others.set_other(actor, data.clone()) {
                            others_events.push(if entered {
                                OthersEvent::Enter(user)
                            } else {
                                OthersEvent::Update { user, patch: data }
                            });
                        }
                    } else if let Some(user) = self.others.patch_other(actor, &data) {
                        others_events.push(OthersEvent::Update { user, patch: data });
                    }
                }
                ServerMsg::UserLeft { actor } => {
                    if let Some(user) = self.others.remove_connection(actor) {
                        others_events.push(OthersEvent::Leave(user));
                    }
                }
                ServerMsg::BroadcastedEvent { actor, event } => {
                    custom_events.push(CustomEvent {
                        connection_id: actor,
                        event,
                    });
                }
                ServerMsg::RoomState { users } => {
                    self.others.retain_actors(|actor| users.contains_key(&actor));
                    for (actor, user) in &users {
                        self.others.set_connection(
                            *actor,
                            user.user_id.clone(),
                            user.user_info.clone(),
                            scopes_are_read_only(&user.scopes),
                        );
                    }
                    others_events.push(OthersEvent::Reset);
                }
                ServerMsg::InitialStorageState { items } => {
                    self.handle_initial_storage(items, &mut updates);
                    needs_flush = true;
                }
                ServerMsg::UpdateStorage { ops } => {
                    let applied =
                        self.apply_ops(ops.into_iter().map(HistoryOp::Op).collect(), false);
                    for (node_id, update) in applied.updates {
                        merge_into(&mut updates, node_id, update.update);
                    }
                    self.refresh_storage_status();
                }
                ServerMsg::RejectStorageOp { op_ids, reason } => {
                    let error = RoomError::StorageMutationRejected { op_ids, reason };
                    log::error!("{error}; local replica may have diverged");
                    self.events.emit_error(&error);
                    if cfg!(debug_assertions) {
                        panic!("{error}");
                    }
                }
            }
        }

        self.emit_batch_events(updates, false, others_events, custom_events);
        if needs_flush {
            self.try_flushing(now);
        }
    }

    /// Load or refresh the root from an initial storage message, then
    /// re-apply and resend anything the server has not yet confirmed.
    fn handle_initial_storage(
        &mut self,
        items: Vec<(String, SerializedCrdt)>,
        updates: &mut HashMap<String, StorageUpdate>,
    ) {
        if items.is_empty() {
            log::error!("initial storage state contained no items");
            return;
        }

        self.stash_pending_ops();
        let resend = self.ledger.snapshot();

        let rebuild = match self.pool.root_id() {
            None => true,
            Some(root) => !items
                .iter()
                .any(|(id, crdt)| id == root && crdt.parent_id.is_none()),
        };
        if rebuild {
            match NodePool::build_from_items(&items) {
                Ok(pool) => self.pool = pool,
                Err(error) => {
                    log::error!("cannot load initial storage: {error}");
                    return;
                }
            }
        } else {
            let diff = self.pool.diff_against(&items);
            let applied = self.apply_ops(diff.into_iter().map(HistoryOp::Op).collect(), false);
            for (node_id, update) in applied.updates {
                merge_into(updates, node_id, update.update);
            }
        }

        // Re-apply unconfirmed local ops on the fresh baseline, then queue
        // them so the server integrates them exactly once.
        if !resend.is_empty() {
            log::info!("re-applying {} unacknowledged ops after resync", resend.len());
            let applied = self.apply_ops(
                resend.iter().cloned().map(HistoryOp::Op).collect(),
                true,
            );
            for (node_id, update) in applied.updates {
                merge_into(updates, node_id, update.update);
            }
            self.buffer.storage_ops.extend(resend);
        }

        self.apply_initial_defaults();

        self.storage_requested = true;
        for waiter in self.storage_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if !self.storage_loaded_once {
            self.storage_loaded_once = true;
            self.events.emit_storage_did_load();
        }
        self.refresh_storage_status();
    }

    /// Seed configured defaults for root keys the document lacks. Runs
    /// on every (re)load; never enters history.
    fn apply_initial_defaults(&mut self) {
        let Some(root) = self.pool.root_id().map(String::from) else {
            return;
        };
        let missing: JsonMap = {
            let Some(node) = self.pool.get(&root) else {
                return;
            };
            let NodeBody::Object { data, children } = &node.body else {
                return;
            };
            self.config
                .initial_storage
                .iter()
                .filter(|(key, _)| !data.contains_key(*key) && !children.contains_key(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        if missing.is_empty() {
            return;
        }
        let op = Op::UpdateObject {
            op_id: Some(self.next_op_id()),
            id: root,
            data: missing,
        };
        self.pool.apply_op(&op, OpSource::Local);
        self.buffer.storage_ops.push(op);
    }
}

/// The node id a create op would introduce.
fn create_target(op: &Op) -> Option<&str> {
    match op {
        Op::CreateObject { id, .. }
        | Op::CreateList { id, .. }
        | Op::CreateMap { id, .. }
        | Op::CreateRegister { id, .. } => Some(id),
        _ => None,
    }
}

/// Merge one per-node update into the accumulator, unless the node (or
/// an ancestor) was created in the same pass: the creation itself
/// carries the state.
fn merge_node_update(
    updates: &mut HashMap<String, StorageUpdate>,
    created: &HashSet<String>,
    pool: &NodePool,
    node_id: String,
    update: NodeUpdate,
) {
    if pool
        .ancestor_chain(&node_id)
        .iter()
        .any(|ancestor| created.contains(ancestor))
    {
        return;
    }
    merge_into(updates, node_id, update);
}

fn merge_into(updates: &mut HashMap<String, StorageUpdate>, node_id: String, update: NodeUpdate) {
    match updates.entry(node_id.clone()) {
        std::collections::hash_map::Entry::Occupied(mut entry) => {
            entry.get_mut().update.merge(update);
        }
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(StorageUpdate { node_id, update });
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Host facade & driver
// ───────────────────────────────────────────────────────────────────

/// The public room handle.
///
/// Cheap to clone; all clones share one [`RoomCore`]. Dropping every
/// clone stops the driver.
#[derive(Clone)]
pub struct Room {
    state: Arc<Mutex<RoomCore>>,
    wake: mpsc::UnboundedSender<()>,
}

impl Room {
    /// Create the room and start its driver task. Must be called from
    /// within a tokio runtime.
    pub fn new(config: RoomConfig) -> Room {
        let auth = Authenticator::new(config.auth.clone());
        let room_id = config.room_id.clone();
        let state = Arc::new(Mutex::new(RoomCore::new(config)));
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();

        let driver_state = Arc::downgrade(&state);
        tokio::spawn(run_driver(driver_state, wake_rx, auth, room_id));

        Room {
            state,
            wake: wake_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RoomCore> {
        self.state.lock().expect("room state poisoned")
    }

    fn nudge(&self) {
        let _ = self.wake.send(());
    }

    /// Run a closure against the core. Escape hatch for tests and
    /// advanced hosts.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut RoomCore) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        drop(state);
        self.nudge();
        result
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn connect(&self) {
        self.lock().connect(Instant::now());
        self.nudge();
    }

    pub fn reconnect(&self) {
        self.lock().reconnect(Instant::now());
        self.nudge();
    }

    pub fn disconnect(&self) {
        self.lock().disconnect();
        self.nudge();
    }

    pub fn notify_network_online(&self) {
        self.lock().network_online(Instant::now());
        self.nudge();
    }

    pub fn notify_visibility_visible(&self) {
        self.lock().visibility_visible(Instant::now());
        self.nudge();
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock().connection_status()
    }

    // ── Presence & events ───────────────────────────────────────────

    pub fn update_presence(&self, patch: JsonMap, add_to_history: bool) {
        self.lock()
            .update_presence(patch, add_to_history, Instant::now());
        self.nudge();
    }

    pub fn get_presence(&self) -> JsonMap {
        self.lock().presence()
    }

    pub fn others(&self) -> Vec<User> {
        self.lock().others_snapshot()
    }

    pub fn broadcast_event(&self, event: Value, queue_if_not_ready: bool) {
        self.lock()
            .broadcast_event(event, queue_if_not_ready, Instant::now());
        self.nudge();
    }

    // ── Batching & history ──────────────────────────────────────────

    pub fn batch<R>(&self, f: impl FnOnce(&mut RoomCore) -> R) -> R {
        let mut state = self.lock();
        let result = state.batch(Instant::now(), f);
        drop(state);
        self.nudge();
        result
    }

    pub fn undo(&self) -> Result<(), RoomError> {
        let result = self.lock().undo(Instant::now());
        self.nudge();
        result
    }

    pub fn redo(&self) -> Result<(), RoomError> {
        let result = self.lock().redo(Instant::now());
        self.nudge();
        result
    }

    pub fn can_undo(&self) -> bool {
        self.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.lock().can_redo()
    }

    pub fn pause_history(&self) {
        self.lock().pause_history();
    }

    pub fn resume_history(&self) {
        self.lock().resume_history();
    }

    // ── Storage ─────────────────────────────────────────────────────

    /// Suspend until the initial storage state has loaded; resolves to
    /// the root node id. The only suspending call in the API.
    pub async fn storage(&self) -> Result<String, RoomError> {
        let waiter = {
            let mut state = self.lock();
            match state.root_id() {
                Some(root) => return Ok(root),
                None => state.request_storage(Instant::now()),
            }
        };
        self.nudge();
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
        self.lock().root_id().ok_or_else(|| {
            RoomError::InvariantViolation("storage resolved without a root".into())
        })
    }

    /// Synchronous snapshot; `None` until storage has loaded (and the
    /// call itself kicks loading off).
    pub fn storage_snapshot(&self) -> Option<Value> {
        let snapshot = self.lock().storage_snapshot(Instant::now());
        self.nudge();
        snapshot
    }

    pub fn storage_status(&self) -> StorageStatus {
        self.lock().storage_status()
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub fn subscribe_connection(
        &self,
        f: impl Fn(&ConnectionStatus) + Send + 'static,
    ) -> SubscriptionId {
        self.lock().events_mut().on_connection(f)
    }

    pub fn subscribe_my_presence(&self, f: impl Fn(&JsonMap) + Send + 'static) -> SubscriptionId {
        self.lock().events_mut().on_my_presence(f)
    }

    pub fn subscribe_others(&self, f: impl Fn(&OthersEvent) + Send + 'static) -> SubscriptionId {
        self.lock().events_mut().on_others(f)
    }

    pub fn subscribe_event(&self, f: impl Fn(&CustomEvent) + Send + 'static) -> SubscriptionId {
        self.lock().events_mut().on_event(f)
    }

    pub fn subscribe_error(&self, f: impl Fn(&RoomError) + Send + 'static) -> SubscriptionId {
        self.lock().events_mut().on_error(f)
    }

    pub fn subscribe_history(&self, f: impl Fn(&HistoryEvent) + Send + 'static) -> SubscriptionId {
        self.lock().events_mut().on_history(f)
    }

    pub fn subscribe_storage_status(
        &self,
        f: impl Fn(&StorageStatus) + Send + 'static,
    ) -> SubscriptionId {
        self.lock().events_mut().on_storage_status(f)
    }

    /// Node-scoped storage subscription; `deep` also matches descendants.
    pub fn subscribe_storage(
        &self,
        node_id: impl Into<String>,
        deep: bool,
        f: impl Fn(&Vec<StorageUpdate>) + Send + 'static,
    ) -> SubscriptionId {
        self.lock().events_mut().on_storage(node_id, deep, f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().events_mut().unsubscribe(id)
    }
}

/// The driver: performs auth and channel opens, pumps channel events,
/// and fires core deadlines. Exits when the room is dropped.
async fn run_driver(
    state: std::sync::Weak<Mutex<RoomCore>>,
    mut wake: mpsc::UnboundedReceiver<()>,
    auth: Authenticator,
    room_id: String,
) {
    let (channel_tx, mut channel_rx) = mpsc::unbounded_channel::<(u64, ChannelEvent)>();

    loop {
        let Some(strong) = state.upgrade() else {
            return;
        };
        let work = strong
            .lock()
            .map(|mut s| s.pending_work())
            .unwrap_or(DriverWork::Idle);

        match work {
            DriverWork::Authenticate => {
                let result = auth.authenticate(&room_id).await;
                let Some(strong) = state.upgrade() else {
                    return;
                };
                if let Ok(mut core) = strong.lock() {
                    match result {
                        Ok(token) => core.auth_succeeded(token, Instant::now()),
                        Err(error) => core.auth_failed(error, Instant::now()),
                    }
                }
                continue;
            }
            DriverWork::OpenChannel { url, generation } => {
                let result = open_channel(&url, generation, channel_tx.clone()).await;
                let Some(strong) = state.upgrade() else {
                    return;
                };
                if let Ok(mut core) = strong.lock() {
                    match result {
                        Ok(sender) => core.channel_opened(sender, Instant::now()),
                        Err(error) => core.channel_open_failed(error, Instant::now()),
                    }
                }
                continue;
            }
            DriverWork::Idle => {}
        }

        let deadline = strong.lock().map(|s| s.next_deadline()).unwrap_or(None);
        drop(strong);

        tokio::select! {
            woke = wake.recv() => {
                if woke.is_none() {
                    return; // every Room handle is gone
                }
            }
            Some((generation, event)) = channel_rx.recv() => {
                let Some(strong) = state.upgrade() else { return; };
                if let Ok(mut core) = strong.lock() {
                    core.handle_channel_event(generation, event, Instant::now());
                };
            }
            _ = sleep_until_opt(deadline) => {
                let Some(strong) = state.upgrade() else { return; };
                if let Ok(mut core) = strong.lock() {
                    core.tick(Instant::now());
                };
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
