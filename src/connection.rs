//! Connection state machine data: states, session identity, backoff
//! schedules, and heartbeat constants.
//!
//! The machine itself is driven by the room (host calls, timer
//! callbacks, channel callbacks); this module owns the pure pieces.

use std::time::Duration;

use serde_json::Value;

use crate::token::AuthToken;

/// Standard reconnect schedule, indexed by retry count and saturating at
/// the last entry.
pub const RETRY_DELAYS_MS: [u64; 7] = [250, 500, 1000, 2000, 4000, 8000, 10_000];

/// Slow schedule used after a known close-code rejection.
pub const SLOW_RETRY_DELAYS_MS: [u64; 4] = [2000, 30_000, 60_000, 300_000];

/// Heartbeat cadence while the channel is open.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for the literal `"pong"` before declaring the
/// channel dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(2);

/// The delay before the next reconnect attempt.
pub fn retry_delay(retry_count: u32, slow: bool) -> Duration {
    let table: &[u64] = if slow {
        &SLOW_RETRY_DELAYS_MS
    } else {
        &RETRY_DELAYS_MS
    };
    let index = (retry_count as usize).min(table.len() - 1);
    Duration::from_millis(table[index])
}

/// Identity of the current session, assigned by the token.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub actor: i64,
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
    pub is_read_only: bool,
}

impl SessionInfo {
    pub fn from_token(token: &AuthToken) -> Self {
        SessionInfo {
            actor: token.actor,
            user_id: token.user_id.clone(),
            user_info: token.user_info.clone(),
            is_read_only: token.is_read_only(),
        }
    }
}

/// The connection, as a tagged variant. The client is self-aware (knows
/// its own actor) iff the state is `Connecting` or `Open`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Connection {
    #[default]
    Closed,
    Authenticating,
    Connecting(SessionInfo),
    Open(SessionInfo),
    Unavailable,
    Failed,
}

impl Connection {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Connection::Closed => ConnectionStatus::Closed,
            Connection::Authenticating => ConnectionStatus::Authenticating,
            Connection::Connecting(_) => ConnectionStatus::Connecting,
            Connection::Open(_) => ConnectionStatus::Open,
            Connection::Unavailable => ConnectionStatus::Unavailable,
            Connection::Failed => ConnectionStatus::Failed,
        }
    }

    /// Session identity, when self-aware.
    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            Connection::Connecting(info) | Connection::Open(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Connection::Open(_))
    }
}

/// Derived connection status for the `connection` event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Authenticating,
    Connecting,
    Open,
    Unavailable,
    Failed,
}
