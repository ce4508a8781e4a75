//! Error kinds surfaced by the room runtime.
//!
//! Errors in inbound handlers never tear down the dispatcher: each branch
//! catches locally and at most logs. Subscribers to the `error` channel
//! receive every surfaced error.

use thiserror::Error;

/// All errors produced by the room core and its collaborators.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoomError {
    /// The auth endpoint returned non-2xx, non-JSON, or a malformed body.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server closed the channel with a rejection code in [4000, 4100].
    #[error("room connection rejected (code {code}): {reason}")]
    Rejected { code: u16, reason: String },

    /// A caller broke a structural rule (undo during a batch, storage state
    /// without a locatable root). Thrown synchronously, never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A storage mutation was attempted while the session is read-only.
    #[error("storage mutations are not allowed: session is read-only")]
    WriteDenied,

    /// The server refused previously sent storage ops. The replica keeps its
    /// local view; divergence is accepted rather than repaired.
    #[error("server rejected storage ops {op_ids:?}: {reason}")]
    StorageMutationRejected { op_ids: Vec<String>, reason: String },

    /// Message channel failure outside the close-code tables.
    #[error("transport error: {0}")]
    Transport(String),
}
