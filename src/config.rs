//! Room configuration.

use std::time::Duration;

use crate::auth::AuthEndpoint;
use crate::events::{passthrough_hook, BatchUpdatesHook};
use crate::protocol::JsonMap;

/// Smallest accepted flush throttle.
pub const MIN_THROTTLE: Duration = Duration::from_millis(16);
/// Largest accepted flush throttle.
pub const MAX_THROTTLE: Duration = Duration::from_millis(1000);
/// Default flush throttle.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);

/// Configuration for one room instance.
#[derive(Clone)]
pub struct RoomConfig {
    /// Room identifier sent to the auth endpoint.
    pub room_id: String,
    /// Base URL of the coordination server, e.g. `wss://rooms.example.io`.
    pub server: String,
    /// Where tokens come from.
    pub auth: AuthEndpoint,
    /// Minimum interval between outbound frames. Clamped to
    /// [`MIN_THROTTLE`, `MAX_THROTTLE`].
    pub throttle: Duration,
    /// Presence the local user starts with.
    pub initial_presence: JsonMap,
    /// Root defaults: any key missing at the root after (re)loading
    /// initial storage is set to the given plain-JSON value.
    pub initial_storage: JsonMap,
    /// Host hook wrapping grouped notification dispatch.
    pub batch_updates: BatchUpdatesHook,
}

impl RoomConfig {
    pub fn new(room_id: impl Into<String>, server: impl Into<String>, auth: AuthEndpoint) -> Self {
        RoomConfig {
            room_id: room_id.into(),
            server: server.into(),
            auth,
            throttle: DEFAULT_THROTTLE,
            initial_presence: JsonMap::new(),
            initial_storage: JsonMap::new(),
            batch_updates: passthrough_hook(),
        }
    }

    /// The effective throttle after clamping.
    pub fn effective_throttle(&self) -> Duration {
        self.throttle.clamp(MIN_THROTTLE, MAX_THROTTLE)
    }

    /// Channel URL for a given raw token.
    pub fn channel_url(&self, raw_token: &str) -> String {
        format!(
            "{}/?token={}&version={}",
            self.server,
            raw_token,
            env!("CARGO_PKG_VERSION")
        )
    }
}

impl std::fmt::Debug for RoomConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomConfig")
            .field("room_id", &self.room_id)
            .field("server", &self.server)
            .field("auth", &self.auth)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RoomConfig {
        RoomConfig::new(
            "my-room",
            "wss://rooms.example.io",
            AuthEndpoint::Private {
                url: "https://example.io/api/auth".into(),
            },
        )
    }

    #[test]
    fn test_throttle_clamped() {
        let mut cfg = config();
        assert_eq!(cfg.effective_throttle(), DEFAULT_THROTTLE);

        cfg.throttle = Duration::from_millis(1);
        assert_eq!(cfg.effective_throttle(), MIN_THROTTLE);

        cfg.throttle = Duration::from_secs(60);
        assert_eq!(cfg.effective_throttle(), MAX_THROTTLE);
    }

    #[test]
    fn test_channel_url() {
        let url = config().channel_url("tok123");
        assert!(url.starts_with("wss://rooms.example.io/?token=tok123&version="));
    }
}
