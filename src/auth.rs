//! Authentication against the token endpoint.
//!
//! Three modes are recognized:
//! - public: POST `{room, publicApiKey}` to the configured URL
//! - private: POST `{room}` to the configured URL, cookies included
//! - custom: invoke a host-supplied callback directly
//!
//! All modes yield `{token}` or fail with an authentication error, which
//! the connection machine surfaces on the `error` channel before retrying
//! per the backoff schedule.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::RoomError;
use crate::token::AuthToken;

/// Host-supplied auth callback: `room id -> raw token`.
pub type CustomAuthFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, RoomError>> + Send>>
        + Send
        + Sync,
>;

/// Where tokens come from.
#[derive(Clone)]
pub enum AuthEndpoint {
    Public { url: String, public_api_key: String },
    Private { url: String },
    Custom(CustomAuthFn),
}

impl fmt::Debug for AuthEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthEndpoint::Public { url, .. } => f.debug_struct("Public").field("url", url).finish(),
            AuthEndpoint::Private { url } => f.debug_struct("Private").field("url", url).finish(),
            AuthEndpoint::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Performs the token exchange for one room.
pub struct Authenticator {
    client: reqwest::Client,
    endpoint: AuthEndpoint,
}

impl Authenticator {
    pub fn new(endpoint: AuthEndpoint) -> Self {
        // The private mode relies on ambient session cookies.
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .unwrap_or_default();
        Self { client, endpoint }
    }

    /// Fetch and parse a token for `room_id`.
    pub async fn authenticate(&self, room_id: &str) -> Result<AuthToken, RoomError> {
        let raw = match &self.endpoint {
            AuthEndpoint::Public {
                url,
                public_api_key,
            } => {
                self.fetch_token(url, json!({ "room": room_id, "publicApiKey": public_api_key }))
                    .await?
            }
            AuthEndpoint::Private { url } => {
                self.fetch_token(url, json!({ "room": room_id })).await?
            }
            AuthEndpoint::Custom(f) => f(room_id.to_string()).await?,
        };
        AuthToken::parse(&raw)
    }

    async fn fetch_token(&self, url: &str, body: Value) -> Result<String, RoomError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RoomError::Authentication(format!("auth request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RoomError::Authentication(format!(
                "auth endpoint returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RoomError::Authentication(format!("auth response is not JSON: {e}")))?;
        body.get("token")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| RoomError::Authentication("auth response has no token field".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_endpoint(token: &'static str) -> AuthEndpoint {
        AuthEndpoint::Custom(Arc::new(move |_room| {
            Box::pin(async move { Ok(token.to_string()) })
        }))
    }

    #[tokio::test]
    async fn test_custom_mode_parses_returned_token() {
        use serde_json::json;
        let raw = crate::token::tests::fake_token(json!({
            "actor": 4,
            "scopes": ["room:write"],
            "exp": 4_000_000_000u64,
            "iat": 1u64,
        }));
        let raw_static: &'static str = Box::leak(raw.into_boxed_str());
        let auth = Authenticator::new(custom_endpoint(raw_static));
        let token = auth.authenticate("my-room").await.unwrap();
        assert_eq!(token.actor, 4);
    }

    #[tokio::test]
    async fn test_custom_mode_propagates_errors() {
        let auth = Authenticator::new(AuthEndpoint::Custom(Arc::new(|_room| {
            Box::pin(async { Err(RoomError::Authentication("denied".into())) })
        })));
        let err = auth.authenticate("my-room").await.unwrap_err();
        assert_eq!(err, RoomError::Authentication("denied".into()));
    }

    #[tokio::test]
    async fn test_custom_mode_rejects_garbage_token() {
        let auth = Authenticator::new(custom_endpoint("not-a-token"));
        assert!(auth.authenticate("my-room").await.is_err());
    }

    #[test]
    fn test_endpoint_debug_hides_key() {
        let ep = AuthEndpoint::Public {
            url: "https://example.test/auth".into(),
            public_api_key: "pk_secret".into(),
        };
        let shown = format!("{ep:?}");
        assert!(shown.contains("example.test"));
        assert!(!shown.contains("pk_secret"));
    }
}
