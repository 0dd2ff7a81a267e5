//! Slack Web API client for outbound message delivery and OAuth token refresh.
//!
//! This crate wraps the two Slack endpoints the dispatch service needs:
//! - `chat.postMessage`: send a text message to a channel
//! - `oauth.v2.access`: exchange a refresh token for a new access token

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";

#[derive(Debug, thiserror::Error)]
pub enum SlackApiError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Slack responded with `ok: false`; the payload is the provider's error
    /// code (e.g. `channel_not_found`, `invalid_auth`).
    #[error("{0}")]
    Api(String),
    #[error("malformed slack response: {0}")]
    Malformed(&'static str),
}

impl SlackApiError {
    /// Whether a failed call may succeed if attempted again. Transport errors
    /// and provider rate limiting are retryable; provider error codes such as
    /// `channel_not_found` are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SlackApiError::Http(_) => true,
            SlackApiError::Api(code) => code == "ratelimited" || code == "rate_limited",
            SlackApiError::Malformed(_) => false,
        }
    }
}

/// A message accepted by Slack, identified by its channel and timestamp id.
#[derive(Debug, Clone)]
pub struct PostedMessage {
    pub ts: String,
    pub channel: String,
}

/// The result of a successful refresh-token exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Rotated refresh token, when the provider issues one.
    pub refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds, when the provider
    /// reports one.
    pub expires_in: Option<i64>,
}

/// Blocking client for the Slack Web API.
#[derive(Debug, Clone)]
pub struct SlackClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl Default for SlackClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at an alternate API root (used by tests).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::blocking::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// Post a text message to a channel on behalf of `token`.
    pub fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
    ) -> Result<PostedMessage, SlackApiError> {
        let request = PostMessageRequest { channel, text };
        let response: PostMessageResponse = self
            .http
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(token)
            .json(&request)
            .send()?
            .json()?;

        if !response.ok {
            return Err(SlackApiError::Api(
                response.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        let ts = response
            .ts
            .ok_or(SlackApiError::Malformed("chat.postMessage reply has no ts"))?;
        Ok(PostedMessage {
            ts,
            channel: response.channel.unwrap_or_else(|| channel.to_string()),
        })
    }

    /// Exchange a refresh token for a fresh access token via `oauth.v2.access`.
    pub fn refresh_access_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenGrant, SlackApiError> {
        let response: OauthAccessResponse = self
            .http
            .post(self.api_url("oauth.v2.access"))
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()?
            .json()?;

        if !response.ok {
            return Err(SlackApiError::Api(
                response.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        let access_token = response
            .access_token
            .ok_or(SlackApiError::Malformed("oauth.v2.access reply has no access_token"))?;
        Ok(TokenGrant {
            access_token,
            refresh_token: response.refresh_token,
            expires_in: response.expires_in,
        })
    }
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    error: Option<String>,
    ts: Option<String>,
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OauthAccessResponse {
    ok: bool,
    error: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> SlackClient {
        SlackClient::with_base_url(server.url())
    }

    #[test]
    fn post_message_returns_ts_on_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/chat.postMessage")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"channel":"C1","ts":"1700000000.000100"}"#)
            .create();

        let posted = client_for(&server)
            .post_message("xoxe-token", "C1", "hi")
            .expect("post message");

        assert_eq!(posted.ts, "1700000000.000100");
        assert_eq!(posted.channel, "C1");
        mock.assert();
    }

    #[test]
    fn post_message_surfaces_provider_error_code() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/chat.postMessage")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":false,"error":"channel_not_found"}"#)
            .create();

        let err = client_for(&server)
            .post_message("xoxe-token", "CMISSING", "hi")
            .expect_err("should fail");

        assert_eq!(err.to_string(), "channel_not_found");
        assert!(!err.is_retryable());
    }

    #[test]
    fn rate_limited_errors_are_retryable() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/chat.postMessage")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":false,"error":"ratelimited"}"#)
            .create();

        let err = client_for(&server)
            .post_message("xoxe-token", "C1", "hi")
            .expect_err("should fail");

        assert!(err.is_retryable());
    }

    #[test]
    fn post_message_without_ts_is_malformed() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/chat.postMessage")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"channel":"C1"}"#)
            .create();

        let err = client_for(&server)
            .post_message("xoxe-token", "C1", "hi")
            .expect_err("should fail");

        assert!(matches!(err, SlackApiError::Malformed(_)));
    }

    #[test]
    fn refresh_returns_grant_on_success() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/oauth.v2.access")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"ok":true,"access_token":"xoxe-new","refresh_token":"xoxe-1-rotated","expires_in":43200}"#,
            )
            .create();

        let grant = client_for(&server)
            .refresh_access_token("client-id", "client-secret", "xoxe-1-old")
            .expect("refresh");

        assert_eq!(grant.access_token, "xoxe-new");
        assert_eq!(grant.refresh_token.as_deref(), Some("xoxe-1-rotated"));
        assert_eq!(grant.expires_in, Some(43200));
        mock.assert();
    }

    #[test]
    fn refresh_rejection_surfaces_error_code() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/oauth.v2.access")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":false,"error":"invalid_refresh_token"}"#)
            .create();

        let err = client_for(&server)
            .refresh_access_token("client-id", "client-secret", "xoxe-1-stale")
            .expect_err("should fail");

        assert_eq!(err.to_string(), "invalid_refresh_token");
    }

    #[test]
    fn grant_without_rotation_keeps_refresh_token_absent() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/oauth.v2.access")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true,"access_token":"xoxe-new"}"#)
            .create();

        let grant = client_for(&server)
            .refresh_access_token("client-id", "client-secret", "xoxe-1-old")
            .expect("refresh");

        assert!(grant.refresh_token.is_none());
        assert!(grant.expires_in.is_none());
    }
}
