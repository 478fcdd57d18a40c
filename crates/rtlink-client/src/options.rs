//! Client options and validation.
//!
//! Options are plain fields with defaults; [`ClientOptions::validate`] runs
//! once at construction and rejects inconsistent combinations.
//!
//! # Required fields
//! Exactly one authentication family: `key`, `token`, or `auth_provider`.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthProvider;
use crate::error::{Error, Result};
use rtlink_protocol::Format;

// ---------------------------------------------------------------------------
// ClientOptions
// ---------------------------------------------------------------------------

/// Configuration for a realtime connection.
#[derive(Clone)]
pub struct ClientOptions {
    /// API key (`name:secret`). Mutually exclusive with `token` and
    /// `auth_provider`.
    pub key: Option<String>,
    /// Literal access token. Mutually exclusive with `key` and
    /// `auth_provider`.
    pub token: Option<String>,
    /// Custom credential source. Mutually exclusive with `key` and `token`.
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    /// Optional client identity; the literal `"*"` is reserved.
    pub client_id: Option<String>,
    /// Named deployment. Routes to `{environment}-realtime.{domain}` and
    /// disables the default fallback pool.
    pub environment: Option<String>,
    /// Explicit endpoint override. Disables the default fallback pool.
    pub realtime_host: Option<String>,
    /// Explicit port override; defaults to 443 with TLS, 80 without.
    pub port: Option<u16>,
    pub tls: bool,
    /// Whether the server echoes this connection's own messages back.
    pub echo_messages: bool,
    /// One-shot cross-process recovery key, `"{key}:{serial}"`.
    pub recover: Option<String>,
    pub format: Format,
    /// Delay before the first reconnect attempt after a disconnect.
    pub disconnected_retry_timeout: Duration,
    /// Delay between reconnect attempts while suspended.
    pub suspended_retry_timeout: Duration,
    /// Consecutive failed attempts from Disconnected before escalating to
    /// Suspended.
    pub suspend_after_attempts: u32,
    /// Deadline for open and close handshakes.
    pub realtime_request_timeout: Duration,
    /// When false, `send` outside Connected fails instead of queueing.
    pub queue_messages: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            key: None,
            token: None,
            auth_provider: None,
            client_id: None,
            environment: None,
            realtime_host: None,
            port: None,
            tls: true,
            echo_messages: true,
            recover: None,
            format: Format::Json,
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            suspend_after_attempts: 3,
            realtime_request_timeout: Duration::from_secs(10),
            queue_messages: true,
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("key", &self.key.as_deref().map(|_| "<redacted>"))
            .field("token", &self.token.as_deref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("environment", &self.environment)
            .field("realtime_host", &self.realtime_host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("echo_messages", &self.echo_messages)
            .field("recover", &self.recover)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    pub fn with_key(key: &str) -> Self {
        ClientOptions {
            key: Some(key.to_owned()),
            ..ClientOptions::default()
        }
    }

    pub fn with_token(token: &str) -> Self {
        ClientOptions {
            token: Some(token.to_owned()),
            ..ClientOptions::default()
        }
    }

    /// Check option consistency.  Called once when the connection is built.
    pub fn validate(&self) -> Result<()> {
        let sources = [
            self.key.is_some(),
            self.token.is_some(),
            self.auth_provider.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if sources != 1 {
            return Err(Error::InvalidArgument(format!(
                "exactly one of key, token, auth_provider required (got {sources})"
            )));
        }
        if self.client_id.as_deref() == Some("*") {
            return Err(Error::InvalidArgument(
                "client_id must not be the wildcard \"*\"".to_owned(),
            ));
        }
        if let Some(recover) = &self.recover {
            RecoverInfo::parse(recover)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecoverInfo
// ---------------------------------------------------------------------------

/// Parsed `recover` option: `"{key}:{serial}"`.
///
/// Consumed at most once; the manager disables it after the first connect
/// that reaches Connected, Closed, or Failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverInfo {
    pub key: String,
    /// Opaque serial token; passed through to the `connection_serial`
    /// handshake parameter unchanged.
    pub serial: String,
}

impl RecoverInfo {
    /// Parse and validate a recovery key.
    ///
    /// Accepted shape: a non-empty `[A-Za-z0-9_-]+` key, a colon, and a
    /// non-empty `-?[A-Za-z0-9]+` serial.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::InvalidArgument(format!("malformed recover key: {s:?}"));
        let (key, serial) = s.split_once(':').ok_or_else(bad)?;
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(bad());
        }
        let digits = serial.strip_prefix('-').unwrap_or(serial);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(bad());
        }
        Ok(RecoverInfo {
            key: key.to_owned(),
            serial: serial.to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
