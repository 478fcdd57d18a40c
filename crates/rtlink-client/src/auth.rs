//! Authentication parameter sources.
//!
//! The token engine itself is an external collaborator; the connection
//! subsystem only needs fresh URL query parameters at transport-open time.
//! Implementations must be async-safe: a provider backed by a token mint or
//! HTTP endpoint does its blocking work off the connection task, which only
//! awaits the result.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::options::ClientOptions;

/// Capability yielding fresh handshake credentials on demand.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Query parameters identifying this client to the endpoint, fetched
    /// fresh for every transport open.
    async fn auth_params(&self) -> Result<Vec<(String, String)>>;
}

/// Direct api-key authentication (`key` option).
pub struct KeyAuth {
    key: String,
}

#[async_trait]
impl AuthProvider for KeyAuth {
    async fn auth_params(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("key".to_owned(), self.key.clone())])
    }
}

/// Literal token authentication (`token` option).
pub struct TokenAuth {
    token: String,
}

#[async_trait]
impl AuthProvider for TokenAuth {
    async fn auth_params(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("access_token".to_owned(), self.token.clone())])
    }
}

/// Resolve the provider for validated options.
pub fn provider_from_options(opts: &ClientOptions) -> Result<Arc<dyn AuthProvider>> {
    if let Some(provider) = &opts.auth_provider {
        return Ok(Arc::clone(provider));
    }
    if let Some(key) = &opts.key {
        return Ok(Arc::new(KeyAuth { key: key.clone() }));
    }
    if let Some(token) = &opts.token {
        return Ok(Arc::new(TokenAuth {
            token: token.clone(),
        }));
    }
    Err(Error::InvalidArgument(
        "no authentication source configured".to_owned(),
    ))
}
