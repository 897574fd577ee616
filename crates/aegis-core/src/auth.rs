//! Credential access and serialized refresh.

use crate::config::StorageKeys;
use crate::error::{AegisError, Result};
use crate::locks::{with_lock, NamedLock};
use crate::storage::StorageArea;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the lock serializing credential refresh.
pub const REFRESH_LOCK: &str = "refresh-token";

/// External source of bearer credentials.
///
/// A successful `refresh_token` must make the new token observable
/// through `get_token`; the gate relies on that to hand waiting callers
/// the winner's result instead of refreshing again.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current valid token, if one exists.
    async fn get_token(&self) -> Result<Option<String>>;

    /// Obtain a fresh token, replacing the current one.
    async fn refresh_token(&self) -> Result<String>;
}

/// Fixed-token provider for tests and single-tenant deployments.
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self) -> Result<Option<String>> {
        Ok(Some(self.token.clone()))
    }

    async fn refresh_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Provider backed by the persisted central configuration.
///
/// Reads the `api_key` field of the stored configuration record, so a key
/// saved through a configuration update becomes usable without restarting.
/// "Refresh" here is a re-read; another writer may have rotated the key.
pub struct StorageCredentials {
    area: Arc<dyn StorageArea>,
}

impl StorageCredentials {
    pub fn new(area: Arc<dyn StorageArea>) -> Self {
        Self { area }
    }

    async fn read_key(&self) -> Result<Option<String>> {
        let stored = self
            .area
            .get(&[StorageKeys::CENTRAL_CONFIG.to_string()])
            .await?;
        let key = stored
            .get(StorageKeys::CENTRAL_CONFIG)
            .and_then(|record| record.get("api_key"))
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        Ok(key)
    }
}

#[async_trait]
impl CredentialProvider for StorageCredentials {
    async fn get_token(&self) -> Result<Option<String>> {
        self.read_key().await
    }

    async fn refresh_token(&self) -> Result<String> {
        self.read_key().await?.ok_or_else(|| AegisError::Auth {
            message: "no API key configured".to_string(),
        })
    }
}

/// Serializes credential refresh behind a named lock.
///
/// Concurrent callers that find no valid token all funnel through the
/// `refresh-token` lock; the first performs the refresh, the rest
/// re-check after the wait and reuse its result.
pub struct TokenGate {
    provider: Arc<dyn CredentialProvider>,
    locks: Arc<dyn NamedLock>,
}

impl TokenGate {
    pub fn new(provider: Arc<dyn CredentialProvider>, locks: Arc<dyn NamedLock>) -> Self {
        Self { provider, locks }
    }

    /// Current token without triggering a refresh.
    pub async fn current(&self) -> Result<Option<String>> {
        self.provider.get_token().await
    }

    /// Current token, refreshing under the gate if none is valid.
    pub async fn current_or_refresh(&self) -> Result<String> {
        if let Some(token) = self.provider.get_token().await? {
            return Ok(token);
        }

        let provider = Arc::clone(&self.provider);
        with_lock(&*self.locks, REFRESH_LOCK, async move {
            if let Some(token) = provider.get_token().await? {
                debug!("Token refreshed by a concurrent caller, reusing it");
                return Ok(token);
            }
            info!("Refreshing credential");
            provider.refresh_token().await
        })
        .await
    }
}
