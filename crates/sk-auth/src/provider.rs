use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::client::IdentityClient;
use crate::codec;
use crate::errors::{Result, SkAuthError};
use crate::events::{AuthEvent, EventBus};
use crate::guard::{RefreshGuard, RefreshKey};
use crate::session::SessionTokenManager;
use crate::store::{TokenStore, meta_keys};
use crate::token::{Token, TokenKey, TokenKind, TokenState};

/// A hosting provider the user has linked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConnection {
    pub provider_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Outcome of [`ProviderTokenManager::fetch_all_provider_tokens`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Providers whose refresh token was stored
    pub connected: Vec<String>,
    /// Providers for which an access token was also obtained
    pub primed: Vec<String>,
    pub failures: Vec<ReconcileFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    /// None when the token carried no issuer
    pub provider_id: Option<String>,
    pub reason: String,
}

/// Owns one OAuth refresh/access pair per connected hosting provider
#[derive(Debug, Clone)]
pub struct ProviderTokenManager {
    store: TokenStore,
    client: IdentityClient,
    guard: RefreshGuard,
    session: SessionTokenManager,
    events: EventBus,
    /// Serializes read-modify-write of the connected set
    connections: Arc<Mutex<()>>,
}

impl ProviderTokenManager {
    pub fn new(
        store: TokenStore,
        client: IdentityClient,
        guard: RefreshGuard,
        session: SessionTokenManager,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            client,
            guard,
            session,
            events,
            connections: Arc::new(Mutex::new(())),
        }
    }

    fn buffer(&self) -> Duration {
        self.store.expiry_buffer()
    }

    async fn state(&self, key: &TokenKey) -> TokenState {
        TokenState::classify_now(self.store.get_token(key).await, self.buffer())
    }

    /// Connected providers, read synchronously from the metadata cache
    pub fn connected_providers(&self) -> Vec<ProviderConnection> {
        let Some(raw) = self.store.metadata(meta_keys::CONNECTED_PROVIDERS) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Ignoring unreadable connected-provider list: {}", e);
            Vec::new()
        })
    }

    pub fn is_connected(&self, provider_id: &str) -> bool {
        self.connected_providers()
            .iter()
            .any(|c| c.provider_id == provider_id)
    }

    async fn write_connections(&self, connections: &[ProviderConnection]) -> bool {
        match serde_json::to_string(connections) {
            Ok(json) => {
                self.store
                    .set_metadata(meta_keys::CONNECTED_PROVIDERS, &json)
                    .await
            }
            Err(e) => {
                warn!("Could not serialize connected providers: {}", e);
                false
            }
        }
    }

    /// Returns true if `provider_id` is in the set afterwards
    async fn add_connection(&self, provider_id: &str) -> bool {
        let _lock = self.connections.lock().await;
        let mut connections = self.connected_providers();
        if connections.iter().any(|c| c.provider_id == provider_id) {
            return true;
        }
        connections.push(ProviderConnection {
            provider_id: provider_id.to_string(),
            connected_at: Utc::now(),
        });
        self.write_connections(&connections).await
    }

    async fn remove_connection(&self, provider_id: &str) -> bool {
        let _lock = self.connections.lock().await;
        let mut connections = self.connected_providers();
        let before = connections.len();
        connections.retain(|c| c.provider_id != provider_id);
        if connections.len() == before {
            return true;
        }
        self.write_connections(&connections).await
    }

    /// Store the refresh token and add the provider to the connected set.
    ///
    /// If the set cannot be updated the refresh token is deleted again so
    /// the two never disagree.
    async fn persist_connection(&self, provider_id: &str, refresh_token: &str) -> Result<()> {
        let token = Token::new(TokenKey::provider_refresh(provider_id), refresh_token);
        if !self.store.set_token(&token).await {
            return Err(SkAuthError::StorageUnavailable(format!(
                "could not persist refresh token for {}",
                provider_id
            )));
        }

        if !self.add_connection(provider_id).await {
            self.store
                .delete_tokens(&[TokenKey::provider_refresh(provider_id)])
                .await;
            return Err(SkAuthError::StorageUnavailable(format!(
                "could not record {} as connected",
                provider_id
            )));
        }

        Ok(())
    }

    /// Link a provider after a successful OAuth callback
    #[instrument(skip(self, refresh_token))]
    pub async fn connect_provider(&self, provider_id: &str, refresh_token: &str) -> Result<()> {
        let result = self.persist_connection(provider_id, refresh_token).await;

        match &result {
            Ok(()) => info!("Connected provider {}", provider_id),
            Err(e) => warn!("Failed to connect provider {}: {}", provider_id, e),
        }
        self.events.emit(AuthEvent::ProviderConnected {
            provider_id: provider_id.to_string(),
            success: result.is_ok(),
        });

        result
    }

    /// Delete both provider tokens and drop the provider from the connected set.
    ///
    /// Waits for any in-flight exchange for this provider, so nothing it
    /// issues can land after the tokens are gone.
    #[instrument(skip(self))]
    pub async fn disconnect_provider(&self, provider_id: &str) -> bool {
        let _guard = self
            .guard
            .acquire(RefreshKey::Provider(provider_id.to_string()))
            .await;
        self.disconnect_locked(provider_id).await
    }

    /// Caller holds the provider lock
    async fn disconnect_locked(&self, provider_id: &str) -> bool {
        let deleted = self
            .store
            .delete_tokens(&[
                TokenKey::provider_access(provider_id),
                TokenKey::provider_refresh(provider_id),
            ])
            .await;
        let removed = self.remove_connection(provider_id).await;

        info!("Disconnected provider {}", provider_id);
        deleted && removed
    }

    pub async fn disconnect_all(&self) -> usize {
        let connections = self.connected_providers();
        for connection in &connections {
            self.disconnect_provider(&connection.provider_id).await;
        }
        connections.len()
    }

    /// Drop connected-set entries that have no usable refresh token
    pub async fn reconcile_connections(&self) -> usize {
        let mut dropped = 0;
        for connection in self.connected_providers() {
            let id = &connection.provider_id;
            if !self.state(&TokenKey::provider_refresh(id)).await.is_valid() {
                debug!("Provider {} has no usable refresh token", id);
                self.disconnect_provider(id).await;
                dropped += 1;
            }
        }
        dropped
    }

    pub async fn provider_refresh_token(&self, provider_id: &str) -> Option<Token> {
        self.state(&TokenKey::provider_refresh(provider_id))
            .await
            .valid()
    }

    /// A usable provider access token, derived from the provider refresh
    /// token when needed. None without any network call if the provider is
    /// not connected.
    pub async fn provider_access_token(&self, provider_id: &str) -> Option<Token> {
        let key = TokenKey::provider_access(provider_id);
        if let TokenState::Valid(token) = self.state(&key).await {
            return Some(token);
        }

        let result = self
            .guard
            .share(key.clone(), || async {
                if let TokenState::Valid(token) = self.state(&key).await {
                    return Ok(token);
                }
                self.derive_access_token(provider_id).await
            })
            .await;

        match result {
            Ok(token) => Some(token),
            Err(SkAuthError::MissingRefreshToken(_)) => None,
            Err(e) => {
                warn!("Could not derive access token for {}: {}", provider_id, e);
                None
            }
        }
    }

    /// Force a provider access-token exchange. Callers arriving while one
    /// is in flight receive its result.
    pub async fn refresh_provider_access_token(&self, provider_id: &str) -> Result<Token> {
        self.guard
            .share(TokenKey::provider_access(provider_id), || {
                self.derive_access_token(provider_id)
            })
            .await
    }

    /// Rotate a provider's refresh token
    #[instrument(skip(self))]
    pub async fn refresh_provider_refresh_token(&self, provider_id: &str) -> Result<Token> {
        self.guard
            .share(TokenKey::provider_refresh(provider_id), || {
                self.rotate_refresh_token(provider_id)
            })
            .await
    }

    /// ProviderRefresh -> ProviderRefresh. Runs under the provider lock.
    async fn rotate_refresh_token(&self, provider_id: &str) -> Result<Token> {
        let current = self.usable_refresh_token(provider_id).await?;
        let value = self
            .client
            .exchange_provider_refresh_token(provider_id, current.value())
            .await?;

        let token = Token::new(TokenKey::provider_refresh(provider_id), value);
        if !self.store.set_token(&token).await {
            return Err(SkAuthError::StorageUnavailable(format!(
                "could not persist rotated refresh token for {}",
                provider_id
            )));
        }
        Ok(token)
    }

    /// The provider refresh token, healing the connected set if it is gone.
    ///
    /// Absent: the provider is dropped from the connected set. Expired: the
    /// provider is disconnected outright.
    async fn usable_refresh_token(&self, provider_id: &str) -> Result<Token> {
        match self.state(&TokenKey::provider_refresh(provider_id)).await {
            TokenState::Valid(token) => Ok(token),
            TokenState::Expired(_) => {
                info!("Refresh token for {} expired; disconnecting", provider_id);
                self.disconnect_locked(provider_id).await;
                Err(SkAuthError::MissingRefreshToken(TokenKind::ProviderRefresh))
            }
            TokenState::Absent => {
                if self.is_connected(provider_id) {
                    self.remove_connection(provider_id).await;
                }
                Err(SkAuthError::MissingRefreshToken(TokenKind::ProviderRefresh))
            }
        }
    }

    /// ProviderRefresh -> ProviderAccess. Runs under the provider lock.
    async fn derive_access_token(&self, provider_id: &str) -> Result<Token> {
        let refresh = self.usable_refresh_token(provider_id).await?;

        let value = self
            .client
            .exchange_provider_access_token(provider_id, refresh.value())
            .await?;
        let token = Token::new(TokenKey::provider_access(provider_id), value);
        if !self.store.set_token(&token).await {
            return Err(SkAuthError::InvalidResponse(format!(
                "issued access token for {} could not be stored",
                provider_id
            )));
        }

        debug!("Provider access token refreshed for {}", provider_id);
        Ok(token)
    }

    /// Ensure a valid access token for every connected provider; returns
    /// how many have one afterwards
    pub async fn refresh_connected(&self) -> usize {
        let mut ready = 0;
        for connection in self.connected_providers() {
            if self
                .provider_access_token(&connection.provider_id)
                .await
                .is_some()
            {
                ready += 1;
            }
        }
        ready
    }

    /// Pull every provider refresh token the session is entitled to, store
    /// each under the provider named by its `iss` claim, and prime an access
    /// token for it.
    ///
    /// Best-effort: a failing provider is recorded in the report and the
    /// batch continues.
    #[instrument(skip(self))]
    pub async fn fetch_all_provider_tokens(&self) -> Result<ReconcileReport> {
        let access = self
            .session
            .access_token()
            .await
            .ok_or(SkAuthError::SessionUnavailable)?;
        let refresh_tokens = self
            .client
            .fetch_provider_refresh_tokens(access.value())
            .await?;

        let mut report = ReconcileReport::default();
        for refresh_token in refresh_tokens {
            let Some(provider_id) = codec::issuer(&refresh_token) else {
                warn!("Skipping provider refresh token without an issuer");
                report.failures.push(ReconcileFailure {
                    provider_id: None,
                    reason: "token has no issuer claim".to_string(),
                });
                continue;
            };

            if codec::is_expired(&refresh_token, Utc::now().timestamp(), self.buffer()) {
                warn!("Skipping expired refresh token for {}", provider_id);
                report.failures.push(ReconcileFailure {
                    provider_id: Some(provider_id),
                    reason: "refresh token is expired".to_string(),
                });
                continue;
            }

            let newly_connected = !self.is_connected(&provider_id);
            if let Err(e) = self.persist_connection(&provider_id, &refresh_token).await {
                warn!("Could not store refresh token for {}: {}", provider_id, e);
                report.failures.push(ReconcileFailure {
                    provider_id: Some(provider_id),
                    reason: e.to_string(),
                });
                continue;
            }
            if newly_connected {
                self.events.emit(AuthEvent::ProviderConnected {
                    provider_id: provider_id.clone(),
                    success: true,
                });
            }
            report.connected.push(provider_id.clone());

            match self.refresh_provider_access_token(&provider_id).await {
                Ok(_) => report.primed.push(provider_id),
                Err(e) => {
                    warn!("Could not prime access token for {}: {}", provider_id, e);
                    report.failures.push(ReconcileFailure {
                        provider_id: Some(provider_id),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Provider reconciliation: {} connected, {} primed, {} failed",
            report.connected.len(),
            report.primed.len(),
            report.failures.len()
        );
        Ok(report)
    }
}
