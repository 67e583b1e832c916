use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::client::IdentityClient;
use crate::guard::{RefreshGuard, RefreshKey};
use crate::provider::ProviderTokenManager;
use crate::store::LocalCache;
use crate::token::{Scope, Token, TokenKey, TokenState};

/// Derives short-lived `(provider, series)` tokens for gated assets.
///
/// Content tokens live only in a process-local cache; they are cheap to
/// re-derive and are dropped on logout or when their provider disconnects.
#[derive(Debug, Clone)]
pub struct ContentTokenManager {
    providers: ProviderTokenManager,
    client: IdentityClient,
    guard: RefreshGuard,
    cache: Arc<LocalCache>,
    buffer: Duration,
}

impl ContentTokenManager {
    pub fn new(
        providers: ProviderTokenManager,
        client: IdentityClient,
        guard: RefreshGuard,
        buffer: Duration,
    ) -> Self {
        Self {
            providers,
            client,
            guard,
            cache: Arc::new(LocalCache::new()),
            buffer,
        }
    }

    fn cached(&self, key: &TokenKey) -> TokenState {
        let token = self
            .cache
            .get(&key.storage_key())
            .map(|value| Token::new(key.clone(), value));
        TokenState::classify_now(token, self.buffer)
    }

    /// A content token for `series_id`, or None if gated content is
    /// unavailable. Never fails loudly.
    pub async fn content_token(&self, provider_id: &str, series_id: &str) -> Option<Token> {
        let key = TokenKey::content(provider_id, series_id);

        if !self.providers.is_connected(provider_id) {
            self.flush_provider(provider_id);
            return None;
        }

        match self.cached(&key) {
            TokenState::Valid(token) => return Some(token),
            TokenState::Expired(_) => {
                self.cache.delete(&key.storage_key());
            }
            TokenState::Absent => {}
        }

        let _guard = self
            .guard
            .acquire(RefreshKey::Content {
                provider_id: provider_id.to_string(),
                series_id: series_id.to_string(),
            })
            .await;
        if let TokenState::Valid(token) = self.cached(&key) {
            return Some(token);
        }

        self.derive(key, provider_id, series_id).await
    }

    /// ProviderAccess -> Content
    async fn derive(&self, key: TokenKey, provider_id: &str, series_id: &str) -> Option<Token> {
        let access = self.providers.provider_access_token(provider_id).await?;

        let value = match self
            .client
            .issue_content_token(provider_id, series_id, access.value())
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Content token for {}/{} unavailable: {}",
                    provider_id, series_id, e
                );
                return None;
            }
        };

        let token = Token::new(key, value);
        if token.is_expired_now(self.buffer) {
            warn!(
                "Issued content token for {}/{} is already expired",
                provider_id, series_id
            );
            return None;
        }

        self.cache.set(&token.key().storage_key(), token.value());
        debug!("Cached content token for {}/{}", provider_id, series_id);
        Some(token)
    }

    pub fn flush(&self) {
        self.cache.clear();
    }

    /// Evict every cached content token of one provider
    pub fn flush_provider(&self, provider_id: &str) -> usize {
        self.cache.delete_prefix(&Scope::content_prefix(provider_id))
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
