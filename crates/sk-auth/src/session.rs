use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::client::IdentityClient;
use crate::codec;
use crate::errors::{Result, SkAuthError};
use crate::guard::RefreshGuard;
use crate::store::{TokenStore, meta_keys};
use crate::token::{Token, TokenKey, TokenKind, TokenState};

/// Owns the application's own access/refresh token pair
#[derive(Debug, Clone)]
pub struct SessionTokenManager {
    store: TokenStore,
    client: IdentityClient,
    guard: RefreshGuard,
}

impl SessionTokenManager {
    pub fn new(store: TokenStore, client: IdentityClient, guard: RefreshGuard) -> Self {
        Self {
            store,
            client,
            guard,
        }
    }

    fn buffer(&self) -> Duration {
        self.store.expiry_buffer()
    }

    async fn state(&self, key: &TokenKey) -> TokenState {
        TokenState::classify_now(self.store.get_token(key).await, self.buffer())
    }

    /// Persist the pair returned by a login/OTP exchange
    #[instrument(skip_all)]
    pub async fn login(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let refresh = Token::new(TokenKey::session_refresh(), refresh_token);
        if !self.store.set_token(&refresh).await {
            return Err(SkAuthError::StorageUnavailable(
                "could not persist the session refresh token".to_string(),
            ));
        }

        let access = Token::new(TokenKey::session_access(), access_token);
        if !self.store.set_token(&access).await {
            warn!("Session access token was not stored; it will be re-derived on demand");
        }

        if let Some(user) = codec::subject(refresh_token).or_else(|| codec::subject(access_token)) {
            self.store.set_metadata(meta_keys::SESSION_USER, &user).await;
        }

        info!("Session established");
        Ok(())
    }

    /// Signed-in user id, read synchronously from the metadata cache
    pub fn user_id(&self) -> Option<String> {
        self.store.metadata(meta_keys::SESSION_USER)
    }

    /// The stored access token if it is still valid; never touches the network
    pub async fn cached_access_token(&self) -> Option<Token> {
        self.state(&TokenKey::session_access()).await.valid()
    }

    /// The stored refresh token if present and not expired
    pub async fn refresh_token(&self) -> Option<Token> {
        self.state(&TokenKey::session_refresh()).await.valid()
    }

    pub async fn has_refresh_token(&self) -> bool {
        self.refresh_token().await.is_some()
    }

    /// A usable access token, derived from the refresh token when needed.
    ///
    /// Concurrent callers share one exchange. Returns None when the refresh
    /// token is missing or expired, or when the exchange fails.
    pub async fn access_token(&self) -> Option<Token> {
        if let Some(token) = self.cached_access_token().await {
            return Some(token);
        }

        let result = self
            .guard
            .share(TokenKey::session_access(), || async {
                if let Some(token) = self.cached_access_token().await {
                    debug!("Access token was refreshed while waiting");
                    return Ok(token);
                }
                self.derive_access_token().await
            })
            .await;

        match result {
            Ok(token) => Some(token),
            Err(SkAuthError::MissingRefreshToken(_)) => None,
            Err(e) => {
                warn!("Could not derive session access token: {}", e);
                None
            }
        }
    }

    /// Force an access-token exchange. Callers arriving while one is in
    /// flight receive its result.
    pub async fn refresh_access_token(&self) -> Result<Token> {
        self.guard
            .share(TokenKey::session_access(), || self.derive_access_token())
            .await
    }

    /// Rotate the refresh token. Callers arriving while a rotation is in
    /// flight receive its result.
    #[instrument(skip(self))]
    pub async fn refresh_refresh_token(&self) -> Result<Token> {
        self.guard
            .share(TokenKey::session_refresh(), || self.rotate_refresh_token())
            .await
    }

    /// SessionRefresh -> SessionRefresh. Runs under the session lock.
    async fn rotate_refresh_token(&self) -> Result<Token> {
        let current = self
            .refresh_token()
            .await
            .ok_or(SkAuthError::MissingRefreshToken(TokenKind::SessionRefresh))?;

        let value = self.client.exchange_for_refresh_token(current.value()).await?;
        let token = Token::new(TokenKey::session_refresh(), value);
        if !self.store.set_token(&token).await {
            return Err(SkAuthError::StorageUnavailable(
                "could not persist the rotated refresh token".to_string(),
            ));
        }

        debug!("Session refresh token rotated");
        Ok(token)
    }

    /// SessionRefresh -> SessionAccess. Runs under the session lock.
    async fn derive_access_token(&self) -> Result<Token> {
        let refresh = self
            .refresh_token()
            .await
            .ok_or(SkAuthError::MissingRefreshToken(TokenKind::SessionRefresh))?;

        let value = self.client.exchange_for_access_token(refresh.value()).await?;
        let token = Token::new(TokenKey::session_access(), value);
        if !self.store.set_token(&token).await {
            return Err(SkAuthError::InvalidResponse(
                "issued access token could not be stored".to_string(),
            ));
        }

        debug!("Session access token refreshed");
        Ok(token)
    }

    /// Delete both session tokens and the session metadata
    pub async fn clear(&self) -> bool {
        let deleted = self
            .store
            .delete_tokens(&[TokenKey::session_access(), TokenKey::session_refresh()])
            .await;
        let cleared = self.store.delete_metadata(&[meta_keys::SESSION_USER]).await;
        deleted && cleared
    }
}
