use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use crate::config::{AuthConfig, endpoints};
use crate::errors::{Result, SkAuthError};
use crate::models::*;

/// HTTP client for the identity service and provider token endpoints
#[derive(Debug, Clone)]
pub struct IdentityClient {
    config: AuthConfig,
    http: Client,
}

impl IdentityClient {
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect())
            .timeout(config.http_timeouts.request())
            .user_agent(config.user_agent.as_deref().unwrap_or("storykeep"))
            .build()?;

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn identity_url(&self, path: &str) -> Result<Url> {
        Ok(self.config.identity_base().join(path)?)
    }

    fn provider_url(&self, provider_id: &str, path: &str) -> Result<Url> {
        Ok(self.config.provider_base(provider_id)?.join(path)?)
    }

    /// Map non-2xx responses to errors, then decode the JSON body
    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();

            if body.contains("invalid_grant") {
                return Err(SkAuthError::InvalidGrant);
            }

            return Err(SkAuthError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        Ok(response.json().await?)
    }

    async fn post_token<T: DeserializeOwned>(&self, url: Url, token: &str) -> Result<T> {
        let response = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .json(&TokenRequest { token })
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Exchange the session refresh token for a new access token
    #[instrument(skip(self, refresh_token))]
    pub async fn exchange_for_access_token(&self, refresh_token: &str) -> Result<String> {
        debug!("Requesting session access token");
        let url = self.identity_url(endpoints::ACCESS_EXCHANGE)?;
        let body: AccessTokenResponse = self.post_token(url, refresh_token).await?;
        Ok(body.access_token)
    }

    /// Rotate the session refresh token
    #[instrument(skip(self, refresh_token))]
    pub async fn exchange_for_refresh_token(&self, refresh_token: &str) -> Result<String> {
        debug!("Rotating session refresh token");
        let url = self.identity_url(endpoints::REFRESH_EXCHANGE)?;
        let body: RefreshTokenResponse = self.post_token(url, refresh_token).await?;
        Ok(body.refresh_token)
    }

    #[instrument(skip(self, refresh_token))]
    pub async fn exchange_provider_access_token(
        &self,
        provider_id: &str,
        refresh_token: &str,
    ) -> Result<String> {
        debug!("Requesting provider access token");
        let url = self.provider_url(provider_id, endpoints::ACCESS_EXCHANGE)?;
        let body: AccessTokenResponse = self.post_token(url, refresh_token).await?;
        Ok(body.access_token)
    }

    #[instrument(skip(self, refresh_token))]
    pub async fn exchange_provider_refresh_token(
        &self,
        provider_id: &str,
        refresh_token: &str,
    ) -> Result<String> {
        debug!("Rotating provider refresh token");
        let url = self.provider_url(provider_id, endpoints::REFRESH_EXCHANGE)?;
        let body: RefreshTokenResponse = self.post_token(url, refresh_token).await?;
        Ok(body.refresh_token)
    }

    /// Issue a content token scoped to one series
    #[instrument(skip(self, provider_access_token))]
    pub async fn issue_content_token(
        &self,
        provider_id: &str,
        series_id: &str,
        provider_access_token: &str,
    ) -> Result<String> {
        debug!("Requesting content token");
        let mut url = self.config.provider_base(provider_id)?;
        url.path_segments_mut()
            .map_err(|_| SkAuthError::InvalidResponse("provider URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push(endpoints::SERIES)
            .push(series_id)
            .push(endpoints::CONTENT_TOKEN);
        let body: ContentTokenResponse = self.post_token(url, provider_access_token).await?;
        Ok(body.content_token)
    }

    /// List every provider refresh token the session is entitled to
    #[instrument(skip(self, session_access_token))]
    pub async fn fetch_provider_refresh_tokens(
        &self,
        session_access_token: &str,
    ) -> Result<Vec<String>> {
        debug!("Fetching provider refresh tokens");
        let url = self.identity_url(endpoints::PROVIDER_REFRESH_TOKENS)?;
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .bearer_auth(session_access_token)
            .send()
            .await?;
        let body: ProviderRefreshTokensResponse = Self::parse(response).await?;
        Ok(body.refresh_tokens)
    }
}
