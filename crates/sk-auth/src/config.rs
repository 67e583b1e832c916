use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::Result;

/// Identity service and provider endpoint paths
pub mod endpoints {
    pub const ACCESS_EXCHANGE: &str = "exchange-refresh-token-for-access-token";
    pub const REFRESH_EXCHANGE: &str = "exchange-refresh-token-for-refresh-token";
    pub const PROVIDER_REFRESH_TOKENS: &str = "provider-refresh-tokens";
    pub const PROVIDERS: &str = "providers";
    pub const SERIES: &str = "series";
    pub const CONTENT_TOKEN: &str = "content-token";
}

pub const DEFAULT_IDENTITY_URL: &str = "https://id.storykeep.app/";

/// Tokens are treated as expired this long before their `exp` claim
pub const TOKEN_EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// Period of the background refresh timer
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTimeouts {
    pub connect_secs: u64,
    pub request_secs: u64,
}

impl HttpTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: 15,
            request_secs: 30,
        }
    }
}

/// Configuration for the credential core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the identity service
    pub identity_url: Url,

    /// Per-provider token endpoint bases; providers not listed here are
    /// served by `{identity_url}/providers/{id}/`
    pub provider_urls: HashMap<String, Url>,

    /// Safety margin subtracted from every `exp` claim, in seconds
    pub expiry_buffer_secs: u64,

    /// Background refresh period, in milliseconds; 0 selects the default
    pub refresh_interval_ms: u64,

    pub http_timeouts: HttpTimeouts,

    pub user_agent: Option<String>,
}

impl AuthConfig {
    pub fn new(identity_url: Url) -> Self {
        Self {
            identity_url: with_trailing_slash(identity_url),
            ..Self::default()
        }
    }

    pub fn parse(identity_url: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(identity_url)?))
    }

    pub fn with_provider_url(mut self, provider_id: impl Into<String>, url: Url) -> Self {
        self.provider_urls
            .insert(provider_id.into(), with_trailing_slash(url));
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer_secs = buffer.as_secs();
        self
    }

    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_secs(self.expiry_buffer_secs)
    }

    /// The timer period; never zero
    pub fn refresh_interval(&self) -> Duration {
        match self.refresh_interval_ms {
            0 => REFRESH_INTERVAL,
            ms => Duration::from_millis(ms),
        }
    }

    /// Identity service base, always ending in `/` so endpoints join below it
    pub fn identity_base(&self) -> Url {
        with_trailing_slash(self.identity_url.clone())
    }

    /// Base URL for a provider's token endpoints, always ending in `/`
    pub fn provider_base(&self, provider_id: &str) -> Result<Url> {
        if let Some(url) = self.provider_urls.get(provider_id) {
            return Ok(with_trailing_slash(url.clone()));
        }

        let mut url = self.identity_base().join(&format!("{}/", endpoints::PROVIDERS))?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push(provider_id)
            .push("");
        Ok(url)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_url: Url::parse(DEFAULT_IDENTITY_URL).expect("valid identity URL"),
            provider_urls: HashMap::new(),
            expiry_buffer_secs: TOKEN_EXPIRY_BUFFER.as_secs(),
            refresh_interval_ms: REFRESH_INTERVAL.as_millis() as u64,
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("storykeep".to_string()),
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
