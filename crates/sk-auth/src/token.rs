use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::codec;

/// The five token kinds of the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    SessionAccess,
    SessionRefresh,
    ProviderAccess,
    ProviderRefresh,
    Content,
}

impl TokenKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::SessionAccess | Self::ProviderAccess => "access",
            Self::SessionRefresh | Self::ProviderRefresh => "refresh",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionAccess => "session access",
            Self::SessionRefresh => "session refresh",
            Self::ProviderAccess => "provider access",
            Self::ProviderRefresh => "provider refresh",
            Self::Content => "content",
        };
        f.write_str(name)
    }
}

/// What a token is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Session,
    Provider(String),
    Content { provider_id: String, series_id: String },
}

/// Ids are form-urlencoded inside storage keys so that `/` and `:` stay
/// separators; plain alphanumeric ids are left as they are.
fn escape_id(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

impl Scope {
    /// Storage-key prefix shared by every content token of one provider
    pub fn content_prefix(provider_id: &str) -> String {
        format!("content/{}/", escape_id(provider_id))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Provider(id) => write!(f, "provider/{}", escape_id(id)),
            Self::Content {
                provider_id,
                series_id,
            } => write!(
                f,
                "{}{}",
                Self::content_prefix(provider_id),
                escape_id(series_id)
            ),
        }
    }
}

/// Logical identity of a stored token: one slot per `(kind, scope)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub kind: TokenKind,
    pub scope: Scope,
}

impl TokenKey {
    pub fn session_access() -> Self {
        Self {
            kind: TokenKind::SessionAccess,
            scope: Scope::Session,
        }
    }

    pub fn session_refresh() -> Self {
        Self {
            kind: TokenKind::SessionRefresh,
            scope: Scope::Session,
        }
    }

    pub fn provider_access(provider_id: &str) -> Self {
        Self {
            kind: TokenKind::ProviderAccess,
            scope: Scope::Provider(provider_id.to_string()),
        }
    }

    pub fn provider_refresh(provider_id: &str) -> Self {
        Self {
            kind: TokenKind::ProviderRefresh,
            scope: Scope::Provider(provider_id.to_string()),
        }
    }

    pub fn content(provider_id: &str, series_id: &str) -> Self {
        Self {
            kind: TokenKind::Content,
            scope: Scope::Content {
                provider_id: provider_id.to_string(),
                series_id: series_id.to_string(),
            },
        }
    }

    /// Storage key in the `"{scope}:{kind}"` scheme
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.scope, self.kind.suffix())
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A token value together with the slot it belongs to
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    key: TokenKey,
    value: String,
}

impl Token {
    pub fn new(key: TokenKey, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn key(&self) -> &TokenKey {
        &self.key
    }

    pub fn kind(&self) -> TokenKind {
        self.key.kind
    }

    pub fn scope(&self) -> &Scope {
        &self.key.scope
    }

    /// The raw token string (sensitive)
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn into_value(self) -> String {
        self.value
    }

    /// Seconds since the epoch, [`codec::EXPIRED`] if undecodable
    pub fn expires_at(&self) -> i64 {
        codec::expires_at(&self.value)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at(), 0).single()
    }

    pub fn is_expired(&self, now: i64, buffer: Duration) -> bool {
        codec::is_expired(&self.value, now, buffer)
    }

    pub fn is_expired_now(&self, buffer: Duration) -> bool {
        self.is_expired(Utc::now().timestamp(), buffer)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key.storage_key())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Classification of a token slot at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    Valid(Token),
    Expired(Token),
    Absent,
}

impl TokenState {
    pub fn classify(token: Option<Token>, now: i64, buffer: Duration) -> Self {
        match token {
            None => Self::Absent,
            Some(token) if token.is_expired(now, buffer) => Self::Expired(token),
            Some(token) => Self::Valid(token),
        }
    }

    pub fn classify_now(token: Option<Token>, buffer: Duration) -> Self {
        Self::classify(token, Utc::now().timestamp(), buffer)
    }

    pub fn valid(self) -> Option<Token> {
        match self {
            Self::Valid(token) => Some(token),
            Self::Expired(_) | Self::Absent => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_keys() {
        assert_eq!(TokenKey::session_access().storage_key(), "session:access");
        assert_eq!(TokenKey::session_refresh().storage_key(), "session:refresh");
        assert_eq!(
            TokenKey::provider_refresh("inkwell").storage_key(),
            "provider/inkwell:refresh"
        );
        assert_eq!(
            TokenKey::content("inkwell", "s-1").storage_key(),
            "content/inkwell/s-1:content"
        );
    }

    #[test]
    fn test_ids_with_separators_do_not_collide() {
        let nested = TokenKey::content("a/b", "x").storage_key();
        assert_eq!(nested, "content/a%2Fb/x:content");
        assert!(!nested.starts_with(&Scope::content_prefix("a")));
        assert!(TokenKey::content("a", "x").storage_key().starts_with(&Scope::content_prefix("a")));

        assert_ne!(
            TokenKey::provider_access("a:refresh").storage_key(),
            TokenKey::provider_refresh("a").storage_key()
        );
        assert_ne!(
            TokenKey::content("a", "b/c").storage_key(),
            TokenKey::content("a/b", "c").storage_key()
        );
    }

    #[test]
    fn test_classify() {
        let buffer = Duration::from_secs(60);
        let token = Token::new(
            TokenKey::session_access(),
            codec::encode_unsigned(&json!({ "exp": 1000 })),
        );

        assert_eq!(TokenState::classify(None, 0, buffer), TokenState::Absent);
        assert!(TokenState::classify(Some(token.clone()), 939, buffer).is_valid());
        assert_eq!(
            TokenState::classify(Some(token.clone()), 940, buffer),
            TokenState::Expired(token)
        );
    }

    #[test]
    fn test_debug_redacts_value() {
        let token = Token::new(TokenKey::session_refresh(), "super-secret");
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("session:refresh"));
    }
}
