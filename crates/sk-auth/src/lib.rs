//! Client-side credential and token-lifecycle core for storykeep
//!
//! This crate keeps three tiers of tokens usable for the application:
//!
//! 1. The session pair (access/refresh) issued by the identity service
//! 2. One OAuth refresh/access pair per connected hosting provider
//! 3. Short-lived content tokens scoped to a `(provider, series)` pair
//!
//! Each tier is derived from the one above it. A missing or expired upstream
//! token is not an error: the derivation simply yields `None`.
//!
//! # Example
//!
//! ```
//! use sk_auth::{AuthConfig, Credentials, TokenStore};
//!
//! # async fn example() -> sk_auth::Result<()> {
//! let config = AuthConfig::parse("https://identity.example.com/")?;
//! let credentials = Credentials::new(config, TokenStore::in_memory())?;
//!
//! // Nothing stored yet: the scheduler stays stopped and LoggedOut is emitted.
//! assert!(!credentials.bootstrap().await);
//! assert!(credentials.session().access_token().await.is_none());
//! assert!(credentials.content().content_token("inkwell", "s-1").await.is_none());
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! # Token Storage
//!
//! [`TokenStore`] spans three layers:
//!
//! - a durable-secure space for token values, encrypted with AES-256-GCM
//!   ([`EncryptedFileBackend`]); the key lives in the OS keyring or is
//!   derived from a passphrase with Argon2id
//! - a durable-plain space for non-secret metadata such as the connected
//!   provider list ([`JsonFileBackend`])
//! - a process-local cache mirroring the metadata, readable without awaiting
//!
//! ```no_run
//! use std::sync::Arc;
//! use sk_auth::{EnvSecretProvider, TokenStore};
//!
//! # async fn example() -> sk_auth::Result<()> {
//! let secrets = Arc::new(EnvSecretProvider::default());
//! let store = TokenStore::open("/var/lib/storykeep", secrets).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Important Notes
//!
//! - Token claims are decoded without signature verification; they are
//!   only used to schedule refreshes
//! - An undecodable token is always treated as expired
//! - Tokens are never logged; `Debug` output redacts them

pub mod client;
pub mod codec;
pub mod config;
pub mod content;
pub mod credentials;
pub mod crypto;
pub mod errors;
pub mod events;
pub mod guard;
pub mod key_manager;
pub mod models;
pub mod provider;
pub mod scheduler;
pub mod secret;
pub mod session;
pub mod store;
pub mod token;

// Re-export main types
pub use client::IdentityClient;
pub use config::AuthConfig;
pub use content::ContentTokenManager;
pub use credentials::Credentials;
pub use errors::{DecodeError, Result, SkAuthError};
pub use events::{AuthEvent, EventBus, EventKind, SubscriptionId};
pub use guard::{RefreshGuard, RefreshKey};
pub use key_manager::KdfParams;
pub use provider::{ProviderConnection, ProviderTokenManager, ReconcileFailure, ReconcileReport};
pub use scheduler::{AppState, RefreshScheduler, SchedulerState};
pub use secret::{EnvSecretProvider, NoSecretProvider, SecretProvider, StaticSecretProvider};
pub use session::SessionTokenManager;
pub use store::{
    EncryptedFileBackend, JsonFileBackend, LocalCache, MemoryBackend, StorageBackend, TokenStore,
    UnavailableBackend,
};
pub use token::{Scope, Token, TokenKey, TokenKind, TokenState};
