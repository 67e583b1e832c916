use tracing::{info, instrument};

use crate::client::IdentityClient;
use crate::config::AuthConfig;
use crate::content::ContentTokenManager;
use crate::errors::Result;
use crate::events::{AuthEvent, EventBus};
use crate::guard::RefreshGuard;
use crate::provider::ProviderTokenManager;
use crate::scheduler::RefreshScheduler;
use crate::session::SessionTokenManager;
use crate::store::TokenStore;

/// The assembled credential core.
///
/// Every manager shares one [`TokenStore`], one [`RefreshGuard`] and one
/// [`EventBus`]; construct it once at app start and keep it for the life of
/// the process.
#[derive(Debug, Clone)]
pub struct Credentials {
    store: TokenStore,
    events: EventBus,
    session: SessionTokenManager,
    providers: ProviderTokenManager,
    content: ContentTokenManager,
    scheduler: RefreshScheduler,
}

impl Credentials {
    pub fn new(config: AuthConfig, store: TokenStore) -> Result<Self> {
        let buffer = config.expiry_buffer();
        let interval = config.refresh_interval();
        let store = store.with_expiry_buffer(buffer);

        let client = IdentityClient::new(config)?;
        let guard = RefreshGuard::new();
        let events = EventBus::new();

        let session = SessionTokenManager::new(store.clone(), client.clone(), guard.clone());
        let providers = ProviderTokenManager::new(
            store.clone(),
            client.clone(),
            guard.clone(),
            session.clone(),
            events.clone(),
        );
        let content = ContentTokenManager::new(providers.clone(), client, guard, buffer);
        let scheduler =
            RefreshScheduler::new(session.clone(), providers.clone(), events.clone(), interval);

        Ok(Self {
            store,
            events,
            session,
            providers,
            content,
            scheduler,
        })
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &SessionTokenManager {
        &self.session
    }

    pub fn providers(&self) -> &ProviderTokenManager {
        &self.providers
    }

    pub fn content(&self) -> &ContentTokenManager {
        &self.content
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    /// Heal the connected-provider set, then start the scheduler if a
    /// session exists. Returns whether the scheduler was started.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> bool {
        let dropped = self.providers.reconcile_connections().await;
        if dropped > 0 {
            info!("Dropped {} stale provider connection(s)", dropped);
        }
        self.scheduler.bootstrap().await
    }

    /// Persist a login and start refreshing
    pub async fn login(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        self.session.login(access_token, refresh_token).await?;
        self.scheduler.start().await;
        Ok(())
    }

    /// Disconnect a provider and drop its cached content tokens
    pub async fn disconnect_provider(&self, provider_id: &str) -> bool {
        let disconnected = self.providers.disconnect_provider(provider_id).await;
        self.content.flush_provider(provider_id);
        disconnected
    }

    /// Tear down all credential state and announce it.
    ///
    /// Returns false if some durable entry could not be removed; the
    /// in-memory state is cleared regardless.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> bool {
        self.scheduler.stop();
        self.providers.disconnect_all().await;
        let session_cleared = self.session.clear().await;
        self.content.flush();
        let metadata_cleared = self.store.clear_metadata().await;

        self.events.emit(AuthEvent::LoggedOut);
        info!("Logged out");
        session_cleared && metadata_cleared
    }
}
