use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::debug;

use crate::errors::Result;
use crate::token::{Scope, Token, TokenKey};

/// Logical refresh domains; at most one refresh per key runs at a time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshKey {
    Session,
    Provider(String),
    Content { provider_id: String, series_id: String },
}

impl fmt::Display for RefreshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Provider(id) => write!(f, "provider:{id}"),
            Self::Content {
                provider_id,
                series_id,
            } => write!(f, "content:{provider_id}:{series_id}"),
        }
    }
}

impl From<&Scope> for RefreshKey {
    fn from(scope: &Scope) -> Self {
        match scope {
            Scope::Session => Self::Session,
            Scope::Provider(id) => Self::Provider(id.clone()),
            Scope::Content {
                provider_id,
                series_id,
            } => Self::Content {
                provider_id: provider_id.clone(),
                series_id: series_id.clone(),
            },
        }
    }
}

type Flight = Arc<OnceCell<Result<Token>>>;

/// Per-key async locks shared by the pull path and the scheduler, plus the
/// in-flight outcome of each token being produced.
///
/// [`RefreshGuard::share`] runs one exchange per target token and hands its
/// result to every caller that arrived while it was running. Code that only
/// needs mutual exclusion calls [`RefreshGuard::acquire`] and must re-read
/// the store afterwards.
#[derive(Clone, Default)]
pub struct RefreshGuard {
    locks: Arc<Mutex<HashMap<RefreshKey, Arc<AsyncMutex<()>>>>>,
    flights: Arc<Mutex<HashMap<TokenKey, Flight>>>,
}

impl RefreshGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: RefreshKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Produce `target` at most once for all concurrent callers.
    ///
    /// The first caller runs `produce` while holding the lock of the
    /// target's scope; callers arriving before it finishes get a clone of
    /// its result instead of running their own. If the running caller is
    /// cancelled, the next waiter takes over.
    pub async fn share<F, Fut>(&self, target: TokenKey, produce: F) -> Result<Token>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token>>,
    {
        let flight = {
            let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
            let flight = flights.entry(target.clone()).or_default();
            if flight.initialized() {
                *flight = Flight::default();
            } else if Arc::strong_count(flight) > 1 {
                debug!("Joining in-flight refresh of {}", target);
            }
            flight.clone()
        };

        let key = RefreshKey::from(&target.scope);
        let result = flight
            .get_or_init(|| async {
                let _held = self.acquire(key).await;
                produce().await
            })
            .await
            .clone();

        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        if flights
            .get(&target)
            .is_some_and(|current| Arc::ptr_eq(current, &flight))
        {
            flights.remove(&target);
        }
        result
    }

    /// Whether a refresh for `key` is currently running
    pub fn is_busy(&self, key: &RefreshKey) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(key).is_some_and(|lock| lock.try_lock().is_err())
    }
}

impl fmt::Debug for RefreshGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let in_flight = self
            .flights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("RefreshGuard")
            .field("keys", &keys)
            .field("in_flight", &in_flight)
            .finish()
    }
}
