//! Fire-and-forget notifications from the credential core to the rest of
//! the application.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

/// Events emitted by the credential core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Outcome of linking a hosting provider
    ProviderConnected { provider_id: String, success: bool },
    LoggedOut,
}

impl AuthEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ProviderConnected { .. } => EventKind::ProviderConnected,
            Self::LoggedOut => EventKind::LoggedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProviderConnected,
    LoggedOut,
}

/// Returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Synchronous publish/subscribe.
///
/// Handlers run in subscription order on the emitting thread. A panicking
/// handler is logged and skipped. There is no replay: subscribers only see
/// events emitted after they subscribed.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscriptions.push(Subscription {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Returns false if no such subscription exists
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.subscriptions.len();
        state
            .subscriptions
            .retain(|sub| !(sub.id == id && sub.kind == kind));
        state.subscriptions.len() != before
    }

    /// Deliver `event` to current subscribers; returns how many handled it
    pub fn emit(&self, event: AuthEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or unsubscribe while running.
        let handlers: Vec<Handler> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state
                .subscriptions
                .iter()
                .filter(|sub| sub.kind == kind)
                .map(|sub| sub.handler.clone())
                .collect()
        };

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!("Event handler for {:?} panicked", kind),
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.subscriptions.iter().filter(|s| s.kind == kind).count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("subscriptions", &state.subscriptions.len())
            .finish()
    }
}
