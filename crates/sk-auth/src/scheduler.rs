//! Proactive refresh of the token cascade.
//!
//! The scheduler is one state machine fed by two triggers: its own periodic
//! timer and app lifecycle transitions. Both go through the same per-key
//! [`RefreshGuard`](crate::guard::RefreshGuard) as on-demand reads, so a
//! scheduled refresh and a UI pull never hit the network twice for one key.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, instrument, warn};

use crate::config::REFRESH_INTERVAL;
use crate::events::{AuthEvent, EventBus};
use crate::provider::ProviderTokenManager;
use crate::session::SessionTokenManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Scheduled,
    Refreshing,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Scheduled => "scheduled",
            Self::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

/// Application lifecycle as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy)]
struct LastRefresh {
    at: Instant,
    wall: DateTime<Utc>,
}

struct Inner {
    session: SessionTokenManager,
    providers: ProviderTokenManager,
    events: EventBus,
    interval: Duration,
    state: Mutex<SchedulerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    last_refresh: Mutex<Option<LastRefresh>>,
}

impl Inner {
    fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SchedulerState) -> SchedulerState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let prev = *state;
        if prev != next {
            debug!("Scheduler {} -> {}", prev, next);
        }
        *state = next;
        prev
    }

    /// Move `from` -> `to` only if the machine is currently in `from`
    fn transition(&self, from: SchedulerState, to: SchedulerState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        debug!("Scheduler {} -> {}", from, to);
        *state = to;
        true
    }

    fn record_success(&self) {
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(LastRefresh {
            at: Instant::now(),
            wall: Utc::now(),
        });
    }

    fn last_refresh(&self) -> Option<LastRefresh> {
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_timer(&self) -> Option<JoinHandle<()>> {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Ensure a session access token, then rotate the refresh token.
    /// True if both steps succeeded.
    async fn refresh_session(&self) -> bool {
        if self.session.access_token().await.is_none() {
            warn!("Session access token could not be refreshed");
            return false;
        }
        match self.session.refresh_refresh_token().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Session refresh token rotation failed: {}", e);
                false
            }
        }
    }

    /// Bootstrap cycle: session refresh and bulk provider reconciliation run
    /// side by side, neither blocking the other
    async fn startup_cycle(&self) {
        let (session_ok, report) = tokio::join!(
            self.refresh_session(),
            self.providers.fetch_all_provider_tokens()
        );
        if let Err(e) = report {
            warn!("Provider reconciliation failed: {}", e);
        }
        if session_ok {
            self.record_success();
        }
    }

    async fn periodic_cycle(&self) -> bool {
        let session_ok = self.refresh_session().await;
        let ready = self.providers.refresh_connected().await;
        debug!("{} provider(s) ready after refresh", ready);
        if session_ok {
            self.record_success();
        }
        session_ok
    }
}

/// Runs the refresh cycle on its own task.
///
/// Awaiting the handle instead of the future keeps an in-flight exchange
/// alive when the awaiting side is aborted by `stop()` or a re-arm. With
/// `settle`, the task itself moves `Refreshing` back to `Scheduled`, so the
/// state stays correct even if nobody is left awaiting it.
async fn run_detached(inner: Arc<Inner>, settle: bool) -> bool {
    let task = tokio::spawn(async move {
        let ok = inner.periodic_cycle().await;
        if settle {
            inner.transition(SchedulerState::Refreshing, SchedulerState::Scheduled);
        }
        ok
    });
    match task.await {
        Ok(ok) => ok,
        Err(e) => {
            warn!("Refresh task failed: {}", e);
            false
        }
    }
}

async fn on_tick(inner: Arc<Inner>) {
    if !inner.session.has_refresh_token().await {
        info!("Session refresh token is gone; stopping scheduler");
        stop_inner(&inner);
        return;
    }
    if !inner.transition(SchedulerState::Scheduled, SchedulerState::Refreshing) {
        debug!("Skipping tick while {}", inner.state());
        return;
    }
    run_detached(inner, true).await;
}

fn stop_inner(inner: &Inner) -> bool {
    let timer = inner.take_timer();
    let had_timer = timer.is_some();
    if let Some(handle) = timer {
        handle.abort();
    }
    let prev = inner.set_state(SchedulerState::Stopped);
    had_timer || prev != SchedulerState::Stopped
}

/// Keeps the session and connected providers fresh on a fixed interval
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<Inner>,
}

impl RefreshScheduler {
    pub fn new(
        session: SessionTokenManager,
        providers: ProviderTokenManager,
        events: EventBus,
        interval: Duration,
    ) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                "Refresh interval of zero is not usable; falling back to {}s",
                REFRESH_INTERVAL.as_secs()
            );
            REFRESH_INTERVAL
        } else {
            interval
        };
        Self {
            inner: Arc::new(Inner {
                session,
                providers,
                events,
                interval,
                state: Mutex::new(SchedulerState::Stopped),
                timer: Mutex::new(None),
                last_refresh: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.state()
    }

    /// Wall-clock time of the last successful session refresh
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.last_refresh().map(|last| last.wall)
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// True while a periodic timer is pending
    pub fn is_armed(&self) -> bool {
        self.inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// App-start entry point.
    ///
    /// Without a session refresh token the scheduler stays stopped and
    /// `LoggedOut` is emitted. Returns whether the scheduler was started.
    pub async fn bootstrap(&self) -> bool {
        if !self.inner.session.has_refresh_token().await {
            info!("No session on startup");
            self.inner.set_state(SchedulerState::Stopped);
            self.inner.events.emit(AuthEvent::LoggedOut);
            return false;
        }
        self.start().await;
        true
    }

    /// Refresh once, then arm the periodic timer.
    ///
    /// The initial refresh completes before the timer exists, so the first
    /// tick can never race it. A no-op unless the scheduler is stopped.
    #[instrument(skip(self))]
    pub async fn start(&self) {
        if !self
            .inner
            .transition(SchedulerState::Stopped, SchedulerState::Starting)
        {
            debug!("Scheduler already {}", self.state());
            return;
        }

        let inner = self.inner.clone();
        if let Err(e) = tokio::spawn(async move { inner.startup_cycle().await }).await {
            warn!("Startup refresh task failed: {}", e);
        }

        // stop() may have run while the startup refresh was in flight
        if self
            .inner
            .transition(SchedulerState::Starting, SchedulerState::Scheduled)
        {
            self.arm_timer();
            info!(
                "Refresh scheduler running every {}s",
                self.inner.interval.as_secs()
            );
        }
    }

    /// Cancel the pending timer. Tokens are left untouched and an in-flight
    /// refresh is allowed to finish. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let stopped = stop_inner(&self.inner);
        if stopped {
            info!("Refresh scheduler stopped");
        }
        stopped
    }

    /// Refresh immediately, regardless of the timer
    pub async fn refresh_now(&self) -> bool {
        run_detached(self.inner.clone(), false).await
    }

    /// React to the host app moving between foreground and background
    #[instrument(skip(self))]
    pub async fn on_app_state_change(&self, app_state: AppState) {
        match app_state {
            AppState::Background => {
                self.stop();
            }
            AppState::Foreground => self.resume().await,
        }
    }

    async fn resume(&self) {
        if !self.inner.session.has_refresh_token().await {
            debug!("Foregrounded without a session; staying stopped");
            self.stop();
            return;
        }

        let current = self.inner.state();
        match current {
            SchedulerState::Starting => {
                debug!("Startup refresh in flight; it arms the timer itself");
                return;
            }
            SchedulerState::Refreshing => {
                debug!("Refresh already in flight; re-arming only");
                self.arm_timer();
                return;
            }
            SchedulerState::Stopped | SchedulerState::Scheduled => {}
        }

        let due = self
            .inner
            .last_refresh()
            .is_none_or(|last| last.at.elapsed() > self.inner.interval);
        let next = if due {
            SchedulerState::Refreshing
        } else {
            SchedulerState::Scheduled
        };

        if due {
            // Cancel the old timer first so it cannot tick during this refresh.
            if let Some(handle) = self.inner.take_timer() {
                handle.abort();
            }
        }
        if !self.inner.transition(current, next) {
            // A tick, start() or stop() got in first.
            if self.inner.state() == SchedulerState::Refreshing {
                self.arm_timer();
            }
            return;
        }

        if due {
            info!("Refresh is overdue; refreshing now");
            run_detached(self.inner.clone(), true).await;
            if self.inner.state() != SchedulerState::Scheduled {
                return;
            }
        }

        self.arm_timer();
    }

    /// Replace any pending timer with a fresh one
    fn arm_timer(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.interval;

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                on_tick(inner).await;
            }
        });

        let previous = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("state", &self.state())
            .field("interval", &self.inner.interval)
            .field("last_refresh", &self.last_refresh())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.take_timer() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::IdentityClient;
    use crate::config::AuthConfig;
    use crate::guard::RefreshGuard;
    use crate::store::TokenStore;

    fn refresh_jwt() -> String {
        let exp = Utc::now().timestamp() + 3600;
        crate::codec::encode_unsigned(&serde_json::json!({ "exp": exp }))
    }

    fn scheduler(interval: Duration) -> RefreshScheduler {
        let store = TokenStore::in_memory();
        let client = IdentityClient::new(AuthConfig::default()).unwrap();
        let guard = RefreshGuard::new();
        let events = EventBus::new();
        let session = SessionTokenManager::new(store.clone(), client.clone(), guard.clone());
        let providers =
            ProviderTokenManager::new(store, client, guard, session.clone(), events.clone());
        RefreshScheduler::new(session, providers, events, interval)
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let scheduler = scheduler(Duration::from_secs(60));
        *scheduler.inner.state.lock().unwrap() = SchedulerState::Scheduled;
        scheduler.arm_timer();
        assert!(scheduler.is_armed());

        assert!(scheduler.stop());
        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);

        assert!(!scheduler.stop());
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_rearming_replaces_timer() {
        let scheduler = scheduler(Duration::from_secs(60));
        scheduler.arm_timer();
        scheduler.arm_timer();
        assert!(scheduler.is_armed());
        assert!(scheduler.stop());
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_bootstrap_without_session_emits_logged_out() {
        let scheduler = scheduler(Duration::from_secs(60));
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        scheduler
            .inner
            .events
            .on(crate::events::EventKind::LoggedOut, move |_| {
                *counter.lock().unwrap() += 1;
            });

        assert!(!scheduler.bootstrap().await);
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.is_armed());
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_falls_back_to_default() {
        let scheduler = scheduler(Duration::ZERO);
        assert_eq!(scheduler.interval(), REFRESH_INTERVAL);

        *scheduler.inner.state.lock().unwrap() = SchedulerState::Scheduled;
        scheduler.arm_timer();
        tokio::task::yield_now().await;
        assert!(scheduler.is_armed());
        assert!(scheduler.stop());
    }

    #[tokio::test]
    async fn test_foreground_while_starting_leaves_state_alone() {
        let scheduler = scheduler(Duration::from_secs(60));
        scheduler
            .inner
            .session
            .login("h.e30.s", &refresh_jwt())
            .await
            .unwrap();
        *scheduler.inner.state.lock().unwrap() = SchedulerState::Starting;

        scheduler.on_app_state_change(AppState::Foreground).await;
        assert_eq!(scheduler.state(), SchedulerState::Starting);
        assert!(!scheduler.is_armed());
        assert!(scheduler.last_refresh().is_none());
    }

    #[tokio::test]
    async fn test_foreground_while_refreshing_only_rearms() {
        let scheduler = scheduler(Duration::from_secs(60));
        scheduler
            .inner
            .session
            .login("h.e30.s", &refresh_jwt())
            .await
            .unwrap();
        *scheduler.inner.state.lock().unwrap() = SchedulerState::Refreshing;

        scheduler.on_app_state_change(AppState::Foreground).await;
        assert_eq!(scheduler.state(), SchedulerState::Refreshing);
        assert!(scheduler.is_armed());
        assert!(scheduler.last_refresh().is_none());
        assert!(scheduler.stop());
    }

    #[tokio::test]
    async fn test_foreground_without_session_stays_stopped() {
        let scheduler = scheduler(Duration::from_secs(60));
        scheduler.on_app_state_change(AppState::Foreground).await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.is_armed());
        assert!(scheduler.last_refresh().is_none());
    }
}
