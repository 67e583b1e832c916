#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use sk_auth::codec::encode_unsigned;
use sk_auth::{AuthConfig, AuthEvent, Credentials, EventKind, TokenStore};
use wiremock::MockServer;

pub const ACCESS_PATH: &str = "/exchange-refresh-token-for-access-token";
pub const REFRESH_PATH: &str = "/exchange-refresh-token-for-refresh-token";
pub const PROVIDER_TOKENS_PATH: &str = "/provider-refresh-tokens";

pub fn provider_path(provider_id: &str, endpoint: &str) -> String {
    format!("/providers/{provider_id}/{endpoint}")
}

pub fn content_path(provider_id: &str, series_id: &str) -> String {
    format!("/providers/{provider_id}/series/{series_id}/content-token")
}

static NEXT_JTI: AtomicU64 = AtomicU64::new(1);

/// Unsigned JWT expiring `secs` from now. Every call yields a distinct token.
pub fn jwt(secs: i64, extra: Value) -> String {
    let mut claims = json!({
        "exp": Utc::now().timestamp() + secs,
        "jti": NEXT_JTI.fetch_add(1, Ordering::Relaxed),
    });
    if let (Some(claims), Some(extra)) = (claims.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            claims.insert(key.clone(), value.clone());
        }
    }
    encode_unsigned(&claims)
}

pub fn valid_jwt() -> String {
    jwt(3600, json!({}))
}

pub fn expired_jwt() -> String {
    jwt(-60, json!({}))
}

pub fn provider_jwt(provider_id: &str) -> String {
    jwt(86_400, json!({ "iss": provider_id }))
}

pub fn credentials(server: &MockServer, interval: Duration) -> Credentials {
    credentials_with_store(server, interval, TokenStore::in_memory())
}

pub fn credentials_with_store(
    server: &MockServer,
    interval: Duration,
    store: TokenStore,
) -> Credentials {
    let config = AuthConfig::parse(&server.uri())
        .unwrap()
        .with_refresh_interval(interval);
    Credentials::new(config, store).unwrap()
}

pub async fn requests_to(server: &MockServer, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == path)
        .count()
}

pub async fn total_requests(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

/// Collects every event of `kind` emitted on the bus
pub fn record(credentials: &Credentials, kind: EventKind) -> Arc<Mutex<Vec<AuthEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    credentials.events().on(kind, move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    seen
}
