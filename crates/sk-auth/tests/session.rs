mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use sk_auth::{SkAuthError, Token, TokenKey};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INTERVAL: Duration = Duration::from_secs(600);

#[tokio::test]
async fn test_concurrent_reads_share_one_refresh() {
    let server = MockServer::start().await;
    let refresh = valid_jwt();
    let access = valid_jwt();
    Mock::given(method("POST"))
        .and(path(ACCESS_PATH))
        .and(body_json(json!({ "token": refresh })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": access }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let credentials = credentials(&server, INTERVAL);
    let store = credentials.store();
    store
        .set_token(&Token::new(TokenKey::session_refresh(), &refresh))
        .await;
    store
        .set_token(&Token::new(TokenKey::session_access(), expired_jwt()))
        .await;

    let session = credentials.session();
    let (first, second) = tokio::join!(session.access_token(), session.access_token());

    let first = first.expect("first caller gets a token");
    let second = second.expect("second caller gets a token");
    assert_eq!(first.value(), access);
    assert_eq!(first, second);
    assert_eq!(
        session.cached_access_token().await.map(Token::into_value),
        Some(access)
    );
}

#[tokio::test]
async fn test_failed_refresh_leaves_tokens_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ACCESS_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })))
        .mount(&server)
        .await;

    let credentials = credentials(&server, INTERVAL);
    let refresh = valid_jwt();
    let access = valid_jwt();
    credentials.session().login(&access, &refresh).await.unwrap();

    let session = credentials.session();
    assert!(matches!(
        session.refresh_access_token().await,
        Err(SkAuthError::Http { .. })
    ));
    assert!(matches!(
        session.refresh_refresh_token().await,
        Err(SkAuthError::InvalidGrant)
    ));

    assert_eq!(session.refresh_token().await.map(Token::into_value), Some(refresh));
    assert_eq!(
        session.cached_access_token().await.map(Token::into_value),
        Some(access)
    );
}

#[tokio::test]
async fn test_no_refresh_token_means_no_network() {
    let server = MockServer::start().await;
    let credentials = credentials(&server, INTERVAL);
    let session = credentials.session();

    assert!(session.access_token().await.is_none());
    assert!(matches!(
        session.refresh_refresh_token().await,
        Err(SkAuthError::MissingRefreshToken(_))
    ));

    credentials
        .store()
        .set_token(&Token::new(TokenKey::session_refresh(), expired_jwt()))
        .await;
    assert!(session.access_token().await.is_none());
    assert_eq!(total_requests(&server).await, 0);
}

#[tokio::test]
async fn test_login_records_user_and_clear_forgets_it() {
    let server = MockServer::start().await;
    let credentials = credentials(&server, INTERVAL);
    let session = credentials.session();

    let refresh = jwt(3600, json!({ "sub": "user-42" }));
    session.login(&valid_jwt(), &refresh).await.unwrap();
    assert_eq!(session.user_id().as_deref(), Some("user-42"));
    assert!(session.has_refresh_token().await);

    assert!(session.clear().await);
    assert!(session.user_id().is_none());
    assert!(!session.has_refresh_token().await);
    assert!(session.cached_access_token().await.is_none());
}

#[tokio::test]
async fn test_rotation_replaces_refresh_token() {
    let server = MockServer::start().await;
    let rotated = valid_jwt();
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "refreshToken": rotated })))
        .expect(1)
        .mount(&server)
        .await;

    let credentials = credentials(&server, INTERVAL);
    let session = credentials.session();
    session.login(&valid_jwt(), &valid_jwt()).await.unwrap();

    let token = session.refresh_refresh_token().await.unwrap();
    assert_eq!(token.value(), rotated);
    assert_eq!(session.refresh_token().await, Some(token));
}

#[tokio::test]
async fn test_concurrent_forced_refreshes_share_one_exchange() {
    let server = MockServer::start().await;
    let access = valid_jwt();
    Mock::given(method("POST"))
        .and(path(ACCESS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "accessToken": access }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let credentials = credentials(&server, INTERVAL);
    credentials
        .session()
        .login(&valid_jwt(), &valid_jwt())
        .await
        .unwrap();

    let session = credentials.session();
    let (first, second) = tokio::join!(
        session.refresh_access_token(),
        session.refresh_access_token()
    );

    let first = first.unwrap();
    assert_eq!(first.value(), access);
    assert_eq!(first, second.unwrap());
}

#[tokio::test]
async fn test_concurrent_rotations_share_one_exchange() {
    let server = MockServer::start().await;
    let rotated = valid_jwt();
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "refreshToken": rotated }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let credentials = credentials(&server, INTERVAL);
    credentials
        .session()
        .login(&valid_jwt(), &valid_jwt())
        .await
        .unwrap();

    let session = credentials.session();
    let (first, second) = tokio::join!(
        session.refresh_refresh_token(),
        session.refresh_refresh_token()
    );

    assert_eq!(first.unwrap().value(), rotated);
    assert_eq!(second.unwrap().value(), rotated);
    assert_eq!(
        session.refresh_token().await.map(Token::into_value),
        Some(rotated)
    );
}

#[tokio::test]
async fn test_shared_failure_is_returned_to_every_caller() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ACCESS_PATH))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "error": "invalid_grant" }))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let credentials = credentials(&server, INTERVAL);
    credentials
        .session()
        .login(&expired_jwt(), &valid_jwt())
        .await
        .unwrap();

    let session = credentials.session();
    let (forced, pulled) = tokio::join!(session.refresh_access_token(), session.access_token());
    assert!(matches!(forced, Err(SkAuthError::InvalidGrant)));
    assert!(pulled.is_none());
}
