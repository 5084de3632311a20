// Integration tests for the token lifecycle: validity checks, single-flight
// refresh and authorization-code exchange against a mock token endpoint.

use chrono::{Duration, Utc};
use futures::future::join_all;
use mockito::Matcher;
use schwab_broker::config::BrokerConfig;
use schwab_broker::token::{LocalFileStore, TokenStore};
use schwab_broker::{AuthContext, Credentials, TokenSet, TokenState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const REFRESHED_BODY: &str = r#"{
    "access_token": "refreshed_access",
    "refresh_token": "refreshed_refresh",
    "token_type": "Bearer",
    "expires_in": 1800,
    "scope": "api"
}"#;

fn credentials() -> Credentials {
    Credentials {
        client_id: "id".to_string(),
        client_secret: "secret".to_string(),
        redirect_uri: "https://127.0.0.1".to_string(),
    }
}

fn tokens_expiring_in(seconds: i64) -> TokenSet {
    TokenSet {
        access_token: "stored_access".to_string(),
        refresh_token: "stored_refresh".to_string(),
        token_type: "Bearer".to_string(),
        expires_in: 1800,
        expires_at: Utc::now() + Duration::seconds(seconds),
        scope: None,
        id_token: None,
    }
}

fn create_context(dir: &tempfile::TempDir, token_url: String) -> AuthContext {
    let mut config = BrokerConfig::default();
    config.oauth.token_url = token_url;
    AuthContext::new(
        config,
        credentials(),
        Arc::new(LocalFileStore::new(dir.path().join("cs_tokens.json"))),
    )
    .unwrap()
}

/// A token with plenty of life left is returned without touching the network.
#[tokio::test]
async fn test_valid_token_makes_no_calls() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .expect(0)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));
    ctx.store().save(&tokens_expiring_in(600)).await.unwrap();

    let tokens = ctx.token_manager().ensure_valid_token().await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "stored_access");
    mock.assert_async().await;
}

/// No stored record means re-authentication, not an error.
#[tokio::test]
async fn test_missing_tokens_return_none() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, "http://127.0.0.1:1/token".to_string());

    let manager = ctx.token_manager();
    assert!(manager.ensure_valid_token().await.unwrap().is_none());
    assert_eq!(manager.state().await.unwrap(), TokenState::Missing);
}

/// A corrupt token file reads as missing.
#[tokio::test]
async fn test_corrupt_file_treated_as_missing() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, "http://127.0.0.1:1/token".to_string());
    std::fs::write(dir.path().join("cs_tokens.json"), "{not json").unwrap();

    assert!(ctx.token_manager().ensure_valid_token().await.unwrap().is_none());
}

/// Many concurrent callers near expiry share exactly one refresh.
#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_header("authorization", "Basic aWQ6c2VjcmV0")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "stored_refresh".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(REFRESHED_BODY)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));
    ctx.store().save(&tokens_expiring_in(90)).await.unwrap();

    // Separate managers sharing the context's refresh lock
    let managers: Vec<_> = (0..8).map(|_| ctx.token_manager()).collect();
    let results = join_all(managers.iter().map(|m| m.ensure_valid_token())).await;

    for result in results {
        let tokens = result.unwrap().unwrap();
        assert_eq!(tokens.access_token, "refreshed_access");
    }
    mock.assert_async().await;
    assert_eq!(ctx.refresh_gate().attempts(), 1);

    let stored = ctx.store().load().await.unwrap().unwrap();
    assert_eq!(stored.refresh_token, "refreshed_refresh");
    assert_eq!(stored.scope.as_deref(), Some("api"));
    let remaining = stored.expires_at - Utc::now();
    assert!(remaining > Duration::seconds(1790) && remaining <= Duration::seconds(1800));
}

/// Spawned tasks on the multi-threaded runtime also see one refresh.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_spawned_tasks_share_one_refresh() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(REFRESHED_BODY)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));
    ctx.store().save(&tokens_expiring_in(30)).await.unwrap();

    let manager = Arc::new(ctx.token_manager());
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.ensure_valid_token().await })
        })
        .collect();

    for handle in handles {
        let tokens = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(tokens.access_token, "refreshed_access");
    }
    mock.assert_async().await;
}

/// A rejected refresh leaves the stored record untouched.
#[tokio::test]
async fn test_rejected_refresh_leaves_file_unmodified() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));
    ctx.store().save(&tokens_expiring_in(-300)).await.unwrap();
    let path = dir.path().join("cs_tokens.json");
    let before = std::fs::read(&path).unwrap();

    let manager = ctx.token_manager();
    assert!(manager.ensure_valid_token().await.unwrap().is_none());
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(manager.state().await.unwrap(), TokenState::RefreshFailed);
    mock.assert_async().await;
}

/// A refused refresh token stays refused until a new token set is stored.
#[tokio::test]
async fn test_new_refresh_token_clears_rejection() {
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("POST", "/token")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));
    ctx.store().save(&tokens_expiring_in(30)).await.unwrap();
    let manager = ctx.token_manager();

    assert!(manager.ensure_valid_token().await.unwrap().is_none());
    assert!(manager.ensure_valid_token().await.unwrap().is_none());
    failing.assert_async().await;

    let mut reauthorized = tokens_expiring_in(30);
    reauthorized.refresh_token = "second_refresh".to_string();
    ctx.store().save(&reauthorized).await.unwrap();

    let ok = server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded(
            "refresh_token".into(),
            "second_refresh".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(REFRESHED_BODY)
        .expect(1)
        .create_async()
        .await;

    let tokens = manager.ensure_valid_token().await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "refreshed_access");
    ok.assert_async().await;
}

/// Authorization-code exchange persists a fresh token set.
#[tokio::test]
async fn test_exchange_code_persists_tokens() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_header("authorization", "Basic aWQ6c2VjcmV0")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "C0.abc@".into()),
            Matcher::UrlEncoded("redirect_uri".into(), "https://127.0.0.1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(REFRESHED_BODY)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));

    let code =
        schwab_broker::oauth::extract_authorization_code("https://127.0.0.1/?code=C0.abc%40&session=x")
            .unwrap();
    ctx.exchanger().exchange_code(&code).await.unwrap();

    mock.assert_async().await;
    let manager = ctx.token_manager();
    assert_eq!(manager.state().await.unwrap(), TokenState::Valid);
    let tokens = manager.ensure_valid_token().await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "refreshed_access");
}

/// An out-of-range `expires_in` is a failed refresh, not a crash.
#[tokio::test]
async fn test_oversized_expires_in_fails_refresh() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"x","refresh_token":"y","expires_in":1000000000000000}"#)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = create_context(&dir, format!("{}/token", server.url()));
    ctx.store().save(&tokens_expiring_in(30)).await.unwrap();
    let manager = Arc::new(ctx.token_manager());

    let result = tokio::spawn(async move { manager.ensure_valid_token().await })
        .await
        .unwrap();
    assert!(result.unwrap().is_none());

    let stored = ctx.store().load().await.unwrap().unwrap();
    assert_eq!(stored.access_token, "stored_access");
    mock.assert_async().await;
}

/// Callers queued behind a refresh that timed out share its failure; a later
/// call tries again.
#[tokio::test]
async fn test_queued_callers_share_timed_out_refresh() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = BrokerConfig::default();
    config.oauth.token_url = format!("http://{}/token", addr);
    config.retry.request_timeout_seconds = 1;
    let ctx = AuthContext::new(
        config,
        credentials(),
        Arc::new(LocalFileStore::new(dir.path().join("cs_tokens.json"))),
    )
    .unwrap();
    ctx.store().save(&tokens_expiring_in(30)).await.unwrap();

    let managers: Vec<_> = (0..5).map(|_| ctx.token_manager()).collect();
    let results = join_all(managers.iter().map(|m| m.ensure_valid_token())).await;

    for result in results {
        assert!(result.unwrap().is_none());
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.refresh_gate().attempts(), 1);

    // Transport failures are not sticky
    assert_eq!(managers[0].state().await.unwrap(), TokenState::RefreshDue);
    assert!(managers[0].ensure_valid_token().await.unwrap().is_none());
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    server.abort();
}
