// Integration tests for token persistence on both storage backends.

use chrono::{TimeZone, Utc};
use schwab_broker::config::BrokerConfig;
use schwab_broker::credentials::{MemorySecretsClient, SecretsClient};
use schwab_broker::token::{CloudSecretStore, LocalFileStore, TokenStore};
use schwab_broker::{AuthContext, StorageBackend, TokenSet};
use std::sync::Arc;

fn sample_tokens() -> TokenSet {
    TokenSet {
        access_token: "access".to_string(),
        refresh_token: "refresh".to_string(),
        token_type: "Bearer".to_string(),
        expires_in: 1800,
        expires_at: Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap(),
        scope: Some("api".to_string()),
        id_token: Some("id.jwt".to_string()),
    }
}

async fn assert_round_trip(store: &dyn TokenStore) {
    assert!(store.load().await.unwrap().is_none());

    let tokens = sample_tokens();
    store.save(&tokens).await.unwrap();
    assert_eq!(store.load().await.unwrap(), Some(tokens.clone()));

    // Saving the same set again changes nothing
    store.save(&tokens).await.unwrap();
    assert_eq!(store.load().await.unwrap(), Some(tokens));
}

#[tokio::test]
async fn test_local_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalFileStore::new(dir.path().join("cs_tokens.json"));
    assert_round_trip(&store).await;

    // Only the token file remains: no temp files left behind
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_cloud_round_trip() {
    let secrets = Arc::new(MemorySecretsClient::new());
    let store = CloudSecretStore::new(
        Arc::clone(&secrets) as Arc<dyn SecretsClient>,
        "test/schwab-api/tokens",
    );
    assert_round_trip(&store).await;

    assert_eq!(secrets.create_count(), 1);
    assert!(secrets.value("test/schwab-api/tokens").is_some());
}

/// Records written by older deployments carry a naive local timestamp.
#[tokio::test]
async fn test_local_reads_legacy_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs_tokens.json");
    std::fs::write(
        &path,
        r#"{
            "access_token": "a",
            "refresh_token": "r",
            "token_type": "Bearer",
            "expires_in": 1800,
            "expires_at": "2030-01-02T03:04:05.123456"
        }"#,
    )
    .unwrap();

    let tokens = LocalFileStore::new(&path).load().await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "a");
    assert!(tokens.expires_at > Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
}

/// Tokens written through one context are visible to a second context over
/// the same secret store.
#[tokio::test]
async fn test_cloud_contexts_share_tokens() {
    let secrets = Arc::new(MemorySecretsClient::new());
    secrets.insert(
        "shared/schwab-api/credentials",
        r#"{"client_id":"cid","client_secret":"cs"}"#,
    );
    let mut config = BrokerConfig::default();
    config.storage.deployment_environment = "shared".to_string();

    let first = AuthContext::initialize_with(
        config.clone(),
        StorageBackend::CloudSecret,
        Some(Arc::clone(&secrets) as Arc<dyn SecretsClient>),
    )
    .await
    .unwrap();
    first.store().save(&sample_tokens()).await.unwrap();

    let second = AuthContext::initialize_with(
        config,
        StorageBackend::CloudSecret,
        Some(Arc::clone(&secrets) as Arc<dyn SecretsClient>),
    )
    .await
    .unwrap();
    assert_eq!(second.store().load().await.unwrap(), Some(sample_tokens()));
}
