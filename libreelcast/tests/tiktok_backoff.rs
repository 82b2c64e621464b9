//! TikTok publish through the coordinator against a mocked Content Posting API
//!
//! The real adapter is built from configuration with a recording sleeper, so
//! the backoff between status polls is observed without waiting for it. An
//! account whose token has expired goes through the refresh grant first.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use libreelcast::capabilities::CapabilityRegistry;
use libreelcast::config::Config;
use libreelcast::crypto::{generate_key, TokenCipher};
use libreelcast::db::Database;
use libreelcast::platforms::mock::RecordingSleeper;
use libreelcast::platforms::AdapterRegistry;
use libreelcast::service::accounts::{AccountService, NewAccount};
use libreelcast::service::events::EventBus;
use libreelcast::service::publishing::PublishCoordinator;
use libreelcast::types::{Asset, Platform, PlatformPost, PlatformPostStatus, Post, PostContext, PostStatus};
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn status_body(status: &str) -> serde_json::Value {
    serde_json::json!({
        "data": {"status": status},
        "error": {"code": "ok", "message": "", "log_id": "log"}
    })
}

async fn mount_tiktok(server: &MockServer, pending_polls: u64, terminal: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/post/publish/video/init/"))
        .and(header("authorization", "Bearer tt-secret-token"))
        .and(body_partial_json(serde_json::json!({
            "post_info": {"title": "Weekend recap"},
            "source_info": {"source": "PULL_FROM_URL", "video_url": "https://cdn.example.com/recap.mp4"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"publish_id": "v_pub_url~v2.123"},
            "error": {"code": "ok", "message": "", "log_id": "log"}
        })))
        .expect(1)
        .mount(server)
        .await;

    if pending_polls > 0 {
        Mock::given(method("POST"))
            .and(path("/post/publish/status/fetch/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(status_body("PROCESSING_UPLOAD")))
            .up_to_n_times(pending_polls)
            .mount(server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/post/publish/status/fetch/"))
        .and(body_partial_json(serde_json::json!({"publish_id": "v_pub_url~v2.123"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(terminal))
        .mount(server)
        .await;
}

async fn mount_refresh(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/oauth/token/"))
        .and(body_string_contains("client_key=aw-key"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=tt-refresh-1"))
        .respond_with(response)
        .expect(1)
        .mount(server)
        .await;
}

struct Setup {
    _temp_dir: TempDir,
    db: Arc<Database>,
    key: String,
    coordinator: PublishCoordinator,
    sleeper: RecordingSleeper,
    post_id: String,
}

async fn setup(server: &MockServer) -> Result<Setup> {
    setup_with_token(server, false).await
}

/// `expired` stores a stale token with a refresh token instead of a live one
async fn setup_with_token(server: &MockServer, expired: bool) -> Result<Setup> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let db = Arc::new(Database::new(&db_path.to_string_lossy()).await?);
    let key = generate_key();

    AccountService::new(db.clone(), TokenCipher::new(&key))
        .connect(NewAccount {
            user_id: "creator".to_string(),
            platform: Platform::Tiktok,
            external_account_id: "open-id-9".to_string(),
            display_name: Some("creator".to_string()),
            access_token: SecretString::from(
                if expired { "tt-stale-token" } else { "tt-secret-token" }.to_string(),
            ),
            refresh_token: expired.then(|| SecretString::from("tt-refresh-1".to_string())),
            expires_at: expired.then(|| chrono::Utc::now().timestamp() - 10),
            scopes: vec!["video.publish".to_string()],
            metadata: serde_json::json!({}),
        })
        .await?;

    let asset = Asset::new(
        "creator",
        Some("https://cdn.example.com/recap.mp4".to_string()),
        Some("video/mp4".to_string()),
    );
    db.create_asset(&asset).await?;
    let post = Post::new("creator", Some(asset.id.clone()), PostContext::default());
    db.create_post(&post).await?;
    let mut platform_post = PlatformPost::new(&post.id, Platform::Tiktok);
    platform_post.caption_final = Some("Weekend recap".to_string());
    db.create_platform_post(&platform_post).await?;

    let mut config = Config::default_config();
    config.tiktok.api_base = server.uri();
    config.tiktok.client_key = Some("aw-key".to_string());
    config.tiktok.client_secret = Some("aw-secret".to_string());
    let sleeper = RecordingSleeper::new();
    let adapters = AdapterRegistry::from_config_with_sleeper(
        &config,
        Arc::new(CapabilityRegistry::builtin()),
        Arc::new(sleeper.clone()),
    )?;

    let coordinator = PublishCoordinator::new(
        db.clone(),
        adapters,
        TokenCipher::new(&key),
        EventBus::default(),
    );

    Ok(Setup {
        _temp_dir: temp_dir,
        db,
        key,
        coordinator,
        sleeper,
        post_id: post.id,
    })
}

#[tokio::test]
async fn test_backoff_then_complete() -> Result<()> {
    let server = MockServer::start().await;
    mount_tiktok(&server, 3, status_body("PUBLISH_COMPLETE")).await;
    let s = setup(&server).await?;

    let report = s.coordinator.publish_now(&s.post_id, "creator").await?;

    assert_eq!(report.status, PostStatus::Published);
    assert_eq!(
        s.sleeper.recorded(),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_millis(4500)
        ]
    );

    let sub = &s.db.platform_posts_for_post(&s.post_id).await?[0];
    assert_eq!(sub.status, PlatformPostStatus::Published);
    assert_eq!(sub.external_post_id.as_deref(), Some("v_pub_url~v2.123"));
    assert_eq!(sub.external_url, None);
    Ok(())
}

#[tokio::test]
async fn test_failed_publish_records_reason() -> Result<()> {
    let server = MockServer::start().await;
    mount_tiktok(
        &server,
        1,
        serde_json::json!({
            "data": {"status": "FAILED", "fail_reason": "file_format_check_failed"},
            "error": {"code": "ok", "message": "", "log_id": "log"}
        }),
    )
    .await;
    let s = setup(&server).await?;

    let report = s.coordinator.publish_now(&s.post_id, "creator").await?;

    assert_eq!(report.status, PostStatus::Failed);
    assert_eq!(report.results[0].error(), Some("file_format_check_failed"));
    assert_eq!(s.sleeper.recorded(), vec![Duration::from_secs(2)]);

    let sub = &s.db.platform_posts_for_post(&s.post_id).await?[0];
    assert_eq!(sub.last_error.as_deref(), Some("file_format_check_failed"));
    Ok(())
}

#[tokio::test]
async fn test_expired_token_refreshed_before_publish() -> Result<()> {
    let server = MockServer::start().await;
    mount_refresh(
        &server,
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "tt-secret-token",
            "refresh_token": "tt-refresh-2",
            "expires_in": 86400,
            "open_id": "open-id-9",
            "token_type": "Bearer"
        })),
    )
    .await;
    // Init only matches the refreshed bearer token
    mount_tiktok(&server, 0, status_body("PUBLISH_COMPLETE")).await;
    let s = setup_with_token(&server, true).await?;

    let report = s.coordinator.publish_now(&s.post_id, "creator").await?;
    assert_eq!(report.status, PostStatus::Published);

    let account = s
        .db
        .resolve_account("creator", Platform::Tiktok)
        .await?
        .expect("account stored");
    let cipher = TokenCipher::new(&s.key)?;
    assert_eq!(
        cipher.decrypt(&account.token_encrypted)?.expose_secret(),
        "tt-secret-token"
    );
    let rotated = account.refresh_token_encrypted.expect("refresh token kept");
    assert_eq!(cipher.decrypt(&rotated)?.expose_secret(), "tt-refresh-2");
    assert!(account.expires_at.unwrap_or_default() > chrono::Utc::now().timestamp() + 80_000);
    Ok(())
}

#[tokio::test]
async fn test_refresh_rejected_fails_without_publishing() -> Result<()> {
    let server = MockServer::start().await;
    mount_refresh(
        &server,
        ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Refresh token is invalid or expired.",
            "log_id": "log-3"
        })),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/post/publish/video/init/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let s = setup_with_token(&server, true).await?;

    let report = s.coordinator.publish_now(&s.post_id, "creator").await?;

    assert_eq!(report.status, PostStatus::Failed);
    assert_eq!(
        report.results[0].error(),
        Some("Token refresh failed: Refresh token is invalid or expired.")
    );
    let sub = &s.db.platform_posts_for_post(&s.post_id).await?[0];
    assert_eq!(sub.status, PlatformPostStatus::Failed);
    Ok(())
}
