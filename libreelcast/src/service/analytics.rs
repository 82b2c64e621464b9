//! Analytics sync
//!
//! Pulls vendor metrics for a user's published sub-posts and stores one
//! snapshot per sub-post per sync. A sub-post that yields nothing (no
//! account, no adapter, vendor error, empty answer) is reported in the
//! result and the sync moves on; only database errors stop it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::accounts::{needs_refresh, AccountService};
use super::publishing::NO_ACCOUNT_ERROR;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::{CryptoError, ReelcastError, Result};
use crate::platforms::{AdapterRegistry, PostInsights};
use crate::types::{AnalyticsSnapshot, Platform, PlatformPost};

pub const NO_DATA_ERROR: &str = "No analytics data returned";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced { insights: PostInsights },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub platform_post_id: String,
    pub post_id: String,
    pub platform: Platform,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub total: usize,
    pub results: Vec<SyncResult>,
}

/// Sums over the latest snapshot of each sub-post on one platform
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlatformTotals {
    pub posts: usize,
    pub views: i64,
    pub likes: i64,
    pub comments: i64,
    pub shares: i64,
    /// Mean over the snapshots that carry a rate
    pub engagement_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsOverview {
    pub totals: PlatformTotals,
    pub platforms: BTreeMap<Platform, PlatformTotals>,
    pub last_synced_at: Option<i64>,
}

#[derive(Clone)]
pub struct AnalyticsService {
    db: Arc<Database>,
    adapters: AdapterRegistry,
    cipher: std::result::Result<Arc<TokenCipher>, CryptoError>,
    accounts: AccountService,
}

impl AnalyticsService {
    pub fn new(
        db: Arc<Database>,
        adapters: AdapterRegistry,
        cipher: std::result::Result<TokenCipher, CryptoError>,
    ) -> Self {
        let cipher = cipher.map(Arc::new);
        Self {
            accounts: AccountService::with_shared_cipher(db.clone(), cipher.clone()),
            db,
            adapters,
            cipher,
        }
    }

    /// Fetch metrics for the user's published sub-posts, or only `ids` when
    /// given. Ids that are not the user's, not published or have no vendor
    /// id are ignored.
    pub async fn sync(&self, user_id: &str, ids: &[String]) -> Result<SyncReport> {
        let targets = self.db.published_platform_posts(user_id, ids).await?;
        info!(user_id, count = targets.len(), "syncing analytics");

        let mut report = SyncReport {
            total: targets.len(),
            ..Default::default()
        };
        for platform_post in &targets {
            let outcome = match self.sync_one(user_id, platform_post).await? {
                Ok(insights) => {
                    report.synced += 1;
                    SyncOutcome::Synced { insights }
                }
                Err(error) => {
                    warn!(
                        platform = %platform_post.platform,
                        platform_post_id = %platform_post.id,
                        error = %error,
                        "analytics sync failed"
                    );
                    SyncOutcome::Failed { error }
                }
            };
            report.results.push(SyncResult {
                platform_post_id: platform_post.id.clone(),
                post_id: platform_post.post_id.clone(),
                platform: platform_post.platform,
                outcome,
            });
        }

        info!(user_id, synced = report.synced, total = report.total, "analytics sync finished");
        Ok(report)
    }

    /// Outer error: database. Inner error: why this sub-post got no snapshot.
    async fn sync_one(
        &self,
        user_id: &str,
        platform_post: &PlatformPost,
    ) -> Result<std::result::Result<PostInsights, String>> {
        let platform = platform_post.platform;
        let Some(external_id) = platform_post.external_post_id.as_deref() else {
            return Ok(Err("Sub-post has no external id".to_string()));
        };
        let Some(mut account) = self.db.resolve_account(user_id, platform).await? else {
            return Ok(Err(NO_ACCOUNT_ERROR.to_string()));
        };
        let Some(adapter) = self.adapters.get(platform) else {
            return Ok(Err(format!("{} analytics not yet implemented", platform)));
        };

        if needs_refresh(&account, chrono::Utc::now().timestamp()) {
            match self.accounts.refresh(&account, adapter.as_ref()).await {
                Ok(Some(updated)) => account = updated,
                Ok(None) => {}
                Err(ReelcastError::Platform(error)) => {
                    return Ok(Err(format!("Token refresh failed: {}", error.detail())))
                }
                Err(ReelcastError::Crypto(error)) => return Ok(Err(error.to_string())),
                Err(error) => return Err(error),
            }
        }

        let token = match &self.cipher {
            Ok(cipher) => cipher.decrypt(&account.token_encrypted),
            Err(error) => Err(error.clone()),
        };
        let access_token = match token {
            Ok(token) => token,
            Err(error) => return Ok(Err(error.to_string())),
        };

        let insights = match adapter.fetch_insights(&access_token, external_id).await {
            Ok(Some(insights)) => insights,
            Ok(None) => return Ok(Err(NO_DATA_ERROR.to_string())),
            Err(error) => return Ok(Err(error.detail().to_string())),
        };

        let snapshot = AnalyticsSnapshot::new(&platform_post.id, platform, insights);
        self.db.insert_analytics_snapshot(&snapshot).await?;
        debug!(platform = %platform, platform_post_id = %platform_post.id, "snapshot stored");
        Ok(Ok(snapshot.insights))
    }

    /// Totals over the latest stored snapshot of each of the user's sub-posts
    pub async fn overview(&self, user_id: &str) -> Result<AnalyticsOverview> {
        let latest = self.db.latest_analytics(user_id).await?;

        let mut overview = AnalyticsOverview {
            last_synced_at: latest.iter().map(|s| s.fetched_at).max(),
            ..Default::default()
        };
        let mut rates: BTreeMap<Option<Platform>, Vec<f64>> = BTreeMap::new();
        for snapshot in &latest {
            add(&mut overview.totals, &snapshot.insights);
            add(
                overview.platforms.entry(snapshot.platform).or_default(),
                &snapshot.insights,
            );
            if let Some(rate) = snapshot.insights.engagement_rate {
                rates.entry(None).or_default().push(rate);
                rates.entry(Some(snapshot.platform)).or_default().push(rate);
            }
        }

        overview.totals.engagement_rate = rates.get(&None).map(|r| mean(r));
        for (platform, totals) in overview.platforms.iter_mut() {
            totals.engagement_rate = rates.get(&Some(*platform)).map(|r| mean(r));
        }
        Ok(overview)
    }
}

fn add(totals: &mut PlatformTotals, insights: &PostInsights) {
    totals.posts += 1;
    totals.views += insights.views.unwrap_or(0);
    totals.likes += insights.likes.unwrap_or(0);
    totals.comments += insights.comments.unwrap_or(0);
    totals.shares += insights.shares.unwrap_or(0);
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key;
    use crate::error::PlatformError;
    use crate::platforms::mock::MockAdapter;
    use crate::service::accounts::NewAccount;
    use crate::types::{Asset, PlatformPostStatus, Post, PostContext};
    use secrecy::SecretString;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        key: String,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let db = Arc::new(Database::new(db_path.to_str().unwrap()).await.unwrap());
        Fixture {
            _dir: dir,
            db,
            key: generate_key(),
        }
    }

    impl Fixture {
        fn service(&self, adapters: &[&MockAdapter]) -> AnalyticsService {
            let mut registry = AdapterRegistry::new();
            for adapter in adapters {
                registry.register(Arc::new((*adapter).clone()));
            }
            AnalyticsService::new(self.db.clone(), registry, TokenCipher::new(&self.key))
        }

        async fn connect(&self, platform: Platform) {
            AccountService::new(self.db.clone(), TokenCipher::new(&self.key))
                .connect(NewAccount {
                    user_id: "user-1".to_string(),
                    platform,
                    external_account_id: format!("{}-account", platform),
                    display_name: None,
                    access_token: SecretString::from("token".to_string()),
                    refresh_token: None,
                    expires_at: None,
                    scopes: vec![],
                    metadata: serde_json::json!({}),
                })
                .await
                .unwrap();
        }

        /// A post with one published sub-post per platform
        async fn published(&self, platforms: &[Platform]) -> Vec<PlatformPost> {
            let asset = Asset::new("user-1", Some("https://cdn/v.mp4".to_string()), None);
            self.db.create_asset(&asset).await.unwrap();
            let post = Post::new("user-1", Some(asset.id.clone()), PostContext::default());
            self.db.create_post(&post).await.unwrap();

            let mut subs = Vec::new();
            for platform in platforms {
                let sub = PlatformPost::new(&post.id, *platform);
                self.db.create_platform_post(&sub).await.unwrap();
                self.db
                    .claim_platform_post(&sub.id, &[PlatformPostStatus::Draft], 10)
                    .await
                    .unwrap();
                self.db
                    .mark_platform_post_published(&sub.id, &format!("{}-ext", platform), None, 11)
                    .await
                    .unwrap();
                subs.push(self.db.get_platform_post(&sub.id).await.unwrap().unwrap());
            }
            subs
        }
    }

    fn insights(likes: i64, views: i64, rate: f64) -> PostInsights {
        PostInsights {
            likes: Some(likes),
            views: Some(views),
            engagement_rate: Some(rate),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sync_stores_snapshots_and_reports_failures() {
        let f = fixture().await;
        f.connect(Platform::Instagram).await;
        f.connect(Platform::Tiktok).await;
        let subs = f
            .published(&[Platform::Instagram, Platform::Tiktok, Platform::Facebook])
            .await;

        let instagram =
            MockAdapter::success(Platform::Instagram).with_insights(Ok(insights(10, 200, 5.0)));
        let tiktok = MockAdapter::success(Platform::Tiktok).with_insights(Err(
            PlatformError::RateLimit("Rate limit exceeded".to_string()),
        ));
        let facebook = MockAdapter::success(Platform::Facebook);

        let report = f
            .service(&[&instagram, &tiktok, &facebook])
            .sync("user-1", &[])
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.synced, 1);
        let outcome_of = |platform| {
            report
                .results
                .iter()
                .find(|r| r.platform == platform)
                .map(|r| r.outcome.clone())
                .unwrap()
        };
        assert_eq!(
            outcome_of(Platform::Instagram),
            SyncOutcome::Synced {
                insights: insights(10, 200, 5.0)
            }
        );
        assert_eq!(
            outcome_of(Platform::Tiktok),
            SyncOutcome::Failed {
                error: "Rate limit exceeded".to_string()
            }
        );
        assert_eq!(
            outcome_of(Platform::Facebook),
            SyncOutcome::Failed {
                error: NO_ACCOUNT_ERROR.to_string()
            }
        );
        assert_eq!(instagram.insight_lookups(), vec!["instagram-ext".to_string()]);
        assert!(facebook.insight_lookups().is_empty());

        let latest = f.db.latest_analytics("user-1").await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].platform_post_id, subs[0].id);
    }

    #[tokio::test]
    async fn test_sync_selected_ids_and_empty_answer() {
        let f = fixture().await;
        f.connect(Platform::Facebook).await;
        let first = f.published(&[Platform::Facebook]).await;
        let _second = f.published(&[Platform::Facebook]).await;

        let facebook = MockAdapter::success(Platform::Facebook);
        let report = f
            .service(&[&facebook])
            .sync("user-1", &[first[0].id.clone()])
            .await
            .unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(
            report.results[0].outcome,
            SyncOutcome::Failed {
                error: NO_DATA_ERROR.to_string()
            }
        );
        assert_eq!(facebook.insight_lookups().len(), 1);

        let none = f.service(&[&facebook]).sync("user-2", &[]).await.unwrap();
        assert_eq!(none, SyncReport::default());
    }

    #[tokio::test]
    async fn test_overview_uses_latest_snapshot_per_sub_post() {
        let f = fixture().await;
        f.connect(Platform::Instagram).await;
        f.connect(Platform::Tiktok).await;
        f.published(&[Platform::Instagram, Platform::Tiktok]).await;

        let service_with = |ig: PostInsights, tt: PostInsights| {
            f.service(&[
                &MockAdapter::success(Platform::Instagram).with_insights(Ok(ig)),
                &MockAdapter::success(Platform::Tiktok).with_insights(Ok(tt)),
            ])
        };
        service_with(insights(1, 10, 1.0), insights(1, 10, 1.0))
            .sync("user-1", &[])
            .await
            .unwrap();
        service_with(insights(10, 100, 4.0), insights(30, 1000, 2.0))
            .sync("user-1", &[])
            .await
            .unwrap();

        let overview = f.service(&[]).overview("user-1").await.unwrap();
        assert_eq!(overview.totals.posts, 2);
        assert_eq!(overview.totals.likes, 40);
        assert_eq!(overview.totals.views, 1100);
        assert_eq!(overview.totals.engagement_rate, Some(3.0));
        assert_eq!(overview.platforms[&Platform::Tiktok].likes, 30);
        assert_eq!(overview.platforms[&Platform::Instagram].engagement_rate, Some(4.0));
        assert!(overview.last_synced_at.is_some());

        let empty = f.service(&[]).overview("user-2").await.unwrap();
        assert_eq!(empty, AnalyticsOverview::default());
    }
}
