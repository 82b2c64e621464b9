//! Database operations for Reelcast
//!
//! All status transitions that can race (the publish claim, the attempt's
//! outcome, the conditional failure used for missing prerequisites, the
//! parent entering `publishing`) are single `UPDATE ... WHERE status IN (...)`
//! statements, so SQLite's row-level atomicity is the only lock.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::error::{DbError, Result};
use crate::platforms::PostInsights;
use crate::reconcile::reconcile;
use crate::types::{
    AnalyticsSnapshot, Asset, ConnectedAccount, OAuthState, Platform, PlatformPost,
    PlatformPostStatus, Post, PostContext, PostStatus,
};

/// A post together with its platform sub-posts
#[derive(Debug, Clone, serde::Serialize)]
pub struct PostWithPlatforms {
    pub post: Post,
    pub platform_posts: Vec<PlatformPost>,
}

/// A scheduled sub-post whose time has come, plus what the batch needs to
/// know about its parent
#[derive(Debug, Clone)]
pub struct DuePlatformPost {
    pub platform_post: PlatformPost,
    pub user_id: String,
    pub post_status: PostStatus,
    pub media_url: Option<String>,
}

/// Filter for [`Database::list_posts`]
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub user_id: Option<String>,
    /// Empty means any status
    pub statuses: Vec<PostStatus>,
    pub limit: Option<u32>,
}

const PLATFORM_POST_COLUMNS: &str = "pp.id, pp.post_id, pp.platform, pp.caption_final, \
     pp.status, pp.scheduled_for, pp.started_at, pp.published_at, pp.external_post_id, \
     pp.external_url, pp.last_error, pp.attempt_count, pp.created_at, pp.updated_at";

const POST_COLUMNS: &str =
    "id, user_id, asset_id, context, status, scheduled_for, timezone, created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, platform, external_account_id, display_name, \
     token_encrypted, refresh_token_encrypted, expires_at, scopes, metadata, is_primary, \
     created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first use
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        tracing::debug!(path = %expanded_path, "database ready");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ----------------------------------------------------------------------
    // Assets
    // ----------------------------------------------------------------------

    pub async fn create_asset(&self, asset: &Asset) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assets (id, user_id, public_url, mime_type, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&asset.id)
        .bind(&asset.user_id)
        .bind(&asset.public_url)
        .bind(&asset.mime_type)
        .bind(asset.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_asset(&self, asset_id: &str) -> Result<Option<Asset>> {
        let row = sqlx::query(
            "SELECT id, user_id, public_url, mime_type, created_at FROM assets WHERE id = ?",
        )
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Asset {
            id: r.get("id"),
            user_id: r.get("user_id"),
            public_url: r.get("public_url"),
            mime_type: r.get("mime_type"),
            created_at: r.get("created_at"),
        }))
    }

    /// Public URL of the post's video, if it has one
    pub async fn media_url_for_post(&self, post_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT a.public_url AS media_url
            FROM posts p
            LEFT JOIN assets a ON a.id = p.asset_id
            WHERE p.id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row
            .and_then(|r| r.get::<Option<String>, _>("media_url"))
            .filter(|url| !url.trim().is_empty()))
    }

    // ----------------------------------------------------------------------
    // Posts
    // ----------------------------------------------------------------------

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let context = encode_json(&post.context)?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, user_id, asset_id, context, status, scheduled_for, timezone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.user_id)
        .bind(&post.asset_id)
        .bind(context)
        .bind(post.status.as_str())
        .bind(post.scheduled_for)
        .bind(&post.timezone)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS))
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_post).transpose()
    }

    /// Fetch a post only if it belongs to `user_id`
    pub async fn get_post_for_user(&self, post_id: &str, user_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM posts WHERE id = ? AND user_id = ?",
            POST_COLUMNS
        ))
        .bind(post_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_post).transpose()
    }

    /// Posts ordered soonest-scheduled first, unscheduled last
    pub async fn list_posts(&self, filter: &PostFilter) -> Result<Vec<Post>> {
        let mut where_clauses = vec!["1=1".to_string()];
        if filter.user_id.is_some() {
            where_clauses.push("user_id = ?".to_string());
        }
        if !filter.statuses.is_empty() {
            where_clauses.push(format!(
                "status IN ({})",
                placeholders(filter.statuses.len())
            ));
        }

        let mut sql = format!(
            "SELECT {} FROM posts WHERE {} \
             ORDER BY scheduled_for IS NULL, scheduled_for ASC, created_at ASC",
            POST_COLUMNS,
            where_clauses.join(" AND ")
        );
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id);
        }
        for status in &filter.statuses {
            query = query.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_post).collect()
    }

    pub async fn get_post_with_platforms(&self, post_id: &str) -> Result<Option<PostWithPlatforms>> {
        let Some(post) = self.get_post(post_id).await? else {
            return Ok(None);
        };
        let platform_posts = self.platform_posts_for_post(post_id).await?;
        Ok(Some(PostWithPlatforms {
            post,
            platform_posts,
        }))
    }

    pub async fn set_post_status(&self, post_id: &str, status: PostStatus, now: i64) -> Result<()> {
        sqlx::query("UPDATE posts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Move the post to `to` only if it is currently in one of `from`
    pub async fn transition_post_status(
        &self,
        post_id: &str,
        from: &[PostStatus],
        to: PostStatus,
        now: i64,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE posts SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(to.as_str()).bind(now).bind(post_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Schedule the post and every one of its sub-posts for `at`
    pub async fn schedule_post(
        &self,
        post_id: &str,
        at: i64,
        timezone: &str,
        now: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE posts SET status = 'scheduled', scheduled_for = ?, timezone = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(timezone)
        .bind(now)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE platform_posts SET status = 'scheduled', scheduled_for = ?, updated_at = ?
            WHERE post_id = ?
            "#,
        )
        .bind(at)
        .bind(now)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Cancel the post and its unpublished sub-posts
    pub async fn cancel_post(&self, post_id: &str, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query("UPDATE posts SET status = 'canceled', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(post_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            UPDATE platform_posts SET status = 'canceled', updated_at = ?
            WHERE post_id = ? AND status != 'published'
            "#,
        )
        .bind(now)
        .bind(post_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Delete a post; sub-posts go with it
    pub async fn delete_post(&self, post_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Recompute the post's aggregate status from its sub-posts and store it.
    ///
    /// A canceled post stays canceled unless one of its sub-posts actually
    /// went out, in which case the published outcome is recorded.
    pub async fn apply_reconciled_status(&self, post_id: &str, now: i64) -> Result<PostStatus> {
        let statuses = self.platform_post_statuses(post_id).await?;
        let status = reconcile(&statuses)?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        if current.as_deref() == Some(PostStatus::Canceled.as_str())
            && !matches!(status, PostStatus::Published | PostStatus::PartiallyPublished)
        {
            return Ok(PostStatus::Canceled);
        }

        self.set_post_status(post_id, status, now).await?;
        Ok(status)
    }

    // ----------------------------------------------------------------------
    // Platform sub-posts
    // ----------------------------------------------------------------------

    pub async fn create_platform_post(&self, platform_post: &PlatformPost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_posts (
                id, post_id, platform, caption_final, status, scheduled_for, started_at,
                published_at, external_post_id, external_url, last_error, attempt_count,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&platform_post.id)
        .bind(&platform_post.post_id)
        .bind(platform_post.platform.as_str())
        .bind(&platform_post.caption_final)
        .bind(platform_post.status.as_str())
        .bind(platform_post.scheduled_for)
        .bind(platform_post.started_at)
        .bind(platform_post.published_at)
        .bind(&platform_post.external_post_id)
        .bind(&platform_post.external_url)
        .bind(&platform_post.last_error)
        .bind(platform_post.attempt_count)
        .bind(platform_post.created_at)
        .bind(platform_post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_platform_post(&self, id: &str) -> Result<Option<PlatformPost>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM platform_posts pp WHERE pp.id = ?",
            PLATFORM_POST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_platform_post).transpose()
    }

    pub async fn platform_posts_for_post(&self, post_id: &str) -> Result<Vec<PlatformPost>> {
        self.platform_posts_with_status(post_id, &[]).await
    }

    /// Sub-posts of `post_id` in any of `statuses` (all of them if empty)
    pub async fn platform_posts_with_status(
        &self,
        post_id: &str,
        statuses: &[PlatformPostStatus],
    ) -> Result<Vec<PlatformPost>> {
        let mut sql = format!(
            "SELECT {} FROM platform_posts pp WHERE pp.post_id = ?",
            PLATFORM_POST_COLUMNS
        );
        if !statuses.is_empty() {
            sql.push_str(&format!(" AND pp.status IN ({})", placeholders(statuses.len())));
        }
        sql.push_str(" ORDER BY pp.created_at ASC, pp.platform ASC");

        let mut query = sqlx::query(&sql).bind(post_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_platform_post).collect()
    }

    pub async fn platform_post_statuses(&self, post_id: &str) -> Result<Vec<PlatformPostStatus>> {
        let rows = sqlx::query("SELECT status FROM platform_posts WHERE post_id = ?")
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| parse_column::<PlatformPostStatus>(r, "status"))
            .collect()
    }

    pub async fn set_caption(
        &self,
        post_id: &str,
        platform: Platform,
        caption: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE platform_posts SET caption_final = ?, updated_at = ?
            WHERE post_id = ? AND platform = ?
            "#,
        )
        .bind(caption)
        .bind(now)
        .bind(post_id)
        .bind(platform.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Move sub-posts of `post_id` currently in `from` to `queued`
    pub async fn queue_platform_posts(
        &self,
        post_id: &str,
        from: &[PlatformPostStatus],
        now: i64,
    ) -> Result<u64> {
        if from.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE platform_posts SET status = 'queued', updated_at = ? \
             WHERE post_id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(now).bind(post_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Take exclusive ownership of one publish attempt.
    ///
    /// Succeeds only if the sub-post is currently in one of `from`; on success
    /// the row is `publishing`, `started_at` is stamped, `attempt_count` is
    /// incremented and the previous error is cleared. Exactly one of any
    /// number of concurrent callers can win.
    pub async fn claim_platform_post(
        &self,
        id: &str,
        from: &[PlatformPostStatus],
        now: i64,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE platform_posts \
             SET status = 'publishing', started_at = ?, attempt_count = attempt_count + 1, \
                 last_error = NULL, updated_at = ? \
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(now).bind(now).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a successful attempt.
    ///
    /// Applies to a row still `publishing`, or one canceled while the vendor
    /// call was in flight: the video is live either way. Returns false if the
    /// row is in neither state.
    pub async fn mark_platform_post_published(
        &self,
        id: &str,
        external_id: &str,
        external_url: Option<&str>,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE platform_posts
            SET status = 'published', external_post_id = ?, external_url = ?,
                published_at = ?, last_error = NULL, updated_at = ?
            WHERE id = ? AND status IN ('publishing', 'canceled')
            "#,
        )
        .bind(external_id)
        .bind(external_url)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a failed attempt. Only a row still `publishing` is touched, so
    /// a cancel that landed mid-attempt is kept.
    pub async fn mark_platform_post_failed(&self, id: &str, error: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE platform_posts SET status = 'failed', last_error = ?, updated_at = ?
            WHERE id = ? AND status = 'publishing'
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark failed without claiming, only if still in one of `from`
    pub async fn fail_platform_post_if(
        &self,
        id: &str,
        from: &[PlatformPostStatus],
        error: &str,
        now: i64,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE platform_posts SET status = 'failed', last_error = ?, updated_at = ? \
             WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql).bind(error).bind(now).bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Scheduled sub-posts due at `now`, oldest first, across all users
    pub async fn due_platform_posts(&self, now: i64, limit: u32) -> Result<Vec<DuePlatformPost>> {
        let sql = format!(
            r#"
            SELECT {}, p.user_id AS owner_id, p.status AS post_status, a.public_url AS media_url
            FROM platform_posts pp
            JOIN posts p ON p.id = pp.post_id
            LEFT JOIN assets a ON a.id = p.asset_id
            WHERE pp.status = 'scheduled'
              AND pp.scheduled_for IS NOT NULL
              AND pp.scheduled_for <= ?
            ORDER BY pp.scheduled_for ASC, pp.created_at ASC
            LIMIT ?
            "#,
            PLATFORM_POST_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(DuePlatformPost {
                    platform_post: row_to_platform_post(r)?,
                    user_id: r.get("owner_id"),
                    post_status: parse_column(r, "post_status")?,
                    media_url: r
                        .get::<Option<String>, _>("media_url")
                        .filter(|url| !url.trim().is_empty()),
                })
            })
            .collect()
    }

    // ----------------------------------------------------------------------
    // Connected accounts
    // ----------------------------------------------------------------------

    /// Insert or refresh an account keyed by (user, platform, external id).
    ///
    /// On conflict the stored id, primary flag and creation time are kept.
    pub async fn upsert_account(&self, account: &ConnectedAccount) -> Result<ConnectedAccount> {
        let scopes = encode_json(&account.scopes)?;
        let metadata = encode_json(&account.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO connected_accounts (
                id, user_id, platform, external_account_id, display_name, token_encrypted,
                refresh_token_encrypted, expires_at, scopes, metadata, is_primary,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, platform, external_account_id) DO UPDATE SET
                display_name = excluded.display_name,
                token_encrypted = excluded.token_encrypted,
                refresh_token_encrypted = excluded.refresh_token_encrypted,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(&account.user_id)
        .bind(account.platform.as_str())
        .bind(&account.external_account_id)
        .bind(&account.display_name)
        .bind(&account.token_encrypted)
        .bind(&account.refresh_token_encrypted)
        .bind(account.expires_at)
        .bind(scopes)
        .bind(metadata)
        .bind(account.is_primary)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM connected_accounts \
             WHERE user_id = ? AND platform = ? AND external_account_id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(&account.user_id)
        .bind(account.platform.as_str())
        .bind(&account.external_account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row_to_account(&row)
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<ConnectedAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM connected_accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn list_accounts(&self, user_id: &str) -> Result<Vec<ConnectedAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM connected_accounts WHERE user_id = ? \
             ORDER BY platform ASC, is_primary DESC, created_at ASC",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_account).collect()
    }

    /// The account to publish with: the primary one, else the oldest
    pub async fn resolve_account(
        &self,
        user_id: &str,
        platform: Platform,
    ) -> Result<Option<ConnectedAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM connected_accounts WHERE user_id = ? AND platform = ? \
             ORDER BY is_primary DESC, created_at ASC, id ASC LIMIT 1",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_account).transpose()
    }

    /// Make `account_id` the user's only primary account for its platform.
    /// Returns false if the account does not exist or belongs to someone else.
    pub async fn set_primary_account(
        &self,
        user_id: &str,
        account_id: &str,
        now: i64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let row = sqlx::query("SELECT platform FROM connected_accounts WHERE id = ? AND user_id = ?")
            .bind(account_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let platform: String = row.get("platform");

        sqlx::query(
            r#"
            UPDATE connected_accounts SET is_primary = (id = ?), updated_at = ?
            WHERE user_id = ? AND platform = ?
            "#,
        )
        .bind(account_id)
        .bind(now)
        .bind(user_id)
        .bind(&platform)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    /// Store credentials from a token refresh. A `None` refresh token keeps
    /// the one already on file.
    pub async fn update_account_tokens(
        &self,
        account_id: &str,
        token_encrypted: &str,
        refresh_token_encrypted: Option<&str>,
        expires_at: Option<i64>,
        now: i64,
    ) -> Result<Option<ConnectedAccount>> {
        let result = sqlx::query(
            r#"
            UPDATE connected_accounts
            SET token_encrypted = ?,
                refresh_token_encrypted = COALESCE(?, refresh_token_encrypted),
                expires_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(token_encrypted)
        .bind(refresh_token_encrypted)
        .bind(expires_at)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_account(account_id).await
    }

    pub async fn delete_account(&self, user_id: &str, account_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM connected_accounts WHERE id = ? AND user_id = ?")
            .bind(account_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ----------------------------------------------------------------------
    // Analytics
    // ----------------------------------------------------------------------

    /// The user's published sub-posts that carry a vendor id, optionally
    /// narrowed to `ids`
    pub async fn published_platform_posts(
        &self,
        user_id: &str,
        ids: &[String],
    ) -> Result<Vec<PlatformPost>> {
        let mut sql = format!(
            "SELECT {} FROM platform_posts pp JOIN posts p ON p.id = pp.post_id \
             WHERE p.user_id = ? AND pp.status = 'published' \
             AND pp.external_post_id IS NOT NULL",
            PLATFORM_POST_COLUMNS
        );
        if !ids.is_empty() {
            sql.push_str(&format!(" AND pp.id IN ({})", placeholders(ids.len())));
        }
        sql.push_str(" ORDER BY pp.published_at DESC, pp.id ASC");

        let mut query = sqlx::query(&sql).bind(user_id);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_platform_post).collect()
    }

    pub async fn insert_analytics_snapshot(&self, snapshot: &AnalyticsSnapshot) -> Result<()> {
        let insights = &snapshot.insights;
        let platform_data = encode_json(&insights.platform_data)?;

        sqlx::query(
            r#"
            INSERT INTO post_analytics (
                id, platform_post_id, platform, views, reach, impressions, likes,
                comments, shares, saves, plays, engagement_rate, platform_data, fetched_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.id)
        .bind(&snapshot.platform_post_id)
        .bind(snapshot.platform.as_str())
        .bind(insights.views)
        .bind(insights.reach)
        .bind(insights.impressions)
        .bind(insights.likes)
        .bind(insights.comments)
        .bind(insights.shares)
        .bind(insights.saves)
        .bind(insights.plays)
        .bind(insights.engagement_rate)
        .bind(platform_data)
        .bind(snapshot.fetched_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// The most recent snapshot of each of the user's sub-posts
    pub async fn latest_analytics(&self, user_id: &str) -> Result<Vec<AnalyticsSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.platform_post_id, a.platform, a.views, a.reach, a.impressions,
                   a.likes, a.comments, a.shares, a.saves, a.plays, a.engagement_rate,
                   a.platform_data, a.fetched_at
            FROM post_analytics a
            JOIN platform_posts pp ON pp.id = a.platform_post_id
            JOIN posts p ON p.id = pp.post_id
            WHERE p.user_id = ?
            ORDER BY a.platform_post_id ASC, a.fetched_at DESC, a.rowid DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let mut latest: Vec<AnalyticsSnapshot> = Vec::new();
        for row in &rows {
            let snapshot = row_to_snapshot(row)?;
            if latest
                .last()
                .is_some_and(|prev| prev.platform_post_id == snapshot.platform_post_id)
            {
                continue;
            }
            latest.push(snapshot);
        }
        Ok(latest)
    }

    // ----------------------------------------------------------------------
    // OAuth state nonces
    // ----------------------------------------------------------------------

    pub async fn insert_oauth_state(&self, state: &OAuthState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_states (state, user_id, platform, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.state)
        .bind(&state.user_id)
        .bind(state.platform.as_str())
        .bind(state.created_at)
        .bind(state.expires_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Remove and return a state nonce; a second take of the same nonce
    /// returns `None`
    pub async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let row = sqlx::query(
            "SELECT state, user_id, platform, created_at, expires_at FROM oauth_states WHERE state = ?",
        )
        .bind(state)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let deleted = sqlx::query("DELETE FROM oauth_states WHERE state = ?")
            .bind(state)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;

        if deleted.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(OAuthState {
            state: row.get("state"),
            user_id: row.get("user_id"),
            platform: parse_column(&row, "platform")?,
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    pub async fn purge_expired_oauth_states(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| DbError::InvalidValue(format!("cannot encode JSON column: {}", e)).into())
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
{
    let raw: String = row.get(column);
    raw.parse::<T>()
        .map_err(|_| DbError::InvalidValue(format!("{} = '{}'", column, raw)).into())
}

fn row_to_post(row: &SqliteRow) -> Result<Post> {
    let context_raw: String = row.get("context");
    let context: PostContext = serde_json::from_str(&context_raw)
        .map_err(|e| DbError::InvalidValue(format!("posts.context: {}", e)))?;

    Ok(Post {
        id: row.get("id"),
        user_id: row.get("user_id"),
        asset_id: row.get("asset_id"),
        context,
        status: parse_column(row, "status")?,
        scheduled_for: row.get("scheduled_for"),
        timezone: row.get("timezone"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_platform_post(row: &SqliteRow) -> Result<PlatformPost> {
    Ok(PlatformPost {
        id: row.get("id"),
        post_id: row.get("post_id"),
        platform: parse_column(row, "platform")?,
        caption_final: row.get("caption_final"),
        status: parse_column(row, "status")?,
        scheduled_for: row.get("scheduled_for"),
        started_at: row.get("started_at"),
        published_at: row.get("published_at"),
        external_post_id: row.get("external_post_id"),
        external_url: row.get("external_url"),
        last_error: row.get("last_error"),
        attempt_count: row.get("attempt_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_account(row: &SqliteRow) -> Result<ConnectedAccount> {
    let scopes_raw: String = row.get("scopes");
    let metadata_raw: String = row.get("metadata");

    Ok(ConnectedAccount {
        id: row.get("id"),
        user_id: row.get("user_id"),
        platform: parse_column(row, "platform")?,
        external_account_id: row.get("external_account_id"),
        display_name: row.get("display_name"),
        token_encrypted: row.get("token_encrypted"),
        refresh_token_encrypted: row.get("refresh_token_encrypted"),
        expires_at: row.get("expires_at"),
        scopes: serde_json::from_str(&scopes_raw)
            .map_err(|e| DbError::InvalidValue(format!("connected_accounts.scopes: {}", e)))?,
        metadata: serde_json::from_str(&metadata_raw)
            .map_err(|e| DbError::InvalidValue(format!("connected_accounts.metadata: {}", e)))?,
        is_primary: row.get("is_primary"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_snapshot(row: &SqliteRow) -> Result<AnalyticsSnapshot> {
    let platform_data_raw: String = row.get("platform_data");

    Ok(AnalyticsSnapshot {
        id: row.get("id"),
        platform_post_id: row.get("platform_post_id"),
        platform: parse_column(row, "platform")?,
        insights: PostInsights {
            views: row.get("views"),
            reach: row.get("reach"),
            impressions: row.get("impressions"),
            likes: row.get("likes"),
            comments: row.get("comments"),
            shares: row.get("shares"),
            saves: row.get("saves"),
            plays: row.get("plays"),
            engagement_rate: row.get("engagement_rate"),
            platform_data: serde_json::from_str(&platform_data_raw)
                .map_err(|e| DbError::InvalidValue(format!("post_analytics.platform_data: {}", e)))?,
        },
        fetched_at: row.get("fetched_at"),
    })
}
