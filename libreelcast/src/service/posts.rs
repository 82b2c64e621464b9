//! Post lifecycle: drafts, captions, scheduling, cancel, delete, queue view
//!
//! Every operation is scoped to the owning user; someone else's post looks
//! exactly like a missing one.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::capabilities::{CapabilityRegistry, VideoFacts};
use crate::db::{Database, PostFilter, PostWithPlatforms};
use crate::error::{ReelcastError, Result};
use crate::reconcile::stale_status_fix;
use crate::scheduling::DEFAULT_TIMEZONE;
use crate::types::{Platform, PlatformPost, PlatformPostStatus, Post, PostContext, PostStatus};

/// One row of the upcoming-posts view
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub post: Post,
    pub platforms: Vec<(Platform, PlatformPostStatus)>,
}

#[derive(Clone)]
pub struct PostService {
    db: Arc<Database>,
    capabilities: Arc<CapabilityRegistry>,
}

impl PostService {
    pub fn new(db: Arc<Database>, capabilities: Arc<CapabilityRegistry>) -> Self {
        Self { db, capabilities }
    }

    /// Create a draft post with one draft sub-post per platform
    pub async fn create_draft(
        &self,
        user_id: &str,
        asset_id: Option<&str>,
        context: PostContext,
        platforms: &[Platform],
    ) -> Result<PostWithPlatforms> {
        if platforms.is_empty() {
            return Err(ReelcastError::InvalidInput(
                "Select at least one platform".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for platform in platforms {
            if !seen.insert(*platform) {
                return Err(ReelcastError::InvalidInput(format!(
                    "Duplicate platform: {}",
                    platform
                )));
            }
        }

        if let Some(asset_id) = asset_id {
            let asset = match self.db.get_asset(asset_id).await? {
                Some(asset) if asset.user_id == user_id => asset,
                _ => {
                    return Err(ReelcastError::NotFound(format!(
                        "Asset not found: {}",
                        asset_id
                    )))
                }
            };

            let facts = VideoFacts {
                mime_type: asset.mime_type.as_deref(),
                ..Default::default()
            };
            let violations: Vec<String> = platforms
                .iter()
                .flat_map(|platform| self.capabilities.validate_video(*platform, &facts))
                .collect();
            if !violations.is_empty() {
                return Err(ReelcastError::InvalidInput(violations.join("; ")));
            }
        }

        let post = Post::new(user_id, asset_id.map(str::to_string), context);
        self.db.create_post(&post).await?;

        let mut platform_posts = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let platform_post = PlatformPost::new(&post.id, *platform);
            self.db.create_platform_post(&platform_post).await?;
            platform_posts.push(platform_post);
        }

        info!(post_id = %post.id, count = platform_posts.len(), "draft created");
        Ok(PostWithPlatforms {
            post,
            platform_posts,
        })
    }

    /// Set the caption that will be published on `platform`
    pub async fn select_caption(
        &self,
        post_id: &str,
        user_id: &str,
        platform: Platform,
        caption: &str,
    ) -> Result<()> {
        self.owned(post_id, user_id).await?;

        let report = self.capabilities.validate_caption(platform, caption);
        if report.char_count > report.max_chars {
            return Err(ReelcastError::InvalidInput(format!(
                "Caption exceeds {} characters",
                report.max_chars
            )));
        }
        if report.hashtag_count > report.max_hashtags {
            return Err(ReelcastError::InvalidInput(format!(
                "Caption has {} hashtags, {} allows at most {}",
                report.hashtag_count, platform, report.max_hashtags
            )));
        }

        let now = chrono::Utc::now().timestamp();
        if !self.db.set_caption(post_id, platform, caption, now).await? {
            return Err(ReelcastError::NotFound(format!(
                "{} is not selected for this post",
                platform
            )));
        }
        Ok(())
    }

    /// Schedule the post and all its sub-posts for `at` (Unix seconds)
    pub async fn schedule(
        &self,
        post_id: &str,
        user_id: &str,
        at: i64,
        timezone: Option<&str>,
    ) -> Result<()> {
        let post = self.owned(post_id, user_id).await?;
        if !matches!(post.status, PostStatus::Draft | PostStatus::Scheduled) {
            return Err(ReelcastError::InvalidInput(format!(
                "Cannot schedule a post that is {}",
                post.status
            )));
        }

        let now = chrono::Utc::now().timestamp();
        if at <= now {
            return Err(ReelcastError::InvalidInput(
                "Scheduled time must be in the future".to_string(),
            ));
        }
        if self.db.platform_posts_for_post(post_id).await?.is_empty() {
            return Err(ReelcastError::InvalidInput(
                "No platforms selected for this post".to_string(),
            ));
        }

        let timezone = timezone
            .map(str::trim)
            .filter(|tz| !tz.is_empty())
            .unwrap_or(DEFAULT_TIMEZONE);
        self.db.schedule_post(post_id, at, timezone, now).await?;

        info!(post_id, at, timezone, "post scheduled");
        Ok(())
    }

    /// Cancel the post. Sub-posts that already went out stay published; an
    /// attempt in flight finishes but nothing new is started. If that attempt
    /// fails the post stays canceled; if it publishes, that is recorded.
    pub async fn cancel(&self, post_id: &str, user_id: &str) -> Result<()> {
        let post = self.owned(post_id, user_id).await?;
        if matches!(
            post.status,
            PostStatus::Published
                | PostStatus::Failed
                | PostStatus::PartiallyPublished
                | PostStatus::Canceled
        ) {
            return Err(ReelcastError::InvalidInput(format!(
                "Cannot cancel a post that is {}",
                post.status
            )));
        }

        self.db
            .cancel_post(post_id, chrono::Utc::now().timestamp())
            .await?;
        info!(post_id, "post canceled");
        Ok(())
    }

    /// Delete the post and its sub-posts. Deleting a missing post succeeds.
    pub async fn delete(&self, post_id: &str, user_id: &str) -> Result<()> {
        let Some(post) = self.db.get_post_for_user(post_id, user_id).await? else {
            return Ok(());
        };
        if post.status == PostStatus::Publishing {
            return Err(ReelcastError::InvalidInput(
                "Cannot delete a post while it is publishing".to_string(),
            ));
        }

        self.db.delete_post(post_id).await?;
        info!(post_id, "post deleted");
        Ok(())
    }

    /// The post with its sub-posts, repairing a stale in-flight status first
    pub async fn get(&self, post_id: &str, user_id: &str) -> Result<PostWithPlatforms> {
        let mut post = self.owned(post_id, user_id).await?;
        let platform_posts = self.db.platform_posts_for_post(post_id).await?;

        let statuses: Vec<PlatformPostStatus> = platform_posts.iter().map(|pp| pp.status).collect();
        if let Some(fixed) = stale_status_fix(post.status, &statuses) {
            let now = chrono::Utc::now().timestamp();
            if self
                .db
                .transition_post_status(post_id, &[post.status], fixed, now)
                .await?
            {
                info!(post_id, from = %post.status, to = %fixed, "repaired stale post status");
                post.status = fixed;
                post.updated_at = now;
            }
        }

        Ok(PostWithPlatforms {
            post,
            platform_posts,
        })
    }

    /// The user's upcoming and in-flight posts, soonest first
    pub async fn queue(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        let posts = self
            .db
            .list_posts(&PostFilter {
                user_id: Some(user_id.to_string()),
                statuses: vec![
                    PostStatus::Scheduled,
                    PostStatus::Queued,
                    PostStatus::Publishing,
                ],
                limit: None,
            })
            .await?;

        let mut entries = Vec::with_capacity(posts.len());
        for post in posts {
            let platforms = self
                .db
                .platform_posts_for_post(&post.id)
                .await?
                .into_iter()
                .map(|pp| (pp.platform, pp.status))
                .collect();
            entries.push(QueueEntry { post, platforms });
        }
        Ok(entries)
    }

    async fn owned(&self, post_id: &str, user_id: &str) -> Result<Post> {
        self.db
            .get_post_for_user(post_id, user_id)
            .await?
            .ok_or_else(|| ReelcastError::NotFound(format!("Post not found: {}", post_id)))
    }
}
