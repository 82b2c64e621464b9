//! Publish coordinator
//!
//! Drives platform sub-posts through their publish attempt, one at a time:
//!
//! 1. resolve the user's account for the platform (primary first),
//! 2. claim the sub-post with a conditional update from the mode's
//!    pre-state; losing the claim means someone else owns the attempt,
//! 3. refresh the token if it is about to expire,
//! 4. decrypt the stored token for this call only,
//! 5. run the adapter with panics caught,
//! 6. record the outcome on the sub-post.
//!
//! After a run the parent's aggregate status is recomputed. A sub-post that
//! fails never stops the ones after it; only database errors propagate, and
//! every outcome recorded before such an error stays recorded.
//!
//! A cancel can land while an attempt is in flight. A failure reported
//! afterwards leaves the cancel in place; a video that went live anyway is
//! recorded as published.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::accounts::{needs_refresh, AccountService};
use super::events::{Event, EventBus};
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::{CryptoError, ReelcastError, Result};
use crate::platforms::{AdapterRegistry, PublishAdapter, PublishReceipt, PublishRequest};
use crate::types::{ConnectedAccount, Platform, PlatformPost, PlatformPostStatus, PostStatus};

pub const NO_ACCOUNT_ERROR: &str = "No connected account found";
pub const NO_MEDIA_ERROR: &str = "No video asset found";

/// Parent states from which "publish now" may start
const PUBLISH_NOW_FROM: [PostStatus; 4] = [
    PostStatus::Draft,
    PostStatus::Scheduled,
    PostStatus::Failed,
    PostStatus::PartiallyPublished,
];

/// Parent states that can hold a failed sub-post worth retrying
const RETRY_FROM: [PostStatus; 5] = [
    PostStatus::Scheduled,
    PostStatus::Queued,
    PostStatus::Publishing,
    PostStatus::PartiallyPublished,
    PostStatus::Failed,
];

/// Which entry point started the run; decides the claim's pre-state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// User pressed "publish now"
    Now,
    /// Retry of failed sub-posts
    Retry,
    /// Due sub-posts picked up by the scheduler
    Scheduled,
}

impl PublishMode {
    pub fn claim_from(&self) -> &'static [PlatformPostStatus] {
        match self {
            PublishMode::Now => &[PlatformPostStatus::Queued],
            PublishMode::Retry => &[PlatformPostStatus::Failed],
            PublishMode::Scheduled => &[PlatformPostStatus::Scheduled],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Published {
        external_id: String,
        url: Option<String>,
    },
    Failed {
        error: String,
    },
    /// Not attempted, or canceled while the attempt was in flight
    Skipped {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformResult {
    pub platform_post_id: String,
    pub post_id: String,
    pub platform: Platform,
    pub outcome: Outcome,
}

impl PlatformResult {
    pub(crate) fn new(platform_post: &PlatformPost, outcome: Outcome) -> Self {
        Self {
            platform_post_id: platform_post.id.clone(),
            post_id: platform_post.post_id.clone(),
            platform: platform_post.platform,
            outcome,
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self.outcome, Outcome::Published { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, Outcome::Skipped { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Result of a publish-now or retry run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub post_id: String,
    pub status: PostStatus,
    pub results: Vec<PlatformResult>,
}

#[derive(Clone)]
pub struct PublishCoordinator {
    db: Arc<Database>,
    adapters: AdapterRegistry,
    cipher: std::result::Result<Arc<TokenCipher>, CryptoError>,
    accounts: AccountService,
    event_bus: EventBus,
}

impl PublishCoordinator {
    /// A cipher error (typically a missing key) is kept and reported on each
    /// sub-post that needs a token, instead of failing construction
    pub fn new(
        db: Arc<Database>,
        adapters: AdapterRegistry,
        cipher: std::result::Result<TokenCipher, CryptoError>,
        event_bus: EventBus,
    ) -> Self {
        let cipher = cipher.map(Arc::new);
        Self {
            accounts: AccountService::with_shared_cipher(db.clone(), cipher.clone()),
            db,
            adapters,
            cipher,
            event_bus,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Publish every pending sub-post of a post immediately.
    ///
    /// The post must be `draft`, `scheduled`, `failed` or
    /// `partially_published`. Sub-posts in `draft`, `scheduled` or `failed`
    /// are queued and attempted; published and canceled ones are left alone.
    pub async fn publish_now(&self, post_id: &str, user_id: &str) -> Result<PublishReport> {
        let post = self
            .db
            .get_post_for_user(post_id, user_id)
            .await?
            .ok_or_else(|| ReelcastError::NotFound(format!("Post not found: {}", post_id)))?;

        if !PUBLISH_NOW_FROM.contains(&post.status) {
            return Err(ReelcastError::InvalidInput(format!(
                "Cannot publish a post that is {}",
                post.status
            )));
        }

        if self.db.platform_posts_for_post(post_id).await?.is_empty() {
            return Err(ReelcastError::InvalidInput(
                "No platforms selected for this post".to_string(),
            ));
        }

        let media_url = self
            .db
            .media_url_for_post(post_id)
            .await?
            .ok_or_else(|| ReelcastError::InvalidInput(NO_MEDIA_ERROR.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        self.enter_publishing(post_id, &PUBLISH_NOW_FROM, "publish", now)
            .await?;
        let queued = self
            .db
            .queue_platform_posts(
                post_id,
                &[
                    PlatformPostStatus::Draft,
                    PlatformPostStatus::Scheduled,
                    PlatformPostStatus::Failed,
                ],
                now,
            )
            .await?;
        debug!(post_id, queued, "queued sub-posts for immediate publish");

        let targets = self
            .db
            .platform_posts_with_status(post_id, &[PlatformPostStatus::Queued])
            .await?;

        self.run(post_id, user_id, &media_url, &targets, PublishMode::Now)
            .await
    }

    /// Retry failed sub-posts, optionally only those on `platforms`
    pub async fn retry(
        &self,
        post_id: &str,
        user_id: &str,
        platforms: Option<&[Platform]>,
    ) -> Result<PublishReport> {
        let post = self
            .db
            .get_post_for_user(post_id, user_id)
            .await?
            .ok_or_else(|| ReelcastError::NotFound(format!("Post not found: {}", post_id)))?;

        if !RETRY_FROM.contains(&post.status) {
            return Err(ReelcastError::InvalidInput(format!(
                "Cannot retry a post that is {}",
                post.status
            )));
        }

        let targets: Vec<PlatformPost> = self
            .db
            .platform_posts_with_status(post_id, &[PlatformPostStatus::Failed])
            .await?
            .into_iter()
            .filter(|pp| platforms.map_or(true, |wanted| wanted.contains(&pp.platform)))
            .collect();

        if targets.is_empty() {
            return Err(ReelcastError::InvalidInput(
                "No failed platforms to retry".to_string(),
            ));
        }

        let media_url = self
            .db
            .media_url_for_post(post_id)
            .await?
            .ok_or_else(|| ReelcastError::InvalidInput(NO_MEDIA_ERROR.to_string()))?;

        self.enter_publishing(post_id, &RETRY_FROM, "retry", chrono::Utc::now().timestamp())
            .await?;

        self.run(post_id, user_id, &media_url, &targets, PublishMode::Retry)
            .await
    }

    /// Move the parent to `publishing`, unless it left `from` since it was read
    async fn enter_publishing(
        &self,
        post_id: &str,
        from: &[PostStatus],
        action: &str,
        now: i64,
    ) -> Result<()> {
        if self
            .db
            .transition_post_status(post_id, from, PostStatus::Publishing, now)
            .await?
        {
            return Ok(());
        }

        let current = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| ReelcastError::NotFound(format!("Post not found: {}", post_id)))?;
        Err(ReelcastError::InvalidInput(format!(
            "Cannot {} a post that is {}",
            action, current.status
        )))
    }

    async fn run(
        &self,
        post_id: &str,
        user_id: &str,
        media_url: &str,
        targets: &[PlatformPost],
        mode: PublishMode,
    ) -> Result<PublishReport> {
        info!(post_id, ?mode, count = targets.len(), "publishing post");
        self.event_bus.emit(Event::PublishStarted {
            post_id: post_id.to_string(),
            platforms: targets.iter().map(|pp| pp.platform).collect(),
        });

        let mut results = Vec::with_capacity(targets.len());
        for platform_post in targets {
            results.push(
                self.publish_platform_post(platform_post, user_id, media_url, mode)
                    .await?,
            );
        }

        let status = self.finish(post_id).await?;
        Ok(PublishReport {
            post_id: post_id.to_string(),
            status,
            results,
        })
    }

    /// Reconcile and store the parent's aggregate status
    pub async fn finish(&self, post_id: &str) -> Result<PostStatus> {
        let status = self
            .db
            .apply_reconciled_status(post_id, chrono::Utc::now().timestamp())
            .await?;
        info!(post_id, status = %status, "post status reconciled");
        self.event_bus.emit(Event::PublishCompleted {
            post_id: post_id.to_string(),
            status,
        });
        Ok(status)
    }

    /// One attempt at one sub-post. Never fails for platform reasons; the
    /// outcome is in the returned result and on the row.
    pub async fn publish_platform_post(
        &self,
        platform_post: &PlatformPost,
        user_id: &str,
        media_url: &str,
        mode: PublishMode,
    ) -> Result<PlatformResult> {
        let from = mode.claim_from();
        let platform = platform_post.platform;

        let Some(account) = self.db.resolve_account(user_id, platform).await? else {
            let now = chrono::Utc::now().timestamp();
            if !self
                .db
                .fail_platform_post_if(&platform_post.id, from, NO_ACCOUNT_ERROR, now)
                .await?
            {
                return Ok(self.skipped(platform_post, mode));
            }
            warn!(platform = %platform, platform_post_id = %platform_post.id, "no connected account");
            return Ok(self.failed(platform_post, NO_ACCOUNT_ERROR.to_string()));
        };

        let now = chrono::Utc::now().timestamp();
        if !self.db.claim_platform_post(&platform_post.id, from, now).await? {
            return Ok(self.skipped(platform_post, mode));
        }
        self.event_bus.emit(Event::PlatformClaimed {
            post_id: platform_post.post_id.clone(),
            platform_post_id: platform_post.id.clone(),
            platform,
            attempt: platform_post.attempt_count + 1,
        });

        let Some(adapter) = self.adapters.get(platform) else {
            return self
                .record_failure(
                    platform_post,
                    format!("{} publishing not yet implemented", platform),
                )
                .await;
        };

        let account = match self.ensure_fresh(account, adapter.as_ref(), now).await {
            Ok(account) => account,
            Err(error) => {
                return self
                    .record_failure(platform_post, format!("Token refresh failed: {}", error))
                    .await
            }
        };

        let token = match &self.cipher {
            Ok(cipher) => cipher.decrypt(&account.token_encrypted),
            Err(error) => Err(error.clone()),
        };
        let access_token = match token {
            Ok(token) => token,
            Err(error) => return self.record_failure(platform_post, error.to_string()).await,
        };

        let request = PublishRequest {
            access_token,
            account_id: account.external_account_id.clone(),
            media_url: media_url.to_string(),
            caption: platform_post.caption_final.clone().unwrap_or_default(),
        };

        let outcome = AssertUnwindSafe(adapter.publish(&request))
            .catch_unwind()
            .await;
        drop(request);

        match outcome {
            Ok(Ok(receipt)) => self.record_success(platform_post, receipt).await,
            Ok(Err(error)) => self.record_failure(platform_post, error.detail().to_string()).await,
            Err(panic) => {
                self.record_failure(
                    platform_post,
                    format!("Adapter panicked: {}", panic_message(&*panic)),
                )
                .await
            }
        }
    }

    /// The account as it should be used now: refreshed first if its token is
    /// expired or about to be
    async fn ensure_fresh(
        &self,
        account: ConnectedAccount,
        adapter: &dyn PublishAdapter,
        now: i64,
    ) -> std::result::Result<ConnectedAccount, String> {
        if !needs_refresh(&account, now) {
            return Ok(account);
        }

        let refreshed = AssertUnwindSafe(self.accounts.refresh(&account, adapter))
            .catch_unwind()
            .await;
        match refreshed {
            Ok(Ok(Some(updated))) => Ok(updated),
            Ok(Ok(None)) => Ok(account),
            Ok(Err(ReelcastError::Platform(error))) => Err(error.detail().to_string()),
            Ok(Err(error)) => Err(error.to_string()),
            Err(panic) => Err(format!("Adapter panicked: {}", panic_message(&*panic))),
        }
    }

    async fn record_success(
        &self,
        platform_post: &PlatformPost,
        receipt: PublishReceipt,
    ) -> Result<PlatformResult> {
        let recorded = self
            .db
            .mark_platform_post_published(
                &platform_post.id,
                &receipt.external_id,
                receipt.permalink_url.as_deref(),
                chrono::Utc::now().timestamp(),
            )
            .await?;
        if !recorded {
            warn!(
                platform_post_id = %platform_post.id,
                external_id = %receipt.external_id,
                "published, but the sub-post left publishing during the attempt"
            );
        }

        info!(
            platform = %platform_post.platform,
            platform_post_id = %platform_post.id,
            external_id = %receipt.external_id,
            "published"
        );
        self.event_bus.emit(Event::PlatformPublished {
            post_id: platform_post.post_id.clone(),
            platform_post_id: platform_post.id.clone(),
            platform: platform_post.platform,
            external_id: receipt.external_id.clone(),
            url: receipt.permalink_url.clone(),
        });

        Ok(PlatformResult::new(
            platform_post,
            Outcome::Published {
                external_id: receipt.external_id,
                url: receipt.permalink_url,
            },
        ))
    }

    async fn record_failure(
        &self,
        platform_post: &PlatformPost,
        error: String,
    ) -> Result<PlatformResult> {
        if !self
            .db
            .mark_platform_post_failed(&platform_post.id, &error, chrono::Utc::now().timestamp())
            .await?
        {
            info!(
                platform = %platform_post.platform,
                platform_post_id = %platform_post.id,
                error = %error,
                "attempt failed after the sub-post was canceled"
            );
            return Ok(PlatformResult::new(
                platform_post,
                Outcome::Skipped {
                    reason: format!("Canceled during attempt ({})", error),
                },
            ));
        }

        warn!(
            platform = %platform_post.platform,
            platform_post_id = %platform_post.id,
            error = %error,
            "publish failed"
        );
        Ok(self.failed(platform_post, error))
    }

    fn failed(&self, platform_post: &PlatformPost, error: String) -> PlatformResult {
        self.event_bus.emit(Event::PlatformFailed {
            post_id: platform_post.post_id.clone(),
            platform_post_id: platform_post.id.clone(),
            platform: platform_post.platform,
            error: error.clone(),
        });
        PlatformResult::new(platform_post, Outcome::Failed { error })
    }

    fn skipped(&self, platform_post: &PlatformPost, mode: PublishMode) -> PlatformResult {
        debug!(
            platform = %platform_post.platform,
            platform_post_id = %platform_post.id,
            "claim lost"
        );
        PlatformResult::new(
            platform_post,
            Outcome::Skipped {
                reason: format!(
                    "No longer {}",
                    mode.claim_from()
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(" or ")
                ),
            },
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
