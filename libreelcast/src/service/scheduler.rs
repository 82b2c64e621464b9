//! Scheduler trigger
//!
//! Entry point for the periodic scan over due sub-posts across all users.
//! Callers authenticate with either the cron provider's secret header or a
//! bearer token; each run processes at most `batch_size` sub-posts, oldest
//! first, `concurrency` at a time, and reports a summary instead of failing
//! as a whole.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::publishing::{Outcome, PlatformResult, PublishCoordinator, PublishMode, NO_MEDIA_ERROR};
use crate::config::{Environment, SchedulerConfig};
use crate::db::DuePlatformPost;
use crate::error::{ReelcastError, Result};
use crate::types::{PlatformPostStatus, PostStatus};

/// Header the hosting platform's cron sends its secret in
pub const CRON_HEADER: &str = "x-vercel-cron";

/// Parent states in which a due sub-post may still be published
const PUBLISHABLE_PARENT: [PostStatus; 4] = [
    PostStatus::Scheduled,
    PostStatus::Queued,
    PostStatus::Publishing,
    PostStatus::PartiallyPublished,
];

/// Credentials presented by whoever invokes the trigger
#[derive(Debug, Clone, Default)]
pub struct TriggerCredentials {
    /// Value of the [`CRON_HEADER`] header
    pub cron_header: Option<String>,
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
}

impl TriggerCredentials {
    pub fn bearer(token: &str) -> Self {
        Self {
            cron_header: None,
            authorization: Some(format!("Bearer {}", token)),
        }
    }

    pub fn cron(secret: &str) -> Self {
        Self {
            cron_header: Some(secret.to_string()),
            authorization: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<PlatformResult>,
}

impl BatchSummary {
    fn push(&mut self, result: PlatformResult) {
        self.processed += 1;
        match &result.outcome {
            Outcome::Published { .. } => self.succeeded += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
        }
        self.results.push(result);
    }
}

#[derive(Clone)]
pub struct SchedulerTrigger {
    coordinator: PublishCoordinator,
    config: SchedulerConfig,
}

impl SchedulerTrigger {
    pub fn new(coordinator: PublishCoordinator, config: SchedulerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Check the caller's credentials.
    ///
    /// An unset or empty secret never matches. Outside production an
    /// unauthenticated call is let through with a warning.
    pub fn authorize(&self, credentials: &TriggerCredentials) -> Result<()> {
        let cron_ok = secret_matches(
            self.config.cron_secret.as_deref(),
            credentials.cron_header.as_deref(),
        );
        let bearer_ok = secret_matches(
            self.config.scheduler_secret.as_deref(),
            credentials
                .authorization
                .as_deref()
                .and_then(|value| value.strip_prefix("Bearer ")),
        );

        if cron_ok || bearer_ok {
            return Ok(());
        }

        if self.config.environment == Environment::Production {
            warn!("rejected unauthenticated scheduler trigger");
            return Err(ReelcastError::Unauthorized(
                "Invalid or missing scheduler credentials".to_string(),
            ));
        }

        warn!(
            environment = ?self.config.environment,
            "unauthenticated scheduler trigger allowed outside production"
        );
        Ok(())
    }

    /// Process the sub-posts due at `now`.
    ///
    /// Up to `concurrency` sub-posts are attempted at once. Every parent
    /// touched by the batch is reconciled once, after all its sub-posts in
    /// the batch have finished. A database error on one sub-post does not
    /// abandon the others: the whole batch is drained and reconciled before
    /// the first such error is returned.
    pub async fn run(&self, now: i64) -> Result<BatchSummary> {
        let db = self.coordinator.database();
        let due = db.due_platform_posts(now, self.config.batch_size).await?;

        if due.is_empty() {
            info!("no posts due");
            return Ok(BatchSummary::default());
        }
        info!(
            count = due.len(),
            concurrency = self.config.concurrency,
            "processing due sub-posts"
        );

        let outcomes: Vec<Result<(PlatformResult, bool)>> =
            stream::iter(due.iter().map(|item| self.process(item)))
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut summary = BatchSummary::default();
        let mut touched: Vec<&str> = Vec::new();
        let mut first_error = None;
        for (item, outcome) in due.iter().zip(outcomes) {
            let post_id = item.platform_post.post_id.as_str();
            match outcome {
                Ok((result, reconcile)) => {
                    if reconcile && !touched.contains(&post_id) {
                        touched.push(post_id);
                    }
                    summary.push(result);
                }
                Err(error) => {
                    warn!(
                        platform_post_id = %item.platform_post.id,
                        error = %error,
                        "sub-post attempt aborted"
                    );
                    if !touched.contains(&post_id) {
                        touched.push(post_id);
                    }
                    first_error = first_error.or(Some(error));
                }
            }
        }

        for post_id in touched {
            if let Err(error) = self.coordinator.finish(post_id).await {
                warn!(post_id, error = %error, "could not reconcile post");
                first_error = first_error.or(Some(error));
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "scheduler run complete"
        );
        Ok(summary)
    }

    /// One due sub-post. The flag tells whether its parent needs reconciling.
    async fn process(&self, item: &DuePlatformPost) -> Result<(PlatformResult, bool)> {
        let db = self.coordinator.database();
        let platform_post = &item.platform_post;

        if !PUBLISHABLE_PARENT.contains(&item.post_status) {
            info!(
                platform = %platform_post.platform,
                post_id = %platform_post.post_id,
                parent_status = %item.post_status,
                "skipping sub-post, parent not publishable"
            );
            let skipped = PlatformResult::new(
                platform_post,
                Outcome::Skipped {
                    reason: format!("Parent post is {}", item.post_status),
                },
            );
            return Ok((skipped, false));
        }

        let Some(media_url) = item.media_url.as_deref() else {
            let now = chrono::Utc::now().timestamp();
            let failed = db
                .fail_platform_post_if(
                    &platform_post.id,
                    &[PlatformPostStatus::Scheduled],
                    NO_MEDIA_ERROR,
                    now,
                )
                .await?;
            let outcome = if failed {
                warn!(post_id = %platform_post.post_id, "no media URL for post");
                Outcome::Failed {
                    error: NO_MEDIA_ERROR.to_string(),
                }
            } else {
                Outcome::Skipped {
                    reason: "No longer scheduled".to_string(),
                }
            };
            return Ok((PlatformResult::new(platform_post, outcome), failed));
        };

        // The parent may have been canceled since the scan
        if !db
            .transition_post_status(
                &platform_post.post_id,
                &PUBLISHABLE_PARENT,
                PostStatus::Publishing,
                chrono::Utc::now().timestamp(),
            )
            .await?
        {
            let skipped = PlatformResult::new(
                platform_post,
                Outcome::Skipped {
                    reason: "Parent post is no longer publishable".to_string(),
                },
            );
            return Ok((skipped, false));
        }

        let result = self
            .coordinator
            .publish_platform_post(platform_post, &item.user_id, media_url, PublishMode::Scheduled)
            .await?;

        Ok((result, true))
    }
}

/// Compare digests so the comparison does not depend on where the strings
/// first differ
fn secret_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) if !expected.is_empty() => {
            Sha256::digest(expected.as_bytes()) == Sha256::digest(provided.as_bytes())
        }
        _ => false,
    }
}
