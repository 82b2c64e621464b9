//! Core types for Reelcast

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReelcastError, Result};
use crate::platforms::PostInsights;

/// Target social network
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Instagram,
    Facebook,
    Tiktok,
    Linkedin,
    Youtube,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Instagram,
        Platform::Facebook,
        Platform::Tiktok,
        Platform::Linkedin,
        Platform::Youtube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Tiktok => "tiktok",
            Platform::Linkedin => "linkedin",
            Platform::Youtube => "youtube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "instagram" => Ok(Platform::Instagram),
            "facebook" => Ok(Platform::Facebook),
            "tiktok" => Ok(Platform::Tiktok),
            "linkedin" => Ok(Platform::Linkedin),
            "youtube" => Ok(Platform::Youtube),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown platform '{}'. Valid platforms: instagram, facebook, tiktok, linkedin, youtube",
                other
            ))),
        }
    }
}

/// Aggregate status of a post, derived from its sub-posts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Queued,
    Publishing,
    Published,
    PartiallyPublished,
    Failed,
    Canceled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Queued => "queued",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::PartiallyPublished => "partially_published",
            PostStatus::Failed => "failed",
            PostStatus::Canceled => "canceled",
        }
    }

    /// Terminal states; `Failed` and `PartiallyPublished` can still be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PostStatus::Published
                | PostStatus::PartiallyPublished
                | PostStatus::Failed
                | PostStatus::Canceled
        )
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "queued" => Ok(PostStatus::Queued),
            "publishing" => Ok(PostStatus::Publishing),
            "published" => Ok(PostStatus::Published),
            "partially_published" => Ok(PostStatus::PartiallyPublished),
            "failed" => Ok(PostStatus::Failed),
            "canceled" => Ok(PostStatus::Canceled),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown post status: {}",
                other
            ))),
        }
    }
}

/// Status of a single platform sub-post (no partial state at this level)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlatformPostStatus {
    Draft,
    Scheduled,
    Queued,
    Publishing,
    Published,
    Failed,
    Canceled,
}

impl PlatformPostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformPostStatus::Draft => "draft",
            PlatformPostStatus::Scheduled => "scheduled",
            PlatformPostStatus::Queued => "queued",
            PlatformPostStatus::Publishing => "publishing",
            PlatformPostStatus::Published => "published",
            PlatformPostStatus::Failed => "failed",
            PlatformPostStatus::Canceled => "canceled",
        }
    }

    /// Work that is still in flight or waiting to run
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            PlatformPostStatus::Scheduled
                | PlatformPostStatus::Queued
                | PlatformPostStatus::Publishing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlatformPostStatus::Published | PlatformPostStatus::Failed | PlatformPostStatus::Canceled
        )
    }
}

impl fmt::Display for PlatformPostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformPostStatus {
    type Err = ReelcastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(PlatformPostStatus::Draft),
            "scheduled" => Ok(PlatformPostStatus::Scheduled),
            "queued" => Ok(PlatformPostStatus::Queued),
            "publishing" => Ok(PlatformPostStatus::Publishing),
            "published" => Ok(PlatformPostStatus::Published),
            "failed" => Ok(PlatformPostStatus::Failed),
            "canceled" => Ok(PlatformPostStatus::Canceled),
            other => Err(ReelcastError::InvalidInput(format!(
                "Unknown platform post status: {}",
                other
            ))),
        }
    }
}

/// Free-form creative context captured with a post
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

/// An uploaded video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub user_id: String,
    pub public_url: Option<String>,
    pub mime_type: Option<String>,
    pub created_at: i64,
}

impl Asset {
    pub fn new(user_id: &str, public_url: Option<String>, mime_type: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            public_url,
            mime_type,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// One user campaign: a video fanned out to several platforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub asset_id: Option<String>,
    pub context: PostContext,
    pub status: PostStatus,
    pub scheduled_for: Option<i64>,
    pub timezone: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Post {
    pub fn new(user_id: &str, asset_id: Option<String>, context: PostContext) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            asset_id,
            context,
            status: PostStatus::Draft,
            scheduled_for: None,
            timezone: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One post on one platform; the unit of publishing work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformPost {
    pub id: String,
    pub post_id: String,
    pub platform: Platform,
    pub caption_final: Option<String>,
    pub status: PlatformPostStatus,
    pub scheduled_for: Option<i64>,
    pub started_at: Option<i64>,
    pub published_at: Option<i64>,
    pub external_post_id: Option<String>,
    pub external_url: Option<String>,
    pub last_error: Option<String>,
    pub attempt_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PlatformPost {
    pub fn new(post_id: &str, platform: Platform) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            post_id: post_id.to_string(),
            platform,
            caption_final: None,
            status: PlatformPostStatus::Draft,
            scheduled_for: None,
            started_at: None,
            published_at: None,
            external_post_id: None,
            external_url: None,
            last_error: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A user's stored credential for one external account
///
/// Tokens are only ever held here in encrypted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    pub user_id: String,
    pub platform: Platform,
    pub external_account_id: String,
    pub display_name: Option<String>,
    pub token_encrypted: String,
    pub refresh_token_encrypted: Option<String>,
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub metadata: serde_json::Value,
    pub is_primary: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// CSRF nonce for one in-flight OAuth handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthState {
    pub state: String,
    pub user_id: String,
    pub platform: Platform,
    pub created_at: i64,
    pub expires_at: i64,
}

/// One fetch of a published sub-post's vendor metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyticsSnapshot {
    pub id: String,
    pub platform_post_id: String,
    pub platform: Platform,
    #[serde(flatten)]
    pub insights: PostInsights,
    pub fetched_at: i64,
}

impl AnalyticsSnapshot {
    pub fn new(platform_post_id: &str, platform: Platform, insights: PostInsights) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            platform_post_id: platform_post_id.to_string(),
            platform,
            insights,
            fetched_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// How long an OAuth state nonce stays valid
pub const OAUTH_STATE_TTL_SECS: i64 = 10 * 60;
