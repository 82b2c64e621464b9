//! TikTok Content Posting API
//!
//! TikTok pulls the video from our URL (`PULL_FROM_URL`) after an init call,
//! then the publish job is polled through `status/fetch` with exponential
//! backoff. The publish id is the only identifier available at completion,
//! so it is what gets stored as the external id; there is no permalink.
//!
//! Access tokens are short-lived. When the app's client key and secret are
//! configured, the adapter can redeem a stored refresh token at
//! `oauth/token/` for a new pair.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    check_caption, poll_until, read_json, AdapterResult, PollSchedule, PollStatus, PostInsights,
    PublishAdapter, PublishReceipt, PublishRequest, RefreshedToken, Sleeper,
};
use crate::capabilities::CapabilityRegistry;
use crate::error::PlatformError;
use crate::types::Platform;

const DIRECT_INIT_PATH: &str = "/post/publish/video/init/";
const INBOX_INIT_PATH: &str = "/post/publish/inbox/video/init/";
const STATUS_PATH: &str = "/post/publish/status/fetch/";
const TOKEN_PATH: &str = "/oauth/token/";
const VIDEO_QUERY_PATH: &str = "/video/query/";
const VIDEO_FIELDS: [&str; 6] = [
    "id",
    "title",
    "view_count",
    "like_count",
    "comment_count",
    "share_count",
];

#[derive(Debug, Serialize)]
struct InitRequest<'a> {
    post_info: PostInfo<'a>,
    source_info: SourceInfo<'a>,
}

#[derive(Debug, Serialize)]
struct PostInfo<'a> {
    title: &'a str,
    privacy_level: &'a str,
    disable_duet: bool,
    disable_comment: bool,
    disable_stitch: bool,
}

#[derive(Debug, Serialize)]
struct SourceInfo<'a> {
    source: &'a str,
    video_url: &'a str,
}

/// TikTok wraps every response in `{data, error}` and reports success as
/// `error.code == "ok"`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    error: Option<TikTokError>,
}

#[derive(Debug, Deserialize)]
struct TikTokError {
    code: String,
    #[serde(default)]
    message: String,
}

impl<T> Envelope<T> {
    fn into_data(self) -> AdapterResult<Option<T>> {
        match self.error {
            Some(error) if error.code != "ok" => Err(classify(error)),
            _ => Ok(self.data),
        }
    }
}

fn classify(error: TikTokError) -> PlatformError {
    let message = if error.message.is_empty() {
        error.code.clone()
    } else {
        error.message
    };
    match error.code.as_str() {
        "access_token_invalid" | "scope_not_authorized" | "access_token_expired" => {
            PlatformError::Authentication(message)
        }
        "rate_limit_exceeded" | "spam_risk_too_many_posts" => PlatformError::RateLimit(message),
        _ => PlatformError::Posting(message),
    }
}

#[derive(Debug, Deserialize)]
struct InitData {
    publish_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: Option<String>,
    fail_reason: Option<String>,
}

/// The OAuth endpoint answers flat, not in the `{data, error}` envelope.
/// `error` is a code string in v2 and an object in some older responses.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<serde_json::Value>,
    error_description: Option<String>,
}

impl TokenResponse {
    fn error_message(&self) -> Option<String> {
        let error = self.error.as_ref().filter(|e| !e.is_null())?;
        let message = self
            .error_description
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| {
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .or_else(|| error.as_str().map(str::to_string))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "Token refresh failed".to_string());
        Some(message)
    }
}

#[derive(Debug, Deserialize)]
struct VideoQueryData {
    #[serde(default)]
    videos: Vec<VideoStats>,
}

#[derive(Debug, Deserialize)]
struct VideoStats {
    view_count: Option<i64>,
    like_count: Option<i64>,
    comment_count: Option<i64>,
    share_count: Option<i64>,
}

/// App credentials for the refresh grant
struct ClientCredentials {
    key: String,
    secret: SecretString,
}

pub struct TikTokAdapter {
    client: reqwest::Client,
    base_url: String,
    capabilities: Arc<CapabilityRegistry>,
    sleeper: Arc<dyn Sleeper>,
    poll: PollSchedule,
    post_to_inbox: bool,
    credentials: Option<ClientCredentials>,
}

impl TikTokAdapter {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        capabilities: Arc<CapabilityRegistry>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            capabilities,
            sleeper,
            poll: PollSchedule::tiktok_default(),
            post_to_inbox: false,
            credentials: None,
        }
    }

    /// Client key and secret of the TikTok app, needed to refresh tokens
    pub fn with_client_credentials(mut self, key: &str, secret: SecretString) -> Self {
        self.credentials = Some(ClientCredentials {
            key: key.to_string(),
            secret,
        });
        self
    }

    /// Send to the creator's inbox as a draft instead of publishing directly
    pub fn post_to_inbox(mut self, enabled: bool) -> Self {
        self.post_to_inbox = enabled;
        self
    }

    pub fn with_poll_schedule(mut self, poll: PollSchedule) -> Self {
        self.poll = poll;
        self
    }

    async fn init(&self, request: &PublishRequest) -> AdapterResult<String> {
        let path = if self.post_to_inbox {
            INBOX_INIT_PATH
        } else {
            DIRECT_INIT_PATH
        };
        let body = InitRequest {
            post_info: PostInfo {
                title: &request.caption,
                privacy_level: "SELF_ONLY",
                disable_duet: false,
                disable_comment: false,
                disable_stitch: false,
            },
            source_info: SourceInfo {
                source: "PULL_FROM_URL",
                video_url: &request.media_url,
            },
        };

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(request.access_token.expose_secret())
            .json(&body)
            .send()
            .await?;

        let envelope: Envelope<InitData> = read_json(response).await?;
        envelope
            .into_data()?
            .and_then(|data| data.publish_id)
            .ok_or_else(|| PlatformError::Posting("No publish ID returned from TikTok".to_string()))
    }

    async fn status(&self, publish_id: &str, token: &str) -> AdapterResult<PollStatus<()>> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, STATUS_PATH))
            .bearer_auth(token)
            .json(&serde_json::json!({ "publish_id": publish_id }))
            .send()
            .await?;

        let envelope: Envelope<StatusData> = read_json(response).await?;
        let data = envelope.into_data()?;
        let status = data.as_ref().and_then(|d| d.status.as_deref());

        tracing::debug!(
            platform = "tiktok",
            publish_id,
            status = status.unwrap_or("unknown"),
            "publish status"
        );

        match status {
            Some("PUBLISH_COMPLETE") | Some("SEND_TO_USER_INBOX") => Ok(PollStatus::Ready(())),
            Some("FAILED") => Err(PlatformError::Posting(
                data.and_then(|d| d.fail_reason)
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "Video publish failed".to_string()),
            )),
            _ => Ok(PollStatus::Pending),
        }
    }
}

#[async_trait]
impl PublishAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        Platform::Tiktok
    }

    async fn publish(&self, request: &PublishRequest) -> AdapterResult<PublishReceipt> {
        check_caption(&self.capabilities, Platform::Tiktok, &request.caption)?;

        let publish_id = self.init(request).await?;
        tracing::info!(
            platform = "tiktok",
            publish_id = %publish_id,
            inbox = self.post_to_inbox,
            "upload initialized"
        );

        let token = request.access_token.expose_secret();
        let done = poll_until(&self.poll, self.sleeper.as_ref(), |_| {
            self.status(&publish_id, token)
        })
        .await?;
        if done.is_none() {
            return Err(PlatformError::Timeout(
                "Publish status check timed out".to_string(),
            ));
        }

        Ok(PublishReceipt {
            external_id: publish_id,
            permalink_url: None,
        })
    }

    async fn refresh_token(
        &self,
        refresh_token: &SecretString,
    ) -> AdapterResult<Option<RefreshedToken>> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            PlatformError::Authentication("TikTok client credentials are not configured".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}{}", self.base_url, TOKEN_PATH))
            .form(&[
                ("client_key", credentials.key.as_str()),
                ("client_secret", credentials.secret.expose_secret()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose_secret()),
            ])
            .send()
            .await?;

        let body: TokenResponse = read_json(response).await?;
        if let Some(message) = body.error_message() {
            return Err(PlatformError::Authentication(message));
        }
        let access_token = body.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            PlatformError::Authentication("No access token returned from TikTok".to_string())
        })?;

        tracing::info!(platform = "tiktok", expires_in = ?body.expires_in, "access token refreshed");
        Ok(Some(RefreshedToken {
            access_token: SecretString::from(access_token),
            refresh_token: body.refresh_token.filter(|t| !t.is_empty()).map(SecretString::from),
            expires_in: body.expires_in,
        }))
    }

    async fn fetch_insights(
        &self,
        access_token: &SecretString,
        external_id: &str,
    ) -> AdapterResult<Option<PostInsights>> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, VIDEO_QUERY_PATH))
            .bearer_auth(access_token.expose_secret())
            .json(&serde_json::json!({
                "filters": { "video_ids": [external_id] },
                "fields": VIDEO_FIELDS,
            }))
            .send()
            .await?;

        let envelope: Envelope<VideoQueryData> = read_json(response).await?;
        let Some(video) = envelope
            .into_data()?
            .and_then(|data| data.videos.into_iter().next())
        else {
            return Ok(None);
        };

        let mut insights = PostInsights {
            views: video.view_count,
            likes: video.like_count,
            comments: video.comment_count,
            shares: video.share_count,
            ..Default::default()
        };
        insights.engagement_rate = Some(insights.rate_over(insights.views).unwrap_or(0.0));
        Ok(Some(insights))
    }
}
