//! Instagram Reels via the Graph API
//!
//! 1. `POST /{ig_user}/media` with `media_type=REELS` creates a container that
//!    Instagram fills by fetching the video URL.
//! 2. `GET /{container}?fields=status_code,status` until `FINISHED`.
//! 3. `POST /{ig_user}/media_publish` with `creation_id` makes it live.
//! 4. `GET /{media}?fields=permalink`, best effort.
//!
//! Insights come from `/{media}/insights`. Accounts without the insights
//! permission fall back to the like and comment counters on the media itself.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{
    check_caption, poll_until, read_json, AdapterResult, GraphError, GraphInsightsResponse,
    PollSchedule, PollStatus, PostInsights, PublishAdapter, PublishReceipt, PublishRequest, Sleeper,
};
use crate::capabilities::CapabilityRegistry;
use crate::error::PlatformError;
use crate::types::Platform;

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: Option<String>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct ContainerStatusResponse {
    status_code: Option<String>,
    status: Option<String>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink: Option<String>,
}

const INSIGHT_METRICS: &str =
    "impressions,reach,likes,comments,shares,saved,plays,total_interactions";

#[derive(Debug, Deserialize)]
struct MediaCounters {
    like_count: Option<i64>,
    comments_count: Option<i64>,
    error: Option<GraphError>,
}

pub struct InstagramAdapter {
    client: reqwest::Client,
    base_url: String,
    capabilities: Arc<CapabilityRegistry>,
    sleeper: Arc<dyn Sleeper>,
    poll: PollSchedule,
}

impl InstagramAdapter {
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
            poll: PollSchedule::graph_default(),
        }
    }

    pub fn with_poll_schedule(mut self, poll: PollSchedule) -> Self {
        self.poll = poll;
        self
    }

    async fn create_container(&self, request: &PublishRequest) -> AdapterResult<String> {
        let response = self
            .client
            .post(format!("{}/{}/media", self.base_url, request.account_id))
            .query(&[
                ("media_type", "REELS"),
                ("video_url", request.media_url.as_str()),
                ("caption", request.caption.as_str()),
                ("access_token", request.access_token.expose_secret()),
            ])
            .send()
            .await?;

        let body: IdResponse = read_json(response).await?;
        if let Some(error) = body.error {
            return Err(error.into());
        }
        body.id.ok_or_else(|| {
            PlatformError::Posting("No container ID returned from Instagram".to_string())
        })
    }

    async fn container_status(
        &self,
        container_id: &str,
        token: &str,
    ) -> AdapterResult<PollStatus<()>> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, container_id))
            .query(&[("fields", "status_code,status"), ("access_token", token)])
            .send()
            .await?;

        let body: ContainerStatusResponse = read_json(response).await?;
        if let Some(error) = body.error {
            return Err(error.into());
        }

        tracing::debug!(
            platform = "instagram",
            container_id,
            status_code = body.status_code.as_deref().unwrap_or("unknown"),
            "container status"
        );

        match body.status_code.as_deref() {
            Some("FINISHED") => Ok(PollStatus::Ready(())),
            Some("ERROR") | Some("EXPIRED") => Err(PlatformError::Posting(
                body.status.unwrap_or_else(|| "Container failed".to_string()),
            )),
            _ => Ok(PollStatus::Pending),
        }
    }

    async fn publish_container(
        &self,
        request: &PublishRequest,
        container_id: &str,
    ) -> AdapterResult<String> {
        let response = self
            .client
            .post(format!("{}/{}/media_publish", self.base_url, request.account_id))
            .query(&[
                ("creation_id", container_id),
                ("access_token", request.access_token.expose_secret()),
            ])
            .send()
            .await?;

        let body: IdResponse = read_json(response).await?;
        if let Some(error) = body.error {
            return Err(error.into());
        }
        body.id
            .ok_or_else(|| PlatformError::Posting("No media ID returned from Instagram".to_string()))
    }

    async fn permalink(&self, media_id: &str, token: &str) -> Option<String> {
        let result = async {
            let response = self
                .client
                .get(format!("{}/{}", self.base_url, media_id))
                .query(&[("fields", "permalink"), ("access_token", token)])
                .send()
                .await?;
            read_json::<PermalinkResponse>(response).await
        }
        .await;

        match result {
            Ok(body) => body.permalink,
            Err(e) => {
                tracing::debug!(platform = "instagram", media_id, error = %e, "permalink lookup failed");
                None
            }
        }
    }

    async fn media_counters(&self, media_id: &str, token: &str) -> AdapterResult<MediaCounters> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, media_id))
            .query(&[("fields", "like_count,comments_count"), ("access_token", token)])
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl PublishAdapter for InstagramAdapter {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn publish(&self, request: &PublishRequest) -> AdapterResult<PublishReceipt> {
        check_caption(&self.capabilities, Platform::Instagram, &request.caption)?;

        let container_id = self.create_container(request).await?;
        tracing::info!(platform = "instagram", container_id = %container_id, "container created");

        let token = request.access_token.expose_secret();
        let ready = poll_until(&self.poll, self.sleeper.as_ref(), |_| {
            self.container_status(&container_id, token)
        })
        .await?;
        if ready.is_none() {
            return Err(PlatformError::Timeout(
                "Container processing timeout".to_string(),
            ));
        }

        let media_id = self.publish_container(request, &container_id).await?;
        let permalink_url = self.permalink(&media_id, token).await;
        tracing::info!(platform = "instagram", media_id = %media_id, "reel published");

        Ok(PublishReceipt {
            external_id: media_id,
            permalink_url,
        })
    }

    async fn fetch_insights(
        &self,
        access_token: &SecretString,
        external_id: &str,
    ) -> AdapterResult<Option<PostInsights>> {
        let token = access_token.expose_secret();
        let response = self
            .client
            .get(format!("{}/{}/insights", self.base_url, external_id))
            .query(&[("metric", INSIGHT_METRICS), ("access_token", token)])
            .send()
            .await?;
        let body: GraphInsightsResponse = read_json(response).await?;

        if let Some(error) = body.error {
            tracing::debug!(
                platform = "instagram",
                media_id = external_id,
                error = %error.message,
                "insights unavailable, falling back to media counters"
            );
            let counters = self.media_counters(external_id, token).await?;
            if counters.error.is_some() {
                return Err(error.into());
            }
            return Ok(Some(PostInsights {
                likes: counters.like_count,
                comments: counters.comments_count,
                ..Default::default()
            }));
        }

        let mut insights = PostInsights::default();
        for metric in &body.data {
            match metric.name.as_str() {
                "impressions" => insights.impressions = metric.count(),
                "reach" => insights.reach = metric.count(),
                "likes" => insights.likes = metric.count(),
                "comments" => insights.comments = metric.count(),
                "shares" => insights.shares = metric.count(),
                "saved" => insights.saves = metric.count(),
                "plays" => {
                    insights.plays = metric.count();
                    insights.views = metric.count();
                }
                other => {
                    if let Some(value) = metric.value() {
                        insights.platform_data.insert(other.to_string(), value.clone());
                    }
                }
            }
        }
        insights.engagement_rate = insights.rate_over(insights.reach);
        Ok(Some(insights))
    }
}
