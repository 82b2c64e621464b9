//! Facebook Page videos via the Graph API
//!
//! The page fetches the video from `file_url`; the returned video id is the
//! post. Processing status is watched on a fixed schedule but is advisory:
//! Facebook often keeps reporting `processing` for videos that are already
//! live, so running out of polls still counts as published. An explicit
//! `error` status does not.
//!
//! Insights come from `/{video}/insights`, falling back to the reaction,
//! comment and share summaries on the object itself.

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
struct UploadResponse {
    id: Option<String>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct VideoStatus {
    video_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoStatusResponse {
    status: Option<VideoStatus>,
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct PermalinkResponse {
    permalink_url: Option<String>,
}

const INSIGHT_METRICS: &str = "post_impressions,post_impressions_unique,post_engaged_users,\
                               post_reactions_by_type_total,post_clicks,post_video_views";

#[derive(Debug, Deserialize)]
struct Summary {
    total_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Summarized {
    summary: Option<Summary>,
}

#[derive(Debug, Deserialize)]
struct ShareCount {
    count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EngagementSummary {
    likes: Option<Summarized>,
    comments: Option<Summarized>,
    shares: Option<ShareCount>,
    error: Option<GraphError>,
}

fn total(summarized: Option<Summarized>) -> Option<i64> {
    summarized.and_then(|s| s.summary).and_then(|s| s.total_count)
}

pub struct FacebookAdapter {
    client: reqwest::Client,
    base_url: String,
    capabilities: Arc<CapabilityRegistry>,
    sleeper: Arc<dyn Sleeper>,
    poll: PollSchedule,
}

impl FacebookAdapter {
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

    async fn upload(&self, request: &PublishRequest) -> AdapterResult<String> {
        let response = self
            .client
            .post(format!("{}/{}/videos", self.base_url, request.account_id))
            .query(&[
                ("file_url", request.media_url.as_str()),
                ("description", request.caption.as_str()),
                ("access_token", request.access_token.expose_secret()),
            ])
            .send()
            .await?;

        let body: UploadResponse = read_json(response).await?;
        if let Some(error) = body.error {
            return Err(error.into());
        }
        body.id
            .ok_or_else(|| PlatformError::Posting("No video ID returned from Facebook".to_string()))
    }

    async fn video_status(&self, video_id: &str, token: &str) -> AdapterResult<PollStatus<()>> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, video_id))
            .query(&[("fields", "status"), ("access_token", token)])
            .send()
            .await?;

        let body: VideoStatusResponse = read_json(response).await?;
        if let Some(error) = body.error {
            return Err(error.into());
        }

        match body.status.and_then(|s| s.video_status).as_deref() {
            Some("ready") => Ok(PollStatus::Ready(())),
            Some("error") => Err(PlatformError::Posting(
                "Video processing failed".to_string(),
            )),
            _ => Ok(PollStatus::Pending),
        }
    }

    async fn permalink(&self, video_id: &str, token: &str) -> Option<String> {
        let result = async {
            let response = self
                .client
                .get(format!("{}/{}", self.base_url, video_id))
                .query(&[("fields", "permalink_url"), ("access_token", token)])
                .send()
                .await?;
            read_json::<PermalinkResponse>(response).await
        }
        .await;

        result.ok().and_then(|body| body.permalink_url)
    }

    async fn engagement_summary(
        &self,
        object_id: &str,
        token: &str,
    ) -> AdapterResult<EngagementSummary> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, object_id))
            .query(&[
                ("fields", "likes.summary(true),comments.summary(true),shares"),
                ("access_token", token),
            ])
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl PublishAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    async fn publish(&self, request: &PublishRequest) -> AdapterResult<PublishReceipt> {
        check_caption(&self.capabilities, Platform::Facebook, &request.caption)?;

        let video_id = self.upload(request).await?;
        tracing::info!(platform = "facebook", video_id = %video_id, "video upload accepted");

        let token = request.access_token.expose_secret();
        let ready = poll_until(&self.poll, self.sleeper.as_ref(), |_| {
            self.video_status(&video_id, token)
        })
        .await?;
        if ready.is_none() {
            tracing::warn!(
                platform = "facebook",
                video_id = %video_id,
                "video still processing after polling, treating upload as published"
            );
        }

        let permalink_url = self.permalink(&video_id, token).await;

        Ok(PublishReceipt {
            external_id: video_id,
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
                platform = "facebook",
                video_id = external_id,
                error = %error.message,
                "insights unavailable, falling back to engagement summary"
            );
            let summary = self.engagement_summary(external_id, token).await?;
            if summary.error.is_some() {
                return Err(error.into());
            }
            return Ok(Some(PostInsights {
                likes: total(summary.likes),
                comments: total(summary.comments),
                shares: summary.shares.and_then(|s| s.count),
                ..Default::default()
            }));
        }

        let mut insights = PostInsights::default();
        for metric in &body.data {
            match metric.name.as_str() {
                "post_impressions" => insights.impressions = metric.count(),
                "post_impressions_unique" => insights.reach = metric.count(),
                "post_video_views" => {
                    insights.views = metric.count();
                    insights.plays = metric.count();
                }
                // One counter per reaction type; all of them count as likes
                "post_reactions_by_type_total" => {
                    insights.likes = metric
                        .value()
                        .and_then(|v| v.as_object())
                        .map(|by_type| by_type.values().filter_map(|n| n.as_i64()).sum());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::RecordingSleeper;
    use secrecy::SecretString;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> FacebookAdapter {
        FacebookAdapter::new(
            reqwest::Client::new(),
            &server.uri(),
            Arc::new(CapabilityRegistry::builtin()),
            Arc::new(RecordingSleeper::new()),
        )
    }

    fn request() -> PublishRequest {
        PublishRequest {
            access_token: SecretString::from("page-token".to_string()),
            account_id: "page-77".to_string(),
            media_url: "https://cdn.example.com/clip.mp4".to_string(),
            caption: "Behind the scenes".to_string(),
        }
    }

    async fn mount_upload(server: &MockServer, video_id: &str) {
        Mock::given(method("POST"))
            .and(path("/page-77/videos"))
            .and(query_param("file_url", "https://cdn.example.com/clip.mp4"))
            .and(query_param("description", "Behind the scenes"))
            .and(query_param("access_token", "page-token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": video_id})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_ready_video_with_permalink() {
        let server = MockServer::start().await;
        mount_upload(&server, "v-1").await;

        Mock::given(method("GET"))
            .and(path("/v-1"))
            .and(query_param("fields", "status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"status": {"video_status": "ready"}}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v-1"))
            .and(query_param("fields", "permalink_url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"permalink_url": "/page-77/videos/v-1/"}),
            ))
            .mount(&server)
            .await;

        let receipt = adapter(&server).publish(&request()).await.unwrap();
        assert_eq!(receipt.external_id, "v-1");
        assert_eq!(receipt.permalink_url.as_deref(), Some("/page-77/videos/v-1/"));
    }

    #[tokio::test]
    async fn test_processing_timeout_still_succeeds() {
        let server = MockServer::start().await;
        mount_upload(&server, "v-2").await;

        Mock::given(method("GET"))
            .and(path("/v-2"))
            .and(query_param("fields", "status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"status": {"video_status": "processing"}}),
            ))
            .expect(4)
            .mount(&server)
            .await;

        let receipt = adapter(&server)
            .with_poll_schedule(PollSchedule::Fixed {
                interval: Duration::from_secs(5),
                max_attempts: 4,
            })
            .publish(&request())
            .await
            .unwrap();

        assert_eq!(receipt.external_id, "v-2");
        assert_eq!(receipt.permalink_url, None);
    }

    #[tokio::test]
    async fn test_processing_error_fails() {
        let server = MockServer::start().await;
        mount_upload(&server, "v-3").await;

        Mock::given(method("GET"))
            .and(path("/v-3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"status": {"video_status": "error"}}),
            ))
            .mount(&server)
            .await;

        let err = adapter(&server).publish(&request()).await.unwrap_err();
        assert_eq!(err.detail(), "Video processing failed");
    }

    #[tokio::test]
    async fn test_upload_rejected_with_vendor_message() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/page-77/videos"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"message": "(#200) Permissions error", "code": 200}
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).publish(&request()).await.unwrap_err();
        assert_eq!(err.detail(), "(#200) Permissions error");
    }

    #[tokio::test]
    async fn test_expired_token_is_authentication_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/page-77/videos"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Error validating access token", "type": "OAuthException", "code": 190}
            })))
            .mount(&server)
            .await;

        let err = adapter(&server).publish(&request()).await.unwrap_err();
        assert_eq!(
            err,
            PlatformError::Authentication("Error validating access token".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_video_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/page-77/videos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;

        let err = adapter(&server).publish(&request()).await.unwrap_err();
        assert_eq!(err.detail(), "No video ID returned from Facebook");
    }

    #[tokio::test]
    async fn test_insights_sum_reaction_types() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v-1/insights"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"name": "post_impressions", "values": [{"value": 900}]},
                    {"name": "post_impressions_unique", "values": [{"value": 500}]},
                    {"name": "post_engaged_users", "values": [{"value": 42}]},
                    {"name": "post_reactions_by_type_total", "values": [{"value": {"like": 20, "love": 4, "wow": 1}}]},
                    {"name": "post_video_views", "values": [{"value": 1500}]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let insights = adapter(&server)
            .fetch_insights(&SecretString::from("page-token".to_string()), "v-1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(insights.impressions, Some(900));
        assert_eq!(insights.reach, Some(500));
        assert_eq!(insights.likes, Some(25));
        assert_eq!(insights.views, Some(1500));
        assert_eq!(insights.engagement_rate, Some(5.0));
        assert_eq!(insights.platform_data["post_engaged_users"], 42);
    }

    #[tokio::test]
    async fn test_insights_fall_back_to_engagement_summary() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v-1/insights"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "(#100) The value must be a valid insights metric", "code": 100}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v-1"))
            .and(query_param("fields", "likes.summary(true),comments.summary(true),shares"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "likes": {"data": [], "summary": {"total_count": 7}},
                "comments": {"data": [], "summary": {"total_count": 2}},
                "shares": {"count": 1},
                "id": "v-1"
            })))
            .mount(&server)
            .await;

        let insights = adapter(&server)
            .fetch_insights(&SecretString::from("page-token".to_string()), "v-1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!((insights.likes, insights.comments, insights.shares), (Some(7), Some(2), Some(1)));
        assert_eq!(insights.engagement_rate, None);
    }
}
