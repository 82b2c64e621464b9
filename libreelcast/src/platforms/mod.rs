//! Platform adapters
//!
//! Every vendor integration implements [`PublishAdapter`]: given a decrypted
//! credential, a public video URL and a caption, it runs the vendor's
//! submit → wait-for-ready → commit protocol and returns either a
//! [`PublishReceipt`] or a [`PlatformError`] whose text is stored verbatim.
//!
//! Adapters hold no per-post state and never retry a publish on their own;
//! the only repetition they perform is readiness polling on a
//! [`PollSchedule`], and the waiting between polls goes through a [`Sleeper`]
//! so tests can observe the delays without spending them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use libreelcast::capabilities::CapabilityRegistry;
//! use libreelcast::config::Config;
//! use libreelcast::platforms::AdapterRegistry;
//! use libreelcast::types::Platform;
//!
//! # fn example() -> libreelcast::error::Result<()> {
//! let config = Config::load()?;
//! let capabilities = Arc::new(CapabilityRegistry::with_caption_overrides(&config.captions));
//! let adapters = AdapterRegistry::from_config(&config, capabilities)?;
//! assert!(adapters.get(Platform::Tiktok).is_some());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::capabilities::CapabilityRegistry;
use crate::config::{Config, HttpConfig};
use crate::error::PlatformError;
use crate::types::Platform;

pub mod facebook;
pub mod instagram;
pub mod tiktok;

// Available outside cfg(test) so integration tests and the binaries' tests can use it
pub mod mock;

pub type AdapterResult<T> = std::result::Result<T, PlatformError>;

/// Everything an adapter needs for one publish attempt
pub struct PublishRequest {
    /// Decrypted bearer credential; lives only as long as this request
    pub access_token: SecretString,
    /// Vendor-side account: Instagram business account, Facebook page, TikTok open id
    pub account_id: String,
    /// Publicly fetchable video URL
    pub media_url: String,
    pub caption: String,
}

impl std::fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishRequest")
            .field("account_id", &self.account_id)
            .field("media_url", &self.media_url)
            .field("caption_chars", &self.caption.chars().count())
            .finish_non_exhaustive()
    }
}

/// Normalized success result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReceipt {
    pub external_id: String,
    pub permalink_url: Option<String>,
}

/// Credentials handed back by a refresh grant
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// Some vendors rotate the refresh token on every use
    pub refresh_token: Option<SecretString>,
    /// Seconds until `access_token` expires
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("rotated", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Engagement counters for one published video, as far as the vendor
/// reports them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostInsights {
    pub views: Option<i64>,
    pub reach: Option<i64>,
    pub impressions: Option<i64>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub shares: Option<i64>,
    pub saves: Option<i64>,
    pub plays: Option<i64>,
    /// Interactions per 100 reached (or viewed, on TikTok)
    pub engagement_rate: Option<f64>,
    /// Vendor metrics with no column of their own
    #[serde(default)]
    pub platform_data: serde_json::Map<String, serde_json::Value>,
}

impl PostInsights {
    /// Interactions over `base`, as a percentage. `None` when `base` is
    /// unknown or zero.
    pub fn rate_over(&self, base: Option<i64>) -> Option<f64> {
        let base = base.filter(|b| *b > 0)?;
        let interactions = [self.likes, self.comments, self.shares, self.saves]
            .into_iter()
            .flatten()
            .sum::<i64>();
        Some(interactions as f64 * 100.0 / base as f64)
    }
}

#[async_trait]
pub trait PublishAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Run the full vendor protocol for one video
    async fn publish(&self, request: &PublishRequest) -> AdapterResult<PublishReceipt>;

    /// Exchange a refresh token for new credentials.
    ///
    /// `Ok(None)` means the platform's tokens are not refreshed this way and
    /// the stored one should be used as is.
    async fn refresh_token(
        &self,
        _refresh_token: &SecretString,
    ) -> AdapterResult<Option<RefreshedToken>> {
        Ok(None)
    }

    /// Current engagement numbers for a video this adapter published.
    ///
    /// `Ok(None)` when the vendor has nothing to report for it.
    async fn fetch_insights(
        &self,
        _access_token: &SecretString,
        _external_id: &str,
    ) -> AdapterResult<Option<PostInsights>> {
        Ok(None)
    }
}

/// Reject captions longer than the platform allows, counted in characters
pub fn check_caption(
    capabilities: &CapabilityRegistry,
    platform: Platform,
    caption: &str,
) -> AdapterResult<()> {
    let max = capabilities.max_caption_chars(platform);
    if caption.chars().count() > max {
        return Err(PlatformError::Validation(format!(
            "Caption exceeds {} characters",
            max
        )));
    }
    Ok(())
}

// ============================================================================
// Readiness polling
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PollSchedule {
    Fixed {
        interval: Duration,
        max_attempts: u32,
    },
    Backoff {
        initial: Duration,
        factor: f64,
        cap: Duration,
        max_attempts: u32,
    },
}

impl PollSchedule {
    /// Instagram and Facebook: every 5 s, 60 times
    pub const fn graph_default() -> Self {
        PollSchedule::Fixed {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }

    /// TikTok: 2 s growing by half each time, capped at 30 s, 30 times
    pub const fn tiktok_default() -> Self {
        PollSchedule::Backoff {
            initial: Duration::from_secs(2),
            factor: 1.5,
            cap: Duration::from_secs(30),
            max_attempts: 30,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            PollSchedule::Fixed { max_attempts, .. } | PollSchedule::Backoff { max_attempts, .. } => {
                *max_attempts
            }
        }
    }

    /// The wait after each non-terminal poll, in order
    pub fn delays(&self) -> Vec<Duration> {
        match self {
            PollSchedule::Fixed {
                interval,
                max_attempts,
            } => vec![*interval; *max_attempts as usize],
            PollSchedule::Backoff {
                initial,
                factor,
                cap,
                max_attempts,
            } => {
                let mut delays = Vec::with_capacity(*max_attempts as usize);
                let mut delay = (*initial).min(*cap);
                for _ in 0..*max_attempts {
                    delays.push(delay);
                    delay = delay.mul_f64(*factor).min(*cap);
                }
                delays
            }
        }
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real waiting, used outside tests
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Outcome of one readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Ready(T),
    Pending,
}

/// Poll `check` until it reports ready, sleeping per `schedule` in between.
///
/// `Ok(None)` means the schedule ran out; the caller decides whether that is
/// a failure. An `Err` from `check` ends polling immediately.
pub async fn poll_until<T, F, Fut>(
    schedule: &PollSchedule,
    sleeper: &dyn Sleeper,
    mut check: F,
) -> AdapterResult<Option<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AdapterResult<PollStatus<T>>>,
{
    let delays = schedule.delays();
    let last = delays.len();
    for (attempt, delay) in delays.into_iter().enumerate() {
        match check(attempt as u32 + 1).await? {
            PollStatus::Ready(value) => return Ok(Some(value)),
            // No point waiting once there is nothing left to poll
            PollStatus::Pending if attempt + 1 == last => break,
            PollStatus::Pending => sleeper.sleep(delay).await,
        }
    }
    Ok(None)
}

// ============================================================================
// HTTP plumbing shared by the vendor adapters
// ============================================================================

/// Shared client with the configured per-request timeout
pub fn http_client(config: &HttpConfig) -> AdapterResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .user_agent(concat!("reelcast/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PlatformError::Network(format!("Failed to build HTTP client: {}", e)))
}

/// Decode a vendor JSON body regardless of HTTP status.
///
/// Vendors put their error object in the body of non-2xx responses, so the
/// body is what the adapters inspect; the status only matters when the body
/// is not JSON at all.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> AdapterResult<T> {
    let status = response.status();
    let body = response.text().await?;

    serde_json::from_str(&body).map_err(|_| {
        let snippet: String = body.chars().take(200).collect();
        let message = format!("HTTP {}: {}", status.as_u16(), snippet);
        match status.as_u16() {
            401 | 403 => PlatformError::Authentication(message),
            429 => PlatformError::RateLimit(message),
            _ if status.is_success() => {
                PlatformError::Posting(format!("Unexpected response body: {}", snippet))
            }
            _ => PlatformError::Posting(message),
        }
    })
}

/// The `error` object Graph API (Instagram and Facebook) returns
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GraphError {
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl From<GraphError> for PlatformError {
    fn from(error: GraphError) -> Self {
        match (error.code, error.kind.as_deref()) {
            (Some(4 | 17 | 32 | 613), _) => PlatformError::RateLimit(error.message),
            (Some(190), _) | (_, Some("OAuthException")) => {
                PlatformError::Authentication(error.message)
            }
            _ => PlatformError::Posting(error.message),
        }
    }
}

/// `GET /{object}/insights` body shared by Instagram media and Facebook videos
#[derive(Debug, Deserialize)]
pub(crate) struct GraphInsightsResponse {
    #[serde(default)]
    pub data: Vec<GraphMetric>,
    pub error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphMetric {
    pub name: String,
    #[serde(default)]
    values: Vec<GraphMetricValue>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GraphMetricValue {
    #[serde(default)]
    value: serde_json::Value,
}

impl GraphMetric {
    /// Lifetime metrics carry one entry in `values`; some carry `value` directly
    pub fn value(&self) -> Option<&serde_json::Value> {
        self.values
            .first()
            .map(|v| &v.value)
            .or(self.value.as_ref())
            .filter(|v| !v.is_null())
    }

    pub fn count(&self) -> Option<i64> {
        self.value().and_then(|v| v.as_i64())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Adapters by platform; platforms without one fail with "not yet implemented"
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PublishAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Real Instagram, Facebook and TikTok adapters built from configuration
    pub fn from_config(
        config: &Config,
        capabilities: Arc<CapabilityRegistry>,
    ) -> crate::error::Result<Self> {
        Self::from_config_with_sleeper(config, capabilities, Arc::new(TokioSleeper))
    }

    pub fn from_config_with_sleeper(
        config: &Config,
        capabilities: Arc<CapabilityRegistry>,
        sleeper: Arc<dyn Sleeper>,
    ) -> crate::error::Result<Self> {
        let client = http_client(&config.http)?;
        let mut registry = Self::new();

        registry.register(Arc::new(instagram::InstagramAdapter::new(
            client.clone(),
            &config.instagram.graph_api_base,
            capabilities.clone(),
            sleeper.clone(),
        )));
        registry.register(Arc::new(facebook::FacebookAdapter::new(
            client.clone(),
            &config.facebook.graph_api_base,
            capabilities.clone(),
            sleeper.clone(),
        )));
        let mut tiktok =
            tiktok::TikTokAdapter::new(client, &config.tiktok.api_base, capabilities, sleeper)
                .post_to_inbox(config.tiktok.post_to_inbox);
        if let (Some(key), Some(secret)) = (&config.tiktok.client_key, &config.tiktok.client_secret) {
            tiktok = tiktok.with_client_credentials(key, SecretString::from(secret.clone()));
        }
        registry.register(Arc::new(tiktok));

        Ok(registry)
    }

    /// Add or replace the adapter for `adapter.platform()`
    pub fn register(&mut self, adapter: Arc<dyn PublishAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PublishAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().copied().collect();
        platforms.sort();
        platforms
    }
}
