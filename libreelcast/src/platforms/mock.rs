//! Mock adapter for tests
//!
//! A configurable [`PublishAdapter`] that can succeed, fail with a chosen
//! [`PlatformError`], panic, or follow a script of outcomes call by call.
//! Clones share their counters, so a test can hand one clone to an
//! [`AdapterRegistry`](super::AdapterRegistry) and inspect the other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use secrecy::SecretString;

use super::{
    AdapterResult, PostInsights, PublishAdapter, PublishReceipt, PublishRequest, RefreshedToken,
    Sleeper,
};
use crate::error::PlatformError;
use crate::types::Platform;

/// What the mock does on one call
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    Succeed,
    Fail(PlatformError),
    Panic(String),
}

/// A request as the mock saw it, without the token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub account_id: String,
    pub media_url: String,
    pub caption: String,
}

#[derive(Clone)]
pub struct MockAdapter {
    platform: Platform,
    /// Used once the script is exhausted
    default_outcome: MockOutcome,
    script: Arc<Mutex<VecDeque<MockOutcome>>>,
    delay: Duration,
    call_count: Arc<Mutex<usize>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    insights: Option<AdapterResult<PostInsights>>,
    insight_lookups: Arc<Mutex<Vec<String>>>,
    /// Access token handed out by `refresh_token`, or the error to return
    refresh: Option<AdapterResult<String>>,
    refresh_calls: Arc<Mutex<usize>>,
}

impl MockAdapter {
    pub fn new(platform: Platform, default_outcome: MockOutcome) -> Self {
        Self {
            platform,
            default_outcome,
            script: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            call_count: Arc::new(Mutex::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            insights: None,
            insight_lookups: Arc::new(Mutex::new(Vec::new())),
            refresh: None,
            refresh_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn success(platform: Platform) -> Self {
        Self::new(platform, MockOutcome::Succeed)
    }

    pub fn failure(platform: Platform, error: PlatformError) -> Self {
        Self::new(platform, MockOutcome::Fail(error))
    }

    pub fn panicking(platform: Platform, message: &str) -> Self {
        Self::new(platform, MockOutcome::Panic(message.to_string()))
    }

    /// Play `outcomes` in order, then fall back to success
    pub fn scripted(platform: Platform, outcomes: Vec<MockOutcome>) -> Self {
        let adapter = Self::success(platform);
        lock(&adapter.script).extend(outcomes);
        adapter
    }

    /// Simulated network latency before each outcome
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer every insights lookup with `insights`
    pub fn with_insights(mut self, insights: AdapterResult<PostInsights>) -> Self {
        self.insights = Some(insights);
        self
    }

    /// Refresh grants answer with `access_token` valid for an hour, or fail
    pub fn with_refresh(mut self, access_token: AdapterResult<&str>) -> Self {
        self.refresh = Some(access_token.map(str::to_string));
        self
    }

    pub fn refresh_call_count(&self) -> usize {
        *lock(&self.refresh_calls)
    }

    /// External ids passed to `fetch_insights`, in call order
    pub fn insight_lookups(&self) -> Vec<String> {
        lock(&self.insight_lookups).clone()
    }

    pub fn publish_call_count(&self) -> usize {
        *lock(&self.call_count)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn published_captions(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.caption).collect()
    }

    fn next_outcome(&self) -> MockOutcome {
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

#[async_trait]
impl PublishAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn publish(&self, request: &PublishRequest) -> AdapterResult<PublishReceipt> {
        let call = {
            let mut count = lock(&self.call_count);
            *count += 1;
            *count
        };
        lock(&self.requests).push(RecordedRequest {
            account_id: request.account_id.clone(),
            media_url: request.media_url.clone(),
            caption: request.caption.clone(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_outcome() {
            MockOutcome::Succeed => {
                let external_id = format!("{}-mock-{}", self.platform, call);
                Ok(PublishReceipt {
                    permalink_url: Some(format!("https://{}.example/p/{}", self.platform, external_id)),
                    external_id,
                })
            }
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Panic(message) => panic!("{}", message),
        }
    }

    async fn refresh_token(
        &self,
        _refresh_token: &SecretString,
    ) -> AdapterResult<Option<RefreshedToken>> {
        *lock(&self.refresh_calls) += 1;
        match &self.refresh {
            None => Ok(None),
            Some(Err(error)) => Err(error.clone()),
            Some(Ok(token)) => Ok(Some(RefreshedToken {
                access_token: SecretString::from(token.clone()),
                refresh_token: None,
                expires_in: Some(3600),
            })),
        }
    }

    async fn fetch_insights(
        &self,
        _access_token: &SecretString,
        external_id: &str,
    ) -> AdapterResult<Option<PostInsights>> {
        lock(&self.insight_lookups).push(external_id.to_string());
        self.insights.clone().transpose()
    }
}

/// Sleeper that returns immediately and remembers what it was asked to wait
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        lock(&self.delays).clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        lock(&self.delays).push(duration);
    }
}

// A panicking outcome never holds one of these locks, but recover anyway so
// one bad test cannot cascade.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
