//! Service layer for Reelcast
//!
//! `ReelcastService` is the facade the binaries use. It owns the shared
//! resources (database, configuration, capability registry, adapters, event
//! bus) and hands out the specialized services:
//!
//! - `PublishCoordinator`: publish now, retry, per-sub-post attempts
//! - `SchedulerTrigger`: authenticated batch over due sub-posts
//! - `PostService`: drafts, captions, scheduling, cancel, delete, queue
//! - `AccountService`: connected accounts, OAuth state, token refresh
//! - `AnalyticsService`: vendor metrics sync and totals
//! - `EventBus`: progress events
//!
//! ```no_run
//! use libreelcast::service::ReelcastService;
//!
//! # async fn example() -> libreelcast::Result<()> {
//! let service = ReelcastService::new().await?;
//! let summary = service.scheduler().run(chrono::Utc::now().timestamp()).await?;
//! println!("{} processed", summary.processed);
//! # Ok(())
//! # }
//! ```

pub mod accounts;
pub mod analytics;
pub mod events;
pub mod posts;
pub mod publishing;
pub mod scheduler;

pub use publishing::{Outcome, PlatformResult, PublishReport};
pub use scheduler::{BatchSummary, TriggerCredentials};

use std::sync::Arc;

use self::accounts::AccountService;
use self::analytics::AnalyticsService;
use self::events::EventBus;
use self::posts::PostService;
use self::publishing::PublishCoordinator;
use self::scheduler::SchedulerTrigger;
use crate::capabilities::CapabilityRegistry;
use crate::crypto::TokenCipher;
use crate::platforms::AdapterRegistry;
use crate::{Config, Database, Result};

pub struct ReelcastService {
    db: Arc<Database>,
    config: Arc<Config>,
    capabilities: Arc<CapabilityRegistry>,
    coordinator: PublishCoordinator,
    scheduler: SchedulerTrigger,
    posts: PostService,
    accounts: AccountService,
    analytics: AnalyticsService,
    event_bus: EventBus,
}

impl ReelcastService {
    /// Load configuration from the default location and open the database
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Real vendor adapters built from `config`
    pub async fn from_config(config: Config) -> Result<Self> {
        let capabilities = Arc::new(CapabilityRegistry::with_caption_overrides(&config.captions));
        let adapters = AdapterRegistry::from_config(&config, capabilities.clone())?;
        Self::with_adapters(config, capabilities, adapters).await
    }

    /// Caller-supplied adapters, e.g. mocks
    pub async fn with_adapters(
        config: Config,
        capabilities: Arc<CapabilityRegistry>,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_path()).await?);
        let config = Arc::new(config);
        let event_bus = EventBus::default();

        // A missing key is not fatal here: reading posts and scheduling still
        // work, and each publish reports the problem on its sub-post.
        let cipher = TokenCipher::from_env(&config.security.token_key_env);
        if let Err(error) = &cipher {
            tracing::warn!(%error, "token cipher unavailable");
        }

        let analytics = AnalyticsService::new(Arc::clone(&db), adapters.clone(), cipher.clone());
        let coordinator = PublishCoordinator::new(
            Arc::clone(&db),
            adapters,
            cipher.clone(),
            event_bus.clone(),
        );
        let scheduler = SchedulerTrigger::new(coordinator.clone(), config.scheduler.clone());
        let posts = PostService::new(Arc::clone(&db), Arc::clone(&capabilities));
        let accounts = AccountService::new(Arc::clone(&db), cipher);

        Ok(Self {
            db,
            config,
            capabilities,
            coordinator,
            scheduler,
            posts,
            accounts,
            analytics,
            event_bus,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn publishing(&self) -> &PublishCoordinator {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &SchedulerTrigger {
        &self.scheduler
    }

    pub fn posts(&self) -> &PostService {
        &self.posts
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn analytics(&self) -> &AnalyticsService {
        &self.analytics
    }

    pub fn subscribe(&self) -> events::EventReceiver {
        self.event_bus.subscribe()
    }
}
