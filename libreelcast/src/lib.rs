//! Reelcast - publish orchestration for short-form social video
//!
//! A post is one video plus context, fanned out into per-platform sub-posts
//! that are published to Instagram, Facebook and TikTok immediately, on
//! retry, or when the scheduler finds them due. The aggregate status of a
//! post is always derived from its sub-posts.

pub mod capabilities;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod reconcile;
pub mod scheduling;
pub mod service;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, PostWithPlatforms};
pub use error::{ReelcastError, Result};
pub use types::{Platform, PlatformPost, PlatformPostStatus, Post, PostStatus};
