//! Progress events for publish runs
//!
//! An in-process broadcast bus. The coordinator emits one event per step of
//! each sub-post; the daemon logs them, tests assert on them. Emitting with
//! no subscribers is a no-op and a lagging subscriber never blocks a publish.
//!
//! ```no_run
//! use libreelcast::service::events::{Event, EventBus};
//! use libreelcast::types::Platform;
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::PublishStarted {
//!     post_id: "abc123".to_string(),
//!     platforms: vec![Platform::Instagram],
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Platform, PostStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer; a subscriber that falls
    /// further behind loses the oldest events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run over one post's sub-posts is starting
    PublishStarted {
        post_id: String,
        platforms: Vec<Platform>,
    },

    /// The coordinator now owns this attempt
    PlatformClaimed {
        post_id: String,
        platform_post_id: String,
        platform: Platform,
        attempt: i64,
    },

    PlatformPublished {
        post_id: String,
        platform_post_id: String,
        platform: Platform,
        external_id: String,
        url: Option<String>,
    },

    PlatformFailed {
        post_id: String,
        platform_post_id: String,
        platform: Platform,
        error: String,
    },

    /// Aggregate status after reconciliation
    PublishCompleted { post_id: String, status: PostStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_emission_and_subscription() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.emit(Event::PublishStarted {
            post_id: "post-1".to_string(),
            platforms: vec![Platform::Instagram, Platform::Tiktok],
        });

        match receiver.recv().await.unwrap() {
            Event::PublishStarted { post_id, platforms } => {
                assert_eq!(post_id, "post-1");
                assert_eq!(platforms, vec![Platform::Instagram, Platform::Tiktok]);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let event = Event::PlatformFailed {
            post_id: "post-2".to_string(),
            platform_post_id: "pp-2".to_string(),
            platform: Platform::Facebook,
            error: "No connected account found".to_string(),
        };
        bus.emit(event.clone());

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_no_subscribers() {
        let bus = EventBus::new(10);
        bus.emit(Event::PublishCompleted {
            post_id: "post-3".to_string(),
            status: PostStatus::Published,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::PlatformPublished {
            post_id: "post-4".to_string(),
            platform_post_id: "pp-4".to_string(),
            platform: Platform::Tiktok,
            external_id: "p-123".to_string(),
            url: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"platform_published\""));
        assert!(json.contains("\"platform\":\"tiktok\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::default();
        let _first = bus.subscribe();
        let _second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
