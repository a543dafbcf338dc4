//! Registry change events.
//!
//! Subscribers (UI, persistence) receive one event per effective change.

use std::path::PathBuf;

use tokio::sync::broadcast;

use super::state::StreamerStatus;

/// A single field change with its new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Enabled(bool),
    Status(StreamerStatus),
    SkipCurrent(bool),
    Downloading(bool),
    Title(String),
    Thumbnail(String),
}

/// Events broadcast when registry content changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A channel started being tracked.
    Added { channel: String },
    /// One field of a tracked channel changed.
    Updated { channel: String, change: StateChange },
    /// A channel is no longer tracked.
    Removed { channel: String },
    /// The base download directory changed.
    LocationChanged { location: PathBuf },
}

impl RegistryEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::Added { channel } => format!("Streamer added: {}", channel),
            Self::Updated { channel, change } => {
                format!("Streamer {} updated: {:?}", channel, change)
            }
            Self::Removed { channel } => format!("Streamer removed: {}", channel),
            Self::LocationChanged { location } => {
                format!("Download location changed: {}", location.display())
            }
        }
    }

    /// The channel this event refers to, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Added { channel } | Self::Updated { channel, .. } | Self::Removed { channel } => {
                Some(channel)
            }
            Self::LocationChanged { .. } => None,
        }
    }
}

/// Default channel capacity for registry events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcaster for registry events.
#[derive(Clone)]
pub struct RegistryEventBroadcaster {
    sender: broadcast::Sender<RegistryEvent>,
}

impl RegistryEventBroadcaster {
    /// Create a new broadcaster with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new broadcaster with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    ///
    /// Returns the number of receivers that got it; 0 without subscribers.
    pub fn publish(&self, event: RegistryEvent) -> usize {
        tracing::trace!("Publishing registry event: {}", event.description());
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RegistryEventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = RegistryEventBroadcaster::new();
        let delivered = broadcaster.publish(RegistryEvent::Added {
            channel: "alice".to_string(),
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broadcaster = RegistryEventBroadcaster::new();
        let mut rx1 = broadcaster.subscribe();
        let mut rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        let event = RegistryEvent::Updated {
            channel: "alice".to_string(),
            change: StateChange::Status(StreamerStatus::Online),
        };
        assert_eq!(broadcaster.publish(event.clone()), 2);

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_channel() {
        let event = RegistryEvent::Removed {
            channel: "bob".to_string(),
        };
        assert_eq!(event.channel(), Some("bob"));

        let event = RegistryEvent::LocationChanged {
            location: PathBuf::from("/videos"),
        };
        assert_eq!(event.channel(), None);
        assert!(event.description().contains("/videos"));
    }
}
