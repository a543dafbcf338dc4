//! Remote live-status lookups.

mod models;
pub mod twitch;

use async_trait::async_trait;

use crate::Result;
use crate::streamer::StreamerStatus;

pub use twitch::TwitchStatusProvider;

/// Result of one status lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub status: StreamerStatus,
    /// Last broadcast title; `None` when the channel does not exist.
    pub title: Option<String>,
    pub thumbnail: String,
}

/// Queries the remote service for a channel's live status.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Fetch the current status of `channel`.
    ///
    /// Network and decoding failures are reported as `Error::Transport`.
    async fn fetch_status(&self, channel: &str) -> Result<ChannelStatus>;
}
