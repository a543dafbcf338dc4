//! Per-channel state kept by the registry.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Thumbnail shown for channels that are offline, unknown, or not fetched yet.
pub const PLACEHOLDER_THUMBNAIL: &str =
    "https://static-cdn.jtvnw.net/ttv-static/404_preview-1280x720.jpg";

/// Title shown until the first status fetch completes.
pub const PENDING_TITLE: &str = "Fetching...";

/// Last known remote status of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamerStatus {
    Online,
    #[default]
    Offline,
    DoesNotExist,
}

impl StreamerStatus {
    pub fn is_online(self) -> bool {
        self == Self::Online
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::DoesNotExist => "DOES_NOT_EXIST",
        }
    }
}

impl fmt::Display for StreamerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one tracked channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerState {
    /// Record automatically whenever the channel goes live.
    pub enabled: bool,
    /// Last known remote status.
    pub status: StreamerStatus,
    /// Suppress recording for the current live session.
    pub skip_current: bool,
    /// A capture process is attached to this channel.
    pub is_downloading: bool,
    /// Last broadcast title.
    pub title: String,
    /// Preview image URL.
    pub thumbnail: String,
}

impl Default for StreamerState {
    fn default() -> Self {
        Self {
            enabled: true,
            status: StreamerStatus::Offline,
            skip_current: false,
            is_downloading: false,
            title: PENDING_TITLE.to_string(),
            thumbnail: PLACEHOLDER_THUMBNAIL.to_string(),
        }
    }
}

impl StreamerState {
    /// Whether the reconciler should start a capture for this state.
    pub fn wants_capture(&self) -> bool {
        self.status.is_online() && self.enabled && !self.skip_current && !self.is_downloading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let state = StreamerState::default();
        assert!(state.enabled);
        assert_eq!(state.status, StreamerStatus::Offline);
        assert!(!state.skip_current);
        assert!(!state.is_downloading);
        assert_eq!(state.thumbnail, PLACEHOLDER_THUMBNAIL);
    }

    #[test]
    fn test_status_serializes_in_screaming_case() {
        let json = serde_json::to_string(&StreamerStatus::DoesNotExist).unwrap();
        assert_eq!(json, "\"DOES_NOT_EXIST\"");
        let parsed: StreamerStatus = serde_json::from_str("\"ONLINE\"").unwrap();
        assert_eq!(parsed, StreamerStatus::Online);
    }

    #[test]
    fn test_wants_capture() {
        let mut state = StreamerState {
            status: StreamerStatus::Online,
            ..Default::default()
        };
        assert!(state.wants_capture());

        state.skip_current = true;
        assert!(!state.wants_capture());

        state.skip_current = false;
        state.is_downloading = true;
        assert!(!state.wants_capture());

        state.is_downloading = false;
        state.enabled = false;
        assert!(!state.wants_capture());
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let state: StreamerState = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert!(!state.enabled);
        assert_eq!(state.status, StreamerStatus::Offline);
        assert_eq!(state.title, PENDING_TITLE);
    }
}
