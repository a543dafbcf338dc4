//! Capture engine trait and related types.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

use crate::status::twitch::stream_url;

/// Timestamp format used in recording file names.
const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H_%M_%S";

/// What to record and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub channel: String,
    pub stream_url: String,
    /// Final recording file, `<base>/<channel>/<channel> <timestamp>.mp4`.
    pub output_path: PathBuf,
}

impl CaptureRequest {
    pub fn new<Tz: TimeZone>(channel: &str, base: &Path, now: &DateTime<Tz>) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let file_name = format!("{} {}.mp4", channel, now.format(FILE_TIMESTAMP_FORMAT));
        Self {
            channel: channel.to_string(),
            stream_url: stream_url(channel),
            output_path: base.join(channel).join(file_name),
        }
    }
}

/// Notable lines in capture tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputStatus {
    StreamOpened,
    StreamEnded,
    Error(String),
}

/// External program that records a live stream to disk.
pub trait CaptureEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Build the command recording `request`.
    ///
    /// The runner configures stdio and process grouping before spawning.
    fn command(&self, request: &CaptureRequest) -> tokio::process::Command;

    /// Check if the engine is available (e.g., binary exists).
    fn is_available(&self) -> bool;

    /// Get the engine version string.
    fn version(&self) -> Option<String>;

    /// Recognise a line of tool output worth reporting.
    fn classify_output(&self, _line: &str) -> Option<OutputStatus> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn test_request_layout() {
        let now = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 7, 5, 1)
            .unwrap();
        let request = CaptureRequest::new("alice", Path::new("/videos"), &now);

        assert_eq!(request.channel, "alice");
        assert_eq!(request.stream_url, "https://twitch.tv/alice");
        assert_eq!(
            request.output_path,
            Path::new("/videos")
                .join("alice")
                .join("alice 2024-03-09 07_05_01.mp4")
        );
    }

    #[test]
    fn test_requests_differ_per_second() {
        let base = Path::new("rec");
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        assert_ne!(
            CaptureRequest::new("bob", base, &first).output_path,
            CaptureRequest::new("bob", base, &second).output_path
        );
    }
}
