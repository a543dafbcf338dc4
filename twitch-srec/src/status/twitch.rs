//! Twitch GQL status provider.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, trace};
use url::Url;

use super::models::GqlResponse;
use super::{ChannelStatus, StatusProvider};
use crate::streamer::{PLACEHOLDER_THUMBNAIL, StreamerStatus};
use crate::{Error, Result};

pub const DEFAULT_GQL_ENDPOINT: &str = "https://gql.twitch.tv/gql";

/// Public web client id used by twitch.tv itself.
const CLIENT_ID: &str = "kimne78kx3ncx6brgo4mv6wki5h1ko";
const REFERER: &str = "https://www.twitch.tv/";
const STREAM_METADATA_OPERATION: &str = "StreamMetadata";
const STREAM_METADATA_HASH: &str =
    "1c719a40e481453e5c48d9bb585d971b8b372f8ebb105b17076722264dfa5b3e";

/// Preview image Twitch serves for a live channel.
pub fn live_thumbnail(channel: &str) -> String {
    format!("https://static-cdn.jtvnw.net/previews-ttv/live_user_{channel}-1280x720.jpg")
}

/// Canonical watch URL of a channel.
pub fn stream_url(channel: &str) -> String {
    format!("https://twitch.tv/{channel}")
}

pub struct TwitchStatusProvider {
    client: Client,
    endpoint: Url,
    /// Random per-process device id, sent like a browser session would.
    device_id: String,
}

impl TwitchStatusProvider {
    /// `endpoint` is normally [`DEFAULT_GQL_ENDPOINT`]; tests point it at a
    /// local server.
    pub fn new(client: Client, endpoint: Url) -> Self {
        Self {
            client,
            endpoint,
            device_id: format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>()),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn build_query(channel: &str) -> String {
        serde_json::json!([{
            "operationName": STREAM_METADATA_OPERATION,
            "variables": { "channelLogin": channel },
            "extensions": {
                "persistedQuery": {
                    "version": 1,
                    "sha256Hash": STREAM_METADATA_HASH,
                }
            },
        }])
        .to_string()
    }
}

/// Decode a `StreamMetadata` response body.
///
/// The endpoint answers batched queries with an array; a bare object is
/// accepted as well.
pub(crate) fn parse_status(channel: &str, body: &str) -> Result<ChannelStatus> {
    let response = match serde_json::from_str::<Vec<GqlResponse>>(body) {
        Ok(responses) => responses.into_iter().next(),
        Err(e) => {
            trace!("Failed to parse as array: {}", e);
            Some(
                serde_json::from_str::<GqlResponse>(body)
                    .map_err(|e| Error::Transport(format!("invalid status response: {e}")))?,
            )
        }
    };

    let data = response
        .and_then(|r| r.data)
        .ok_or_else(|| Error::Transport("status response has no data".to_string()))?;

    let Some(user) = data.user else {
        return Ok(ChannelStatus {
            status: StreamerStatus::DoesNotExist,
            title: None,
            thumbnail: PLACEHOLDER_THUMBNAIL.to_string(),
        });
    };

    let title = user
        .last_broadcast
        .and_then(|b| b.title)
        .unwrap_or_default();

    let (status, thumbnail) = match user.stream {
        Some(_) => (StreamerStatus::Online, live_thumbnail(channel)),
        None => (StreamerStatus::Offline, PLACEHOLDER_THUMBNAIL.to_string()),
    };

    Ok(ChannelStatus {
        status,
        title: Some(title),
        thumbnail,
    })
}

#[async_trait]
impl StatusProvider for TwitchStatusProvider {
    async fn fetch_status(&self, channel: &str) -> Result<ChannelStatus> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Client-Id", CLIENT_ID)
            .header("X-Device-Id", &self.device_id)
            .header(reqwest::header::REFERER, REFERER)
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(Self::build_query(channel))
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        trace!(channel = %channel, "status body: {}", body);

        let status = parse_status(channel, &body)?;
        debug!(channel = %channel, status = %status.status, "Fetched status");
        Ok(status)
    }
}
