//! Streamer state reconciliation.
//!
//! Periodically fetches the live status of every tracked channel, updates the
//! registry and starts or stops captures accordingly. Operator commands go
//! through the same type so they share the capture and registry handles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::capture::{CaptureRunner, RunningCapture};
use crate::status::StatusProvider;
use crate::streamer::{StreamerRegistry, StreamerStatus, channel_key};

/// Default check interval (30 seconds).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between two passes over all channels.
    pub check_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Outcome of one pass over all channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub failed: usize,
}

pub struct Reconciler {
    registry: Arc<StreamerRegistry>,
    provider: Arc<dyn StatusProvider>,
    captures: Arc<CaptureRunner>,
    config: ReconcilerConfig,
    /// Serialises the state transitions of one channel across overlapping ticks.
    channel_locks: DashMap<String, Arc<Mutex<()>>>,
    cancellation_token: CancellationToken,
}

impl Reconciler {
    pub fn new(
        registry: Arc<StreamerRegistry>,
        provider: Arc<dyn StatusProvider>,
        captures: Arc<CaptureRunner>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            captures,
            config,
            channel_locks: DashMap::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<StreamerRegistry> {
        &self.registry
    }

    pub fn captures(&self) -> &Arc<CaptureRunner> {
        &self.captures
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        self.channel_locks
            .entry(channel.to_string())
            .or_default()
            .clone()
    }

    /// Bring one channel in line with its remote status.
    pub async fn reconcile_channel(&self, channel: &str) -> Result<()> {
        let key = channel_key(channel);
        let channel = key.as_ref();
        let fetched = self.provider.fetch_status(channel).await?;

        let lock = self.channel_lock(channel);
        let _guard = lock.lock().await;

        let Some(previous) = self.registry.get(channel) else {
            debug!(channel = %channel, "Streamer removed while fetching status");
            return Ok(());
        };

        if fetched.status == StreamerStatus::DoesNotExist {
            warn!(channel = %channel, "Channel does not exist, removing");
            if let Err(e) = self.captures.stop(channel).await {
                warn!(channel = %channel, error = %e, "Failed to stop capture");
            }
            self.registry.remove(channel);
            self.channel_locks.remove(channel);
            return Ok(());
        }

        if previous.status == StreamerStatus::Online
            && fetched.status == StreamerStatus::Offline
            && previous.enabled
            && self.registry.set_skip_current(channel, false)?
        {
            debug!(channel = %channel, "Session ended, skip cleared");
        }

        let mut current = self.registry.get(channel).unwrap_or(previous);
        current.status = fetched.status;
        if current.wants_capture() {
            let location = self.registry.location();
            if let Err(e) = self.captures.start(channel, &location).await {
                error!(channel = %channel, error = %e, "Failed to start capture");
            }
        }

        self.registry.set_status(channel, fetched.status)?;
        if let Some(title) = fetched.title {
            self.registry.set_title(channel, title)?;
        }
        self.registry.set_thumbnail(channel, fetched.thumbnail)?;
        Ok(())
    }

    /// Reconcile every tracked channel concurrently.
    ///
    /// Failures are logged per channel and never affect the others.
    pub async fn tick(self: &Arc<Self>) -> TickSummary {
        let mut tasks = JoinSet::new();
        for channel in self.registry.list_ordered() {
            let this = self.clone();
            tasks.spawn(async move {
                let result = this.reconcile_channel(&channel).await;
                (channel, result)
            });
        }

        let mut summary = TickSummary::default();
        while let Some(joined) = tasks.join_next().await {
            summary.checked += 1;
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((channel, Err(e))) if e.is_not_found() => {
                    debug!(channel = %channel, "Streamer removed during check");
                }
                Ok((channel, Err(e))) => {
                    summary.failed += 1;
                    warn!(channel = %channel, error = %e, "Status check failed");
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("Status check task failed: {}", e);
                }
            }
        }

        debug!(
            "Checked {} streamers ({} failed)",
            summary.checked, summary.failed
        );
        summary
    }

    /// Run until cancelled.
    ///
    /// Downloading flags are reset first, then every channel is checked
    /// immediately and again on every interval. Ticks run on their own so a
    /// slow status fetch never delays the schedule.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Starting reconciler with {}s check interval",
            self.config.check_interval.as_secs()
        );
        self.registry.reset_downloading();

        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Reconciler received cancellation signal");
                    break;
                }
                _ = interval.tick() => {
                    let this = self.clone();
                    let token = self.cancellation_token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = this.tick() => {}
                        }
                    });
                }
            }
        }
    }

    // ========== Commands ==========

    /// Track a new channel and check it right away.
    pub fn add_streamer(self: &Arc<Self>, channel: &str) -> Result<String> {
        let channel = self.registry.add(channel)?;

        let this = self.clone();
        let name = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = this.reconcile_channel(&name).await {
                warn!(channel = %name, error = %e, "Initial status check failed");
            }
        });
        Ok(channel)
    }

    /// Stop any capture and forget the channel.
    ///
    /// Returns whether the channel was tracked.
    pub async fn remove_streamer(&self, channel: &str) -> Result<bool> {
        let key = channel_key(channel);
        let channel = key.as_ref();
        if let Err(e) = self.captures.stop(channel).await {
            warn!(channel = %channel, error = %e, "Failed to stop capture");
        }
        self.channel_locks.remove(channel);
        Ok(self.registry.remove(channel).is_some())
    }

    /// Takes effect on the next check.
    pub fn set_enabled(&self, channel: &str, enabled: bool) -> Result<()> {
        ignore_missing(channel, self.registry.set_enabled(channel, enabled))
    }

    /// Skip the current session and stop its capture.
    pub async fn skip_current(&self, channel: &str) -> Result<()> {
        let key = channel_key(channel);
        let channel = key.as_ref();
        if !self.registry.contains(channel) {
            debug!(channel = %channel, "Ignoring skip for unknown streamer");
            return Ok(());
        }
        ignore_missing(channel, self.registry.set_skip_current(channel, true))?;
        self.captures.stop(channel).await?;
        Ok(())
    }

    /// Start recording immediately, whatever the current status says.
    ///
    /// Returns `None` for unknown channels.
    pub async fn start_now(&self, channel: &str) -> Result<Option<RunningCapture>> {
        let key = channel_key(channel);
        let channel = key.as_ref();
        match self.registry.set_skip_current(channel, false) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(channel = %channel, "Ignoring start for unknown streamer");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let location = self.registry.location();
        let capture = self.captures.start(channel, &location).await?;
        Ok(Some(capture))
    }

    /// Change where future captures are written.
    pub fn change_location(&self, location: impl Into<PathBuf>) -> bool {
        self.registry.set_location(location)
    }

    /// Stop the loop and every running capture.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let stopped = self.captures.stop_all().await;
        if !stopped.is_empty() {
            info!("Stopped captures for: {}", stopped.join(", "));
        }
    }
}

fn ignore_missing(channel: &str, result: Result<bool>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(channel = %channel, "Ignoring command for unknown streamer");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureEngine, CaptureRequest};
    use crate::status::ChannelStatus;
    use crate::streamer::PLACEHOLDER_THUMBNAIL;
    use crate::{Error, status::twitch::live_thumbnail};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeProvider {
        statuses: SyncMutex<HashMap<String, StreamerStatus>>,
    }

    impl FakeProvider {
        fn set(&self, channel: &str, status: StreamerStatus) {
            self.statuses.lock().insert(channel.to_string(), status);
        }
    }

    #[async_trait]
    impl StatusProvider for FakeProvider {
        async fn fetch_status(&self, channel: &str) -> Result<ChannelStatus> {
            let status = self
                .statuses
                .lock()
                .get(channel)
                .copied()
                .ok_or_else(|| Error::Transport("connection refused".to_string()))?;
            Ok(match status {
                StreamerStatus::DoesNotExist => ChannelStatus {
                    status,
                    title: None,
                    thumbnail: PLACEHOLDER_THUMBNAIL.to_string(),
                },
                StreamerStatus::Online => ChannelStatus {
                    status,
                    title: Some(format!("{channel} live")),
                    thumbnail: live_thumbnail(channel),
                },
                StreamerStatus::Offline => ChannelStatus {
                    status,
                    title: Some(format!("{channel} live")),
                    thumbnail: PLACEHOLDER_THUMBNAIL.to_string(),
                },
            })
        }
    }

    /// Never spawns anything that could succeed.
    struct MissingEngine;

    impl CaptureEngine for MissingEngine {
        fn name(&self) -> &'static str {
            "missing"
        }

        fn command(&self, _request: &CaptureRequest) -> tokio::process::Command {
            tokio::process::Command::new("/definitely/not/a/capture-tool")
        }

        fn is_available(&self) -> bool {
            false
        }

        fn version(&self) -> Option<String> {
            None
        }
    }

    fn reconciler(provider: Arc<FakeProvider>) -> Arc<Reconciler> {
        let dir = std::env::temp_dir().join("twitch-srec-reconciler-tests");
        let registry = Arc::new(StreamerRegistry::new(dir));
        let captures = Arc::new(CaptureRunner::new(Arc::new(MissingEngine), registry.clone()));
        Arc::new(Reconciler::new(
            registry,
            provider,
            captures,
            ReconcilerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_offline_channel_updates_metadata() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("alice", StreamerStatus::Offline);
        let reconciler = reconciler(provider);
        reconciler.registry().add("alice").unwrap();

        reconciler.reconcile_channel("alice").await.unwrap();

        let state = reconciler.registry().get("alice").unwrap();
        assert_eq!(state.status, StreamerStatus::Offline);
        assert_eq!(state.title, "alice live");
        assert!(!state.is_downloading);
        assert_eq!(reconciler.captures().spawned_total(), 0);
    }

    #[tokio::test]
    async fn test_transport_error_leaves_state_untouched() {
        let reconciler = reconciler(Arc::new(FakeProvider::default()));
        reconciler.registry().add("alice").unwrap();
        let before = reconciler.registry().get("alice").unwrap();

        let err = reconciler.reconcile_channel("alice").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(reconciler.registry().get("alice").unwrap(), before);
    }

    #[tokio::test]
    async fn test_tick_isolates_failures() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("alice", StreamerStatus::Offline);
        let reconciler = reconciler(provider);
        reconciler.registry().add("alice").unwrap();
        reconciler.registry().add("broken").unwrap();

        let summary = reconciler.tick().await;
        assert_eq!(summary, TickSummary { checked: 2, failed: 1 });
        assert_eq!(
            reconciler.registry().get("alice").unwrap().title,
            "alice live"
        );
    }

    #[tokio::test]
    async fn test_does_not_exist_removes_channel() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("bob", StreamerStatus::DoesNotExist);
        let reconciler = reconciler(provider);
        reconciler.registry().add("bob").unwrap();

        reconciler.tick().await;
        assert!(!reconciler.registry().contains("bob"));

        // Later ticks no longer see it.
        assert_eq!(reconciler.tick().await.checked, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_still_records_status() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("alice", StreamerStatus::Online);
        let reconciler = reconciler(provider);
        reconciler.registry().add("alice").unwrap();

        reconciler.reconcile_channel("alice").await.unwrap();

        let state = reconciler.registry().get("alice").unwrap();
        assert_eq!(state.status, StreamerStatus::Online);
        assert!(!state.is_downloading);
        assert_eq!(state.thumbnail, live_thumbnail("alice"));
    }

    #[tokio::test]
    async fn test_offline_transition_clears_skip_only_when_enabled() {
        let provider = Arc::new(FakeProvider::default());
        let reconciler = reconciler(provider.clone());
        let registry = reconciler.registry().clone();
        registry.add("alice").unwrap();
        registry.add("dave").unwrap();
        for channel in ["alice", "dave"] {
            registry.set_status(channel, StreamerStatus::Online).unwrap();
            registry.set_skip_current(channel, true).unwrap();
            provider.set(channel, StreamerStatus::Offline);
        }
        registry.set_enabled("dave", false).unwrap();

        reconciler.tick().await;

        assert!(!registry.get("alice").unwrap().skip_current);
        assert!(registry.get("dave").unwrap().skip_current);
    }

    #[tokio::test]
    async fn test_commands_on_unknown_channels_are_noops() {
        let reconciler = reconciler(Arc::new(FakeProvider::default()));

        reconciler.set_enabled("nobody", false).unwrap();
        reconciler.skip_current("nobody").await.unwrap();
        assert!(reconciler.start_now("nobody").await.unwrap().is_none());
        assert!(!reconciler.remove_streamer("nobody").await.unwrap());
        assert!(reconciler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_add_streamer_rejects_duplicates() {
        let reconciler = reconciler(Arc::new(FakeProvider::default()));
        assert_eq!(reconciler.add_streamer("Alice").unwrap(), "alice");
        let err = reconciler.add_streamer("alice").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_change_location() {
        let reconciler = reconciler(Arc::new(FakeProvider::default()));
        assert!(reconciler.change_location("/elsewhere"));
        assert!(!reconciler.change_location("/elsewhere"));
        assert_eq!(reconciler.registry().location(), PathBuf::from("/elsewhere"));
    }
}
