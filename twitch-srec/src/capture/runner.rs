//! Capture process supervisor.
//!
//! Keeps at most one capture process per channel. The process table is the
//! only place that knows whether a channel is being recorded; the registry's
//! `is_downloading` flag mirrors it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use process_utils::ProcessGroupExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::{CaptureEngine, CaptureRequest, OutputStatus};
use crate::streamer::{StreamerRegistry, channel_key};
use crate::utils::fs;
use crate::{Error, Result};

/// How a capture process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Whether the exit followed a stop request.
    pub stopped: bool,
}

/// Resolves once the capture process has exited and been unregistered.
pub type CaptureCompletion = Shared<BoxFuture<'static, CaptureExit>>;

/// Handle to a running capture.
#[derive(Clone)]
pub struct RunningCapture {
    pub channel: String,
    pub pid: u32,
    pub output_path: PathBuf,
    pub started_at: DateTime<Utc>,
    completion: CaptureCompletion,
}

impl RunningCapture {
    pub fn completion(&self) -> CaptureCompletion {
        self.completion.clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> CaptureExit {
        self.completion.clone().await
    }
}

impl std::fmt::Debug for RunningCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningCapture")
            .field("channel", &self.channel)
            .field("pid", &self.pid)
            .field("output_path", &self.output_path)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

struct ActiveCapture {
    /// Distinguishes successive captures of the same channel.
    id: u64,
    handle: RunningCapture,
    token: CancellationToken,
    stop_requested: Arc<AtomicBool>,
}

/// Starts and stops capture processes.
pub struct CaptureRunner {
    engine: Arc<dyn CaptureEngine>,
    registry: Arc<StreamerRegistry>,
    active: Arc<DashMap<String, ActiveCapture>>,
    next_id: AtomicU64,
    spawned_total: AtomicU64,
}

impl CaptureRunner {
    pub fn new(engine: Arc<dyn CaptureEngine>, registry: Arc<StreamerRegistry>) -> Self {
        Self {
            engine,
            registry,
            active: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            spawned_total: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<dyn CaptureEngine> {
        &self.engine
    }

    /// Start recording `channel` under `base`.
    ///
    /// Returns the existing handle if the channel is already being recorded.
    /// The registry's downloading flag is set once the process runs and
    /// cleared exactly once when it exits.
    pub async fn start(&self, channel: &str, base: &Path) -> Result<RunningCapture> {
        let key = channel_key(channel);
        let channel = key.as_ref();
        if let Some(existing) = self.active.get(channel) {
            return Ok(existing.handle.clone());
        }

        let request = CaptureRequest::new(channel, base, &Local::now());
        fs::ensure_parent_dir_with_op("creating capture directory", &request.output_path).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();

        // The entry stays locked until the child is registered, so racing
        // callers either see the handle or are the ones spawning.
        let (handle, mut child) = match self.active.entry(channel.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().handle.clone()),
            Entry::Vacant(slot) => {
                let mut cmd = self.engine.command(&request);
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .own_process_group();

                let child = cmd.spawn().map_err(|source| Error::Spawn {
                    channel: channel.to_string(),
                    source,
                })?;
                let pid = child.id().ok_or_else(|| Error::Spawn {
                    channel: channel.to_string(),
                    source: std::io::Error::other("process exited before it was registered"),
                })?;

                let completion = async move {
                    exit_rx.await.unwrap_or(CaptureExit {
                        code: None,
                        stopped: false,
                    })
                }
                .boxed()
                .shared();

                let handle = RunningCapture {
                    channel: channel.to_string(),
                    pid,
                    output_path: request.output_path.clone(),
                    started_at: Utc::now(),
                    completion,
                };
                slot.insert(ActiveCapture {
                    id,
                    handle: handle.clone(),
                    token: token.clone(),
                    stop_requested: stop_requested.clone(),
                });
                (handle, child)
            }
        };
        self.spawned_total.fetch_add(1, Ordering::Relaxed);

        info!(
            channel = %channel,
            pid = handle.pid,
            engine = self.engine.name(),
            "Capture started: {}",
            request.output_path.display()
        );

        // Set before the waiter exists so its reset can never be overtaken.
        let tracked = match self.registry.set_downloading(channel, true) {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };

        self.forward_output(channel, &mut child);
        self.spawn_waiter(
            channel.to_string(),
            id,
            child,
            token,
            stop_requested,
            exit_tx,
        );

        if !tracked {
            // Removed while the process was being spawned.
            warn!(channel = %channel, "Streamer vanished during capture start, stopping");
            self.stop(channel).await?;
            return Err(Error::not_found("Streamer", channel));
        }

        Ok(handle)
    }

    fn forward_output(&self, channel: &str, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            spawn_line_forwarder(self.engine.clone(), channel.to_string(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_forwarder(self.engine.clone(), channel.to_string(), stderr);
        }
    }

    fn spawn_waiter(
        &self,
        channel: String,
        id: u64,
        mut child: Child,
        token: CancellationToken,
        stop_requested: Arc<AtomicBool>,
        exit_tx: oneshot::Sender<CaptureExit>,
    ) {
        let active = self.active.clone();
        let registry = self.registry.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    debug!(channel = %channel, "Stop requested, killing capture process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(channel = %channel, "Error waiting for capture process: {}", e);
                    None
                }
            };
            let stopped = stop_requested.load(Ordering::Acquire);

            active.remove_if(&channel, |_, capture| capture.id == id);
            match registry.set_downloading(&channel, false) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(channel = %channel, error = %e, "Failed to clear downloading flag"),
            }

            if stopped {
                info!(channel = %channel, ?code, "Capture stopped");
            } else {
                info!(channel = %channel, ?code, "Capture finished");
            }
            let _ = exit_tx.send(CaptureExit { code, stopped });
        });
    }

    /// Request termination of the capture for `channel`.
    ///
    /// Signals the whole process tree and returns without waiting for the
    /// exit; use the handle's completion to observe it. Returns `false` when
    /// nothing was running.
    pub async fn stop(&self, channel: &str) -> Result<bool> {
        let key = channel_key(channel);
        let channel = key.as_ref();
        let Some((pid, token, stop_requested)) = self.active.get(channel).map(|capture| {
            (
                capture.handle.pid,
                capture.token.clone(),
                capture.stop_requested.clone(),
            )
        }) else {
            return Ok(false);
        };

        stop_requested.store(true, Ordering::Release);
        info!(channel = %channel, pid, "Stopping capture");

        let killed = tokio::task::spawn_blocking(move || process_utils::kill_tree(pid)).await;
        // Reaps the direct child even if the tree walk missed it.
        token.cancel();

        match killed {
            Ok(Ok(count)) => {
                debug!(channel = %channel, pid, "Signalled {} processes", count);
                Ok(true)
            }
            Ok(Err(e)) => Err(Error::ProcessTermination {
                pid,
                reason: e.to_string(),
            }),
            Err(e) => Err(Error::ProcessTermination {
                pid,
                reason: format!("kill task failed: {e}"),
            }),
        }
    }

    /// Stop every capture and wait until they have all exited.
    pub async fn stop_all(&self) -> Vec<String> {
        let running: Vec<RunningCapture> = self
            .active
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();

        for capture in &running {
            if let Err(e) = self.stop(&capture.channel).await {
                warn!(channel = %capture.channel, error = %e, "Failed to stop capture");
            }
        }
        futures::future::join_all(running.iter().map(|capture| capture.wait())).await;

        info!("Stopped {} captures", running.len());
        running.into_iter().map(|capture| capture.channel).collect()
    }

    pub fn get(&self, channel: &str) -> Option<RunningCapture> {
        self.active
            .get(channel_key(channel).as_ref())
            .map(|capture| capture.handle.clone())
    }

    pub fn is_running(&self, channel: &str) -> bool {
        self.active.contains_key(channel_key(channel).as_ref())
    }

    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of processes spawned since creation.
    pub fn spawned_total(&self) -> u64 {
        self.spawned_total.load(Ordering::Relaxed)
    }
}

fn spawn_line_forwarder<R>(engine: Arc<dyn CaptureEngine>, channel: String, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match engine.classify_output(&line) {
                    Some(OutputStatus::StreamOpened) => {
                        info!(channel = %channel, "Stream opened");
                    }
                    Some(OutputStatus::StreamEnded) => {
                        info!(channel = %channel, "Stream ended");
                    }
                    Some(OutputStatus::Error(err)) => {
                        warn!(channel = %channel, "{} error: {}", engine.name(), err);
                    }
                    None => debug!(channel = %channel, "{}: {}", engine.name(), line),
                },
                Ok(None) => break,
                Err(e) => {
                    debug!(channel = %channel, "Stopped reading capture output: {}", e);
                    break;
                }
            }
        }
    });
}
