//! Streamlink capture engine implementation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::engine::{CaptureEngine, CaptureRequest, OutputStatus};
use crate::{Error, Result};

/// Streamlink settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamlinkConfig {
    /// Executable name or path.
    pub binary_path: PathBuf,
    /// Quality selector, e.g. `best`.
    pub quality: String,
    /// Extra arguments placed before the stream URL.
    pub extra_args: Vec<String>,
}

impl Default for StreamlinkConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("streamlink"),
            quality: "best".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Records Twitch streams with streamlink writing straight to the output file.
pub struct StreamlinkEngine {
    config: StreamlinkConfig,
    /// Cached version string.
    version: Option<String>,
}

impl StreamlinkEngine {
    /// Build the engine, running `streamlink --version` synchronously.
    ///
    /// From async code use [`StreamlinkEngine::detect`].
    pub fn new(config: StreamlinkConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        match &version {
            Some(v) => debug!("Detected streamlink {}", v),
            None => debug!(
                "streamlink not found at {}",
                config.binary_path.display()
            ),
        }
        Self { config, version }
    }

    /// Build the engine with version detection moved off the async runtime.
    pub async fn detect(config: StreamlinkConfig) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::new(config))
            .await
            .map_err(|e| Error::Other(format!("streamlink detection task failed: {e}")))
    }

    pub fn config(&self) -> &StreamlinkConfig {
        &self.config
    }

    fn detect_version(path: &Path) -> Option<String> {
        let (program, prefix) = launcher(path);
        let mut cmd = process_utils::std_command(program);
        cmd.args(prefix).arg("--version");
        cmd.output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn build_args(&self, request: &CaptureRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(4 + self.config.extra_args.len());

        args.push("-o".into());
        args.push(request.output_path.clone().into_os_string());

        args.extend(self.config.extra_args.iter().map(OsString::from));

        // Stream URL must be the first positional argument followed by quality
        args.push(request.stream_url.clone().into());
        args.push(self.config.quality.clone().into());

        args
    }

    fn parse_output(line: &str) -> Option<OutputStatus> {
        if line.contains("[cli][info] Stream ended") {
            return Some(OutputStatus::StreamEnded);
        }
        if line.contains("[cli][info] Opening stream") {
            return Some(OutputStatus::StreamOpened);
        }
        if line.contains("[cli][error]") || line.contains("error: ") {
            return Some(OutputStatus::Error(line.to_string()));
        }
        None
    }
}

impl Default for StreamlinkEngine {
    fn default() -> Self {
        Self::new(StreamlinkConfig::default())
    }
}

/// Program and leading arguments needed to run `path`.
///
/// Batch launchers shipped by the portable Windows build have to go through
/// `cmd /c`.
fn launcher(path: &Path) -> (OsString, Vec<OsString>) {
    let is_batch = cfg!(windows)
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("bat") || e.eq_ignore_ascii_case("cmd"));

    if is_batch {
        (
            OsString::from("cmd"),
            vec![OsString::from("/c"), path.as_os_str().to_owned()],
        )
    } else {
        (path.as_os_str().to_owned(), Vec::new())
    }
}

impl CaptureEngine for StreamlinkEngine {
    fn name(&self) -> &'static str {
        "streamlink"
    }

    fn command(&self, request: &CaptureRequest) -> tokio::process::Command {
        let (program, prefix) = launcher(&self.config.binary_path);
        let mut cmd = process_utils::tokio_command(program);
        cmd.args(prefix).args(self.build_args(request));
        cmd
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn classify_output(&self, line: &str) -> Option<OutputStatus> {
        Self::parse_output(line)
    }
}
