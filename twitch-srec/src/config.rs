//! Application configuration.
//!
//! Every option can be given on the command line or through a `TSREC_*`
//! environment variable; `.env` files are loaded before parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use crate::provision;
use crate::status::twitch::DEFAULT_GQL_ENDPOINT;
use crate::{Error, Result};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// JSON file holding tracked streamers and the download location
    #[arg(long, env = "TSREC_STATE_FILE", default_value = "twitch-srec.json")]
    pub state_file: PathBuf,

    /// Directory for rolling log files
    #[arg(long, env = "TSREC_LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Download location used until one is saved in the state file
    #[arg(long, env = "TSREC_OUTPUT_DIR", default_value = "./recordings")]
    pub default_output_dir: PathBuf,

    /// Streamlink executable; defaults to the provisioned build, then `streamlink` on PATH
    #[arg(long, env = "TSREC_STREAMLINK_PATH")]
    pub streamlink_path: Option<PathBuf>,

    /// Stream quality passed to streamlink
    #[arg(long, env = "TSREC_QUALITY", default_value = "best")]
    pub quality: String,

    /// Extra argument for streamlink, repeatable
    #[arg(long = "streamlink-arg", allow_hyphen_values = true)]
    pub streamlink_args: Vec<String>,

    /// Seconds between two status checks of every streamer
    #[arg(long, env = "TSREC_CHECK_INTERVAL", default_value_t = 30)]
    pub check_interval_secs: u64,

    /// HTTP request timeout in seconds (0 disables it)
    #[arg(long, env = "TSREC_REQUEST_TIMEOUT", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Twitch GQL endpoint
    #[arg(long, env = "TSREC_GQL_ENDPOINT", default_value = DEFAULT_GQL_ENDPOINT)]
    pub gql_endpoint: String,

    /// Directory the portable streamlink build is installed into
    #[arg(long, env = "TSREC_TOOL_DIR", default_value = "./bin")]
    pub tool_dir: PathBuf,

    /// Milliseconds to coalesce state changes before saving
    #[arg(long, env = "TSREC_PERSIST_DEBOUNCE_MS", default_value_t = 250)]
    pub persist_debounce_ms: u64,

    /// Install or refresh the portable streamlink build before starting
    #[arg(long, env = "TSREC_UPDATE_TOOL")]
    pub update_tool: bool,
}

impl AppConfig {
    /// Check values clap cannot validate on its own.
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(Error::config("check interval must be at least one second"));
        }
        if self.quality.trim().is_empty() {
            return Err(Error::config("quality must not be empty"));
        }
        self.gql_url()?;
        Ok(())
    }

    pub fn gql_url(&self) -> Result<Url> {
        Url::parse(&self.gql_endpoint)
            .map_err(|e| Error::config(format!("invalid GQL endpoint '{}': {e}", self.gql_endpoint)))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Streamlink executable to run.
    pub fn streamlink_binary(&self) -> PathBuf {
        if let Some(path) = &self.streamlink_path {
            return path.clone();
        }
        let portable = provision::portable_launcher(&self.tool_dir);
        if portable.is_file() {
            portable
        } else {
            PathBuf::from("streamlink")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AppConfig {
        AppConfig::try_parse_from(std::iter::once("twitch-srec").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.persist_debounce(), Duration::from_millis(250));
        assert_eq!(config.quality, "best");
        assert_eq!(config.gql_endpoint, "https://gql.twitch.tv/gql");
        assert!(!config.update_tool);
        config.validate().unwrap();
    }

    #[test]
    fn test_streamlink_args_accept_flags() {
        let config = parse(&[
            "--streamlink-arg",
            "--twitch-disable-ads",
            "--streamlink-arg=--retry-streams=5",
        ]);
        assert_eq!(
            config.streamlink_args,
            vec!["--twitch-disable-ads", "--retry-streams=5"]
        );
    }

    #[test]
    fn test_rejects_zero_interval() {
        let config = parse(&["--check-interval-secs", "0"]);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = parse(&["--gql-endpoint", "not a url"]);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_explicit_streamlink_path_wins() {
        let config = parse(&["--streamlink-path", "/opt/streamlink"]);
        assert_eq!(config.streamlink_binary(), PathBuf::from("/opt/streamlink"));
    }

    #[test]
    fn test_falls_back_to_path_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse(&["--tool-dir", dir.path().to_str().unwrap()]);
        assert_eq!(config.streamlink_binary(), PathBuf::from("streamlink"));
    }
}
