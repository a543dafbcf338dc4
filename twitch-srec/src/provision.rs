//! Capture tool provisioning.
//!
//! Downloads the portable streamlink build from GitHub releases into the
//! tool directory. A lock file marks an update in progress; a version marker
//! records what is installed.

use std::cmp::Ordering;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::utils::fs;
use crate::{Error, Result};

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com/";
pub const STREAMLINK_PORTABLE_REPO: &str = "beardypig/streamlink-portable";

const LOCK_FILE: &str = "download-process.lock";
const VERSION_FILE: &str = "streamlink.version";

/// One progress report of a running update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionProgress {
    pub step: String,
    pub detail: String,
}

impl ProvisionProgress {
    fn new(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: detail.into(),
        }
    }
}

/// Installs or refreshes the external capture tool.
#[async_trait]
pub trait ToolProvisioner: Send + Sync {
    /// Whether the installed tool is missing, incomplete or outdated.
    async fn check_needs_update(&self) -> Result<bool>;

    /// Install the latest version, returning its version string.
    async fn update(&self, progress: &(dyn Fn(ProvisionProgress) + Send + Sync))
    -> Result<String>;
}

#[derive(Debug, Clone, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct ReleaseAsset {
    name: String,
    #[serde(default)]
    size: u64,
    browser_download_url: String,
}

/// Platform tag used in portable build asset names.
pub fn platform_tag() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win32",
        "macos" => "darwin",
        other => other,
    }
}

/// Path of the launcher inside an extracted portable build.
pub fn portable_launcher(tool_dir: &Path) -> PathBuf {
    let dir = tool_dir.join("streamlink");
    if cfg!(windows) {
        dir.join("streamlink.bat")
    } else {
        dir.join("streamlink")
    }
}

/// Numeric components of a version tag, `v2.4.0-1` -> `[2, 4, 0, 1]`.
fn version_parts(tag: &str) -> Vec<u64> {
    tag.trim()
        .trim_start_matches(['v', 'V'])
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Compare two dotted version tags, missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (version_parts(a), version_parts(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Extract `archive` into `dest`, calling `on_entry` for every file written.
///
/// Entries escaping `dest` are skipped.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    mut on_entry: impl FnMut(&str),
) -> Result<usize> {
    let file =
        std::fs::File::open(archive).map_err(|e| fs::io_error("opening archive", archive, e))?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| Error::Other(format!("invalid archive {}: {e}", archive.display())))?;

    let mut written = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::Other(format!("invalid archive entry {index}: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::ensure_dir_all_sync_with_op("creating extracted directory", &target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::ensure_dir_all_sync_with_op("creating extracted directory", parent)?;
        }

        let mut out = std::fs::File::create(&target)
            .map_err(|e| fs::io_error("creating extracted file", &target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| fs::io_error("extracting file", &target, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                    .map_err(|e| fs::io_error("setting permissions", &target, e))?;
            }
        }

        on_entry(entry.name());
        written += 1;
    }
    Ok(written)
}

/// Fetches portable builds from a GitHub repository's latest release.
pub struct GithubReleaseProvisioner {
    client: Client,
    api_base: Url,
    repo: String,
    tool_dir: PathBuf,
    platform: String,
}

impl GithubReleaseProvisioner {
    pub fn new(client: Client, tool_dir: impl Into<PathBuf>) -> Result<Self> {
        let api_base = Url::parse(DEFAULT_GITHUB_API)
            .map_err(|e| Error::config(format!("invalid GitHub API URL: {e}")))?;
        Ok(Self {
            client,
            api_base,
            repo: STREAMLINK_PORTABLE_REPO.to_string(),
            tool_dir: tool_dir.into(),
            platform: platform_tag().to_string(),
        })
    }

    /// Point at another API host (GitHub Enterprise, test servers).
    pub fn with_api_base(mut self, api_base: Url) -> Self {
        self.api_base = api_base;
        self
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = repo.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn tool_dir(&self) -> &Path {
        &self.tool_dir
    }

    pub fn lock_path(&self) -> PathBuf {
        self.tool_dir.join(LOCK_FILE)
    }

    fn version_path(&self) -> PathBuf {
        self.tool_dir.join(VERSION_FILE)
    }

    pub fn streamlink_binary(&self) -> PathBuf {
        portable_launcher(&self.tool_dir)
    }

    pub async fn installed_version(&self) -> Option<String> {
        tokio::fs::read_to_string(self.version_path())
            .await
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn latest_release(&self) -> Result<Release> {
        let url = self
            .api_base
            .join(&format!("repos/{}/releases/latest", self.repo))
            .map_err(|e| Error::config(format!("invalid release URL: {e}")))?;

        debug!("Fetching latest release from {}", url);
        let release = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json::<Release>()
            .await?;
        Ok(release)
    }

    fn pick_asset<'a>(&self, release: &'a Release) -> Option<&'a ReleaseAsset> {
        release
            .assets
            .iter()
            .find(|asset| asset.name.contains(&self.platform))
    }

    async fn download(
        &self,
        asset: &ReleaseAsset,
        target: &Path,
        progress: &(dyn Fn(ProvisionProgress) + Send + Sync),
    ) -> Result<u64> {
        let response = self
            .client
            .get(&asset.browser_download_url)
            .send()
            .await?
            .error_for_status()?;
        let total = match asset.size {
            0 => response.content_length().unwrap_or(0),
            size => size,
        };

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| fs::io_error("creating download file", target, e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut last_percent = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| fs::io_error("writing download file", target, e))?;
            downloaded += chunk.len() as u64;

            if total > 0 {
                let percent = (downloaded.saturating_mul(100) / total).min(100);
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    progress(ProvisionProgress::new(
                        "Downloading Streamlink...",
                        format!("{percent}%"),
                    ));
                }
            }
        }
        file.flush()
            .await
            .map_err(|e| fs::io_error("flushing download file", target, e))?;
        Ok(downloaded)
    }
}

#[async_trait]
impl ToolProvisioner for GithubReleaseProvisioner {
    async fn check_needs_update(&self) -> Result<bool> {
        if tokio::fs::try_exists(self.lock_path()).await.unwrap_or(false) {
            info!("Previous tool update did not finish");
            return Ok(true);
        }
        let Some(installed) = self.installed_version().await else {
            return Ok(true);
        };

        let release = self.latest_release().await?;
        let newer = self.pick_asset(&release).is_some()
            && compare_versions(&release.tag_name, &installed) == Ordering::Greater;
        debug!(
            "Installed tool {}, latest {}, update needed: {}",
            installed, release.tag_name, newer
        );
        Ok(newer)
    }

    async fn update(
        &self,
        progress: &(dyn Fn(ProvisionProgress) + Send + Sync),
    ) -> Result<String> {
        let release = self.latest_release().await?;
        let asset = self.pick_asset(&release).cloned().ok_or_else(|| {
            Error::not_found("Release asset", format!("{} ({})", release.tag_name, self.platform))
        })?;

        fs::ensure_dir_all_with_op("creating tool directory", &self.tool_dir).await?;
        let lock_path = self.lock_path();
        tokio::fs::write(&lock_path, b"")
            .await
            .map_err(|e| fs::io_error("creating lock file", &lock_path, e))?;

        info!("Downloading {} {}", asset.name, release.tag_name);
        let archive = self.tool_dir.join(&asset.name);
        let size = self.download(&asset, &archive, progress).await?;
        debug!("Downloaded {} bytes", size);

        progress(ProvisionProgress::new("Extracting Streamlink...", ""));
        let (entry_tx, mut entry_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let extract = {
            let archive = archive.clone();
            let dest = self.tool_dir.clone();
            tokio::task::spawn_blocking(move || {
                extract_archive(&archive, &dest, |name| {
                    let _ = entry_tx.send(name.to_string());
                })
            })
        };
        while let Some(name) = entry_rx.recv().await {
            progress(ProvisionProgress::new("Extracting", name));
        }
        let extracted = extract
            .await
            .map_err(|e| Error::Other(format!("extract task failed: {e}")))??;

        fs::remove_file_if_exists("removing archive", &archive).await?;
        fs::remove_file_if_exists("removing lock file", &lock_path).await?;
        let version_path = self.version_path();
        tokio::fs::write(&version_path, &release.tag_name)
            .await
            .map_err(|e| fs::io_error("writing version marker", &version_path, e))?;

        info!(
            "Installed streamlink {} ({} files)",
            release.tag_name, extracted
        );
        Ok(release.tag_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::http_client::build_client;
    use std::io::Write;
    use std::time::Duration;
    use zip::write::SimpleFileOptions;

    fn client() -> Client {
        build_client(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("2.4.0", "2.3.9"), Ordering::Greater);
        assert_eq!(compare_versions("v2.4.0", "2.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.4", "2.4.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.10.0", "2.9.1"), Ordering::Greater);
        assert_eq!(compare_versions("6.5.0-1", "6.5.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_pick_asset_by_platform() {
        let release = Release {
            tag_name: "2.4.0".to_string(),
            assets: vec![
                ReleaseAsset {
                    name: "streamlink-portable-2.4.0-py3.9.7-win32.zip".to_string(),
                    size: 10,
                    browser_download_url: "https://example.com/win32.zip".to_string(),
                },
                ReleaseAsset {
                    name: "streamlink-portable-2.4.0-py3.9.7-linux.zip".to_string(),
                    size: 10,
                    browser_download_url: "https://example.com/linux.zip".to_string(),
                },
            ],
        };
        let provisioner = GithubReleaseProvisioner::new(client(), "bin")
            .unwrap()
            .with_platform("win32");
        assert_eq!(
            provisioner.pick_asset(&release).unwrap().browser_download_url,
            "https://example.com/win32.zip"
        );
        let provisioner = provisioner.with_platform("plan9");
        assert!(provisioner.pick_asset(&release).is_none());
    }

    #[tokio::test]
    async fn test_missing_marker_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = GithubReleaseProvisioner::new(client(), dir.path()).unwrap();
        assert!(provisioner.check_needs_update().await.unwrap());
    }

    #[tokio::test]
    async fn test_leftover_lock_needs_update() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = GithubReleaseProvisioner::new(client(), dir.path()).unwrap();
        tokio::fs::write(dir.path().join(VERSION_FILE), "2.4.0")
            .await
            .unwrap();
        tokio::fs::write(provisioner.lock_path(), b"").await.unwrap();

        assert_eq!(provisioner.installed_version().await.as_deref(), Some("2.4.0"));
        assert!(provisioner.check_needs_update().await.unwrap());
    }

    #[test]
    fn test_extract_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("tool.zip");
        {
            let file = std::fs::File::create(&archive).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            zip.add_directory("streamlink/", options).unwrap();
            zip.start_file("streamlink/streamlink.bat", options).unwrap();
            zip.write_all(b"@echo off\r\n").unwrap();
            zip.start_file("streamlink/python/readme.txt", options).unwrap();
            zip.write_all(b"hello").unwrap();
            zip.finish().unwrap();
        }

        let dest = dir.path().join("bin");
        let mut seen = Vec::new();
        let written = extract_archive(&archive, &dest, |name| seen.push(name.to_string())).unwrap();

        assert_eq!(written, 2);
        assert_eq!(
            seen,
            vec!["streamlink/streamlink.bat", "streamlink/python/readme.txt"]
        );
        assert_eq!(
            std::fs::read_to_string(dest.join("streamlink/python/readme.txt")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.zip");
        std::fs::write(&archive, b"not a zip").unwrap();
        assert!(extract_archive(&archive, dir.path(), |_| {}).is_err());
    }
}
