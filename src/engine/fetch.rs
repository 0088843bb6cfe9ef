//! Engine binary fetching and installation.
//!
//! Resolves the path to the engine executable, downloading and installing a
//! release when none is present: fetch the release manifest, download the
//! `.tar.gz` for the selected version, verify its SHA-256, extract, and mark
//! the binary executable.

use std::io;
use std::path::PathBuf;

use flate2::read::GzDecoder;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;

const MANIFEST_URL: &str = "https://prod.proxy.ing/functions/v1/get-release-manifest";
const DEFAULT_CHANNEL: &str = "stable";
const ENGINE_BINARY: &str = "proxy_inference_engine";
const MANIFEST_TIMEOUT_SECS: u64 = 30;
const DOWNLOAD_TIMEOUT_SECS: u64 = 600;
const MAX_RETRIES: u32 = 3;

/// Fetcher errors.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid release manifest: {0}")]
    InvalidManifest(String),

    #[error("archive integrity check failed: expected sha256 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("archive extraction failed: {0}")]
    Extract(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, FetchError>;

/// Downloads, verifies, and installs engine binaries.
pub struct EngineFetcher {
    client: Client,
    install_home: PathBuf,
}

impl EngineFetcher {
    pub fn new() -> Self {
        let install_home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".orchard");
        Self::with_home(install_home)
    }

    pub fn with_home(install_home: PathBuf) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            install_home,
        }
    }

    /// Path to the engine binary, installing it first when necessary.
    ///
    /// `PIE_LOCAL_BUILD` points at a development build tree and bypasses
    /// the installed copy entirely.
    pub async fn engine_binary(&self) -> Result<PathBuf> {
        if let Ok(local_build) = std::env::var("PIE_LOCAL_BUILD") {
            let local_path = PathBuf::from(&local_build).join("bin").join(ENGINE_BINARY);
            if local_path.exists() {
                log::debug!("using local engine build: {:?}", local_path);
                return Ok(local_path);
            }
        }

        let binary_path = self.install_home.join("bin").join(ENGINE_BINARY);
        if binary_path.exists() {
            return Ok(binary_path);
        }

        std::fs::create_dir_all(&self.install_home)?;
        self.install(DEFAULT_CHANNEL, None).await?;

        if !binary_path.exists() {
            return Err(FetchError::Network(
                "download completed but binary not found".into(),
            ));
        }
        Ok(binary_path)
    }

    /// Download and install a release from `channel`, latest unless pinned.
    pub async fn install(&self, channel: &str, version: Option<&str>) -> Result<()> {
        let manifest = self.fetch_manifest(channel).await?;

        let version = match version {
            Some(v) => v.to_string(),
            None => manifest
                .get("latest")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    FetchError::InvalidManifest(format!(
                        "no latest version on the {} channel",
                        channel
                    ))
                })?
                .to_string(),
        };

        let versions = manifest
            .get("versions")
            .and_then(|v| v.as_object())
            .ok_or_else(|| FetchError::InvalidManifest("missing versions map".into()))?;

        let release = versions.get(&version).ok_or_else(|| {
            let available: Vec<_> = versions.keys().map(String::as_str).collect();
            FetchError::InvalidManifest(format!(
                "version {} not on the {} channel (available: {})",
                version,
                channel,
                available.join(", ")
            ))
        })?;

        let url = release.get("url").and_then(|v| v.as_str()).ok_or_else(|| {
            FetchError::InvalidManifest(format!("no download URL for version {}", version))
        })?;
        let expected_sha256 = release.get("sha256").and_then(|v| v.as_str());

        log::info!("downloading engine version {}", version);
        let archive = self.download_with_retry(url, expected_sha256).await?;
        self.extract_and_install(&archive, &version)?;
        log::info!("installed engine version {}", version);
        Ok(())
    }

    /// The installed version, from `version.txt`.
    pub fn installed_version(&self) -> Option<String> {
        std::fs::read_to_string(self.install_home.join("version.txt"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Latest version on `channel` when newer than the installed one.
    pub async fn check_for_update(&self, channel: &str) -> Option<String> {
        let installed = self.installed_version()?;
        let manifest = self.fetch_manifest(channel).await.ok()?;
        let latest = manifest.get("latest").and_then(|v| v.as_str())?;
        (latest != installed).then(|| latest.to_string())
    }

    async fn fetch_manifest(&self, channel: &str) -> Result<serde_json::Value> {
        let installed = self.installed_version().unwrap_or_else(|| "unknown".into());

        let response = self
            .client
            .get(MANIFEST_URL)
            .timeout(std::time::Duration::from_secs(MANIFEST_TIMEOUT_SECS))
            .query(&[
                ("channel", channel),
                ("v", &installed),
                ("os", std::env::consts::OS),
                ("arch", std::env::consts::ARCH),
            ])
            .send()
            .await
            .map_err(|e| FetchError::InvalidManifest(format!("manifest fetch failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(FetchError::InvalidManifest(format!(
                "manifest server returned {}",
                response.status()
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| FetchError::InvalidManifest(format!("invalid manifest body: {}", e)))
    }

    async fn download_with_retry(
        &self,
        url: &str,
        expected_sha256: Option<&str>,
    ) -> Result<Vec<u8>> {
        for attempt in 0..MAX_RETRIES {
            match self.download(url).await {
                Ok(content) => {
                    if let Some(expected) = expected_sha256 {
                        let actual = hex::encode(Sha256::digest(&content));
                        if actual != expected {
                            return Err(FetchError::Integrity {
                                expected: expected.to_string(),
                                actual,
                            });
                        }
                    }
                    return Ok(content);
                }
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    log::warn!("download attempt {} failed: {}; retrying", attempt + 1, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(FetchError::Network("download failed after retries".into()))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Network(format!("HTTP {}", response.status())));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn extract_and_install(&self, archive: &[u8], version: &str) -> Result<()> {
        std::fs::create_dir_all(&self.install_home)?;

        let bin_dir = self.install_home.join("bin");
        if bin_dir.exists() {
            std::fs::remove_dir_all(&bin_dir)?;
        }

        let decoder = GzDecoder::new(archive);
        let mut tarball = Archive::new(decoder);

        for entry in tarball.entries()? {
            let mut entry = entry?;
            let path = entry.path()?;

            let path_str = path.to_string_lossy();
            if path_str.starts_with('/') || path_str.contains("..") {
                return Err(FetchError::Extract(format!(
                    "unsafe path in archive: {}",
                    path_str
                )));
            }

            let dest = self.install_home.join(&*path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }

            if entry.header().entry_type().is_file() {
                let mut file = std::fs::File::create(&dest)?;
                io::copy(&mut entry, &mut file)?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = entry.header().mode().unwrap_or(0o755);
                    std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
                }
            }
        }

        let binary_path = bin_dir.join(ENGINE_BINARY);
        if !binary_path.exists() {
            return Err(FetchError::Extract(
                "archive did not contain the engine binary".into(),
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary_path, std::fs::Permissions::from_mode(0o755))?;
        }

        std::fs::write(self.install_home.join("version.txt"), version)?;
        Ok(())
    }
}

impl Default for EngineFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_gz_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extract_installs_the_binary() {
        let home = tempfile::tempdir().unwrap();
        let fetcher = EngineFetcher::with_home(home.path().to_path_buf());

        let archive = tar_gz_with(&[("bin/proxy_inference_engine", b"#!/bin/true\n")]);
        fetcher.extract_and_install(&archive, "1.2.3").unwrap();

        let binary = home.path().join("bin").join(ENGINE_BINARY);
        assert!(binary.exists());
        assert_eq!(fetcher.installed_version(), Some("1.2.3".to_string()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&binary).unwrap().permissions().mode();
            assert_eq!(mode & 0o755, 0o755);
        }
    }

    #[test]
    fn extract_rejects_escaping_paths() {
        let home = tempfile::tempdir().unwrap();
        let fetcher = EngineFetcher::with_home(home.path().to_path_buf());

        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let content: &[u8] = b"nope";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.as_old_mut().name[..b"bin/../../escape".len()].copy_from_slice(b"bin/../../escape");
        header.set_cksum();
        builder.append(&header, content).unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let result = fetcher.extract_and_install(&archive, "1.2.3");
        assert!(matches!(result, Err(FetchError::Extract(_))));
    }

    #[test]
    fn extract_requires_the_binary() {
        let home = tempfile::tempdir().unwrap();
        let fetcher = EngineFetcher::with_home(home.path().to_path_buf());

        let archive = tar_gz_with(&[("bin/something_else", b"hi")]);
        let result = fetcher.extract_and_install(&archive, "1.2.3");
        assert!(matches!(result, Err(FetchError::Extract(_))));
    }

    #[test]
    fn missing_version_file_reads_as_none() {
        let home = tempfile::tempdir().unwrap();
        let fetcher = EngineFetcher::with_home(home.path().to_path_buf());
        assert_eq!(fetcher.installed_version(), None);
    }
}
