// dht22-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::update::{Release, UpdateError, UpdateErrorKind, Updater};
use flate2::read::GzDecoder;
use reqwest::StatusCode;
use semver::Version;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, Permissions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io};
use tempfile::NamedTempFile;
use tokio::task;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const CHECKSUMS_ASSET: &str = "checksums.txt";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<AssetResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssetResponse {
    name: String,
    browser_download_url: String,
}

/// Parse a release tag such as `v1.2.3` or `1.2.3` as a version.
fn parse_version(tag: &str) -> Result<Version, UpdateError> {
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    Version::parse(trimmed)
        .map_err(|e| UpdateError::KindMsgCause(UpdateErrorKind::Version, "invalid release version", Box::new(e)))
}

/// Names release tooling commonly uses for an architecture, as reported by
/// `std::env::consts::ARCH`.
fn arch_aliases(arch: &str) -> Vec<&str> {
    match arch {
        "x86_64" => vec!["x86_64", "amd64"],
        "aarch64" => vec!["aarch64", "arm64"],
        "arm" => vec!["armv7", "armv6", "armhf"],
        "x86" => vec!["i386", "i686", "386"],
        other => vec![other],
    }
}

/// Pick the asset built for `os` and `arch`, ignoring the checksum manifest.
fn select_asset<'a>(assets: &'a [AssetResponse], os: &str, arch: &str) -> Option<&'a AssetResponse> {
    let aliases = arch_aliases(arch);

    assets.iter().find(|a| {
        let name = a.name.to_lowercase();
        name != CHECKSUMS_ASSET && name.contains(os) && aliases.iter().any(|alias| name.contains(alias))
    })
}

/// Verify `data` against the entry for `name` in a `sha256sum` style manifest,
/// one `<hex digest>  <file name>` per line.
fn verify_checksum(manifest: &str, name: &str, data: &[u8]) -> Result<(), UpdateError> {
    let expected = manifest
        .lines()
        .filter_map(|line| line.split_once(char::is_whitespace))
        .find(|(_, file)| file.trim().trim_start_matches('*') == name)
        .map(|(digest, _)| digest.trim().to_lowercase())
        .ok_or(UpdateError::KindMsg(
            UpdateErrorKind::Checksum,
            "release asset missing from checksum manifest",
        ))?;

    let computed = hex::encode(Sha256::digest(data));

    tracing::debug!(
        message = "computing checksum for release asset",
        asset = name,
        computed = %computed,
        expected = %expected
    );

    if computed != expected {
        Err(UpdateError::KindMsg(
            UpdateErrorKind::Checksum,
            "release asset checksum mismatch",
        ))
    } else {
        Ok(())
    }
}

/// Get the executable out of a downloaded asset: either the asset itself or, for
/// a `.tar.gz`, the archive entry named `binary_name`.
fn extract_executable(asset_name: &str, data: Vec<u8>, binary_name: &str) -> Result<Vec<u8>, UpdateError> {
    if !(asset_name.ends_with(".tar.gz") || asset_name.ends_with(".tgz")) {
        return Ok(data);
    }

    let archive_err = |e: io::Error| UpdateError::KindMsgCause(UpdateErrorKind::Asset, "unable to read release archive", Box::new(e));
    let mut archive = tar::Archive::new(GzDecoder::new(data.as_slice()));

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        let matches = entry
            .path()
            .map_err(archive_err)?
            .file_name()
            .map(|n| n == OsStr::new(binary_name))
            .unwrap_or(false);

        if matches {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).map_err(archive_err)?;
            return Ok(contents);
        }
    }

    Err(UpdateError::KindMsg(
        UpdateErrorKind::Asset,
        "release archive does not contain the executable",
    ))
}

/// Replace `executable` with `contents`. The new file is written next to the old
/// one and renamed over it so the executable is never partially written.
fn install(executable: &Path, contents: &[u8]) -> Result<(), UpdateError> {
    let install_err = |e: io::Error| UpdateError::KindMsgCause(UpdateErrorKind::Install, "unable to install new executable", Box::new(e));
    let dir = executable.parent().ok_or(UpdateError::KindMsg(
        UpdateErrorKind::Install,
        "executable has no parent directory",
    ))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(install_err)?;
    tmp.write_all(contents).map_err(install_err)?;
    tmp.as_file().sync_all().map_err(install_err)?;
    fs::set_permissions(tmp.path(), Permissions::from_mode(0o755)).map_err(install_err)?;
    tmp.persist(executable).map_err(|e| install_err(e.error))?;

    Ok(())
}

/// Look up releases of a GitHub repository and install them over the running
/// executable.
#[derive(Debug, Clone)]
pub struct GithubUpdater {
    client: reqwest::Client,
    api_base: String,
    executable: PathBuf,
    binary_name: String,
}

impl GithubUpdater {
    pub fn new() -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| UpdateError::KindMsgCause(UpdateErrorKind::Client, "unable to create HTTP client", Box::new(e)))?;

        let executable = env::current_exe().map_err(|e| {
            UpdateError::KindMsgCause(UpdateErrorKind::Install, "unable to locate current executable", Box::new(e))
        })?;

        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_owned(),
            executable,
            binary_name: env!("CARGO_PKG_NAME").to_owned(),
        })
    }

    /// Use a different GitHub API endpoint, e.g. for GitHub Enterprise.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_owned();
        self
    }

    /// Replace this file instead of the running executable.
    pub fn with_executable<P: Into<PathBuf>>(mut self, executable: P) -> Self {
        self.executable = executable.into();
        self
    }

    async fn latest(&self, repository: &str) -> Result<Option<(Release, Vec<AssetResponse>)>, UpdateError> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, repository);
        let network_err =
            |e: reqwest::Error| UpdateError::KindMsgCause(UpdateErrorKind::Network, "unable to fetch latest release", Box::new(e));

        tracing::debug!(message = "fetching latest release", url = %url);

        let res = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(network_err)?;

        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let release: ReleaseResponse = res.error_for_status().map_err(network_err)?.json().await.map_err(network_err)?;
        let version = parse_version(&release.tag_name)?;

        Ok(Some((
            Release {
                version,
                notes: release.body.unwrap_or_default(),
            },
            release.assets,
        )))
    }

    async fn download(&self, asset: &AssetResponse) -> Result<Vec<u8>, UpdateError> {
        let download_err =
            |e: reqwest::Error| UpdateError::KindMsgCause(UpdateErrorKind::Network, "unable to download release asset", Box::new(e));

        tracing::debug!(message = "downloading release asset", asset = %asset.name, url = %asset.browser_download_url);

        let bytes = self
            .client
            .get(&asset.browser_download_url)
            .header(reqwest::header::ACCEPT, "application/octet-stream")
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(download_err)?
            .bytes()
            .await
            .map_err(download_err)?;

        Ok(bytes.to_vec())
    }
}

impl Updater for GithubUpdater {
    async fn detect_latest(&self, repository: &str) -> Result<Option<Release>, UpdateError> {
        Ok(self.latest(repository).await?.map(|(release, _)| release))
    }

    async fn update_self(&self, current: &Version, repository: &str) -> Result<Release, UpdateError> {
        let (release, assets) = self
            .latest(repository)
            .await?
            .ok_or(UpdateError::KindMsg(UpdateErrorKind::NotFound, "no releases found"))?;

        if release.version <= *current {
            return Ok(release);
        }

        let asset = select_asset(&assets, env::consts::OS, env::consts::ARCH).ok_or(UpdateError::KindMsg(
            UpdateErrorKind::Asset,
            "no release asset for this platform",
        ))?;

        let manifest = assets.iter().find(|a| a.name == CHECKSUMS_ASSET).ok_or(UpdateError::KindMsg(
            UpdateErrorKind::Checksum,
            "release has no checksum manifest",
        ))?;

        let data = self.download(asset).await?;
        let manifest = self.download(manifest).await?;
        verify_checksum(&String::from_utf8_lossy(&manifest), &asset.name, &data)?;

        let asset_name = asset.name.clone();
        let binary_name = self.binary_name.clone();
        let executable = self.executable.clone();

        task::spawn_blocking(move || {
            let contents = extract_executable(&asset_name, data, &binary_name)?;
            install(&executable, &contents)
        })
        .await
        .map_err(|e| UpdateError::KindMsgCause(UpdateErrorKind::Install, "install task failed", Box::new(e)))??;

        tracing::info!(
            message = "installed release",
            version = %release.version,
            executable = %self.executable.display()
        );

        Ok(release)
    }
}

#[cfg(test)]
mod test {
    use super::{
        extract_executable, parse_version, select_asset, verify_checksum, AssetResponse, GithubUpdater, CHECKSUMS_ASSET,
    };
    use crate::update::{UpdateErrorKind, Updater};
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use semver::Version;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::env::consts::{ARCH, OS};
    use std::fs;
    use std::net::TcpListener;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn asset(name: &str) -> AssetResponse {
        AssetResponse {
            name: name.to_owned(),
            browser_download_url: format!("https://example.invalid/{}", name),
        }
    }

    fn tar_gz(entry_name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, entry_name, contents).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(Version::new(1, 2, 3), parse_version("v1.2.3").unwrap());
        assert_eq!(Version::new(1, 2, 3), parse_version("1.2.3").unwrap());
        assert_eq!(UpdateErrorKind::Version, parse_version("latest").unwrap_err().kind());
    }

    #[test]
    fn test_select_asset() {
        let assets = vec![
            asset(CHECKSUMS_ASSET),
            asset("dht22-exporter_windows_amd64.zip"),
            asset("dht22-exporter_linux_arm64.tar.gz"),
            asset("dht22-exporter_linux_armv7.tar.gz"),
            asset("dht22-exporter_linux_amd64.tar.gz"),
        ];

        assert_eq!(
            "dht22-exporter_linux_arm64.tar.gz",
            select_asset(&assets, "linux", "aarch64").unwrap().name
        );
        assert_eq!(
            "dht22-exporter_linux_armv7.tar.gz",
            select_asset(&assets, "linux", "arm").unwrap().name
        );
        assert_eq!(
            "dht22-exporter_linux_amd64.tar.gz",
            select_asset(&assets, "linux", "x86_64").unwrap().name
        );
        assert!(select_asset(&assets, "macos", "aarch64").is_none());
    }

    #[test]
    fn test_verify_checksum() {
        let data = b"new binary";
        let digest = hex::encode(Sha256::digest(data));
        let manifest = format!("{}  other.tar.gz\n{}  binary.tar.gz\n", "0".repeat(64), digest);

        assert!(verify_checksum(&manifest, "binary.tar.gz", data).is_ok());
        assert_eq!(
            UpdateErrorKind::Checksum,
            verify_checksum(&manifest, "other.tar.gz", data).unwrap_err().kind()
        );
        assert_eq!(
            UpdateErrorKind::Checksum,
            verify_checksum(&manifest, "missing.tar.gz", data).unwrap_err().kind()
        );
    }

    #[test]
    fn test_extract_raw_and_archive() {
        let raw = extract_executable("dht22-exporter_linux_arm64", b"raw".to_vec(), "dht22-exporter").unwrap();
        assert_eq!(b"raw".to_vec(), raw);

        let archive = tar_gz("dist/dht22-exporter", b"archived");
        let extracted = extract_executable("x_linux_arm64.tar.gz", archive, "dht22-exporter").unwrap();
        assert_eq!(b"archived".to_vec(), extracted);

        let archive = tar_gz("README.md", b"docs");
        let res = extract_executable("x_linux_arm64.tar.gz", archive, "dht22-exporter");
        assert_eq!(UpdateErrorKind::Asset, res.unwrap_err().kind());
    }

    /// Minimal stand in for the GitHub releases API and asset downloads.
    struct FakeGithub {
        tag: Option<String>,
        files: HashMap<String, Vec<u8>>,
        base: String,
    }

    async fn latest_release(State(gh): State<Arc<FakeGithub>>) -> Response {
        let tag = match &gh.tag {
            Some(tag) => tag,
            None => return StatusCode::NOT_FOUND.into_response(),
        };

        let assets: Vec<_> = gh
            .files
            .keys()
            .map(|name| {
                serde_json::json!({
                    "name": name,
                    "browser_download_url": format!("{}/download/{}", gh.base, name),
                })
            })
            .collect();

        Json(serde_json::json!({
            "tag_name": tag,
            "body": "Bug fixes",
            "assets": assets,
        }))
        .into_response()
    }

    async fn download(State(gh): State<Arc<FakeGithub>>, Path(name): Path<String>) -> Response {
        match gh.files.get(&name) {
            Some(bytes) => bytes.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    /// Serve a fake API with `files` as release assets and return its base URL.
    fn serve(tag: Option<&str>, files: Vec<(String, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let state = Arc::new(FakeGithub {
            tag: tag.map(str::to_owned),
            files: files.into_iter().collect(),
            base: base.clone(),
        });

        let app = Router::new()
            .route("/repos/owner/repo/releases/latest", get(latest_release))
            .route("/download/:name", get(download))
            .with_state(state);

        let server = axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service());
        tokio::spawn(server);
        base
    }

    fn platform_asset(suffix: &str) -> String {
        format!("dht22-exporter_{}_{}{}", OS, ARCH, suffix)
    }

    fn checksums(files: &[(String, Vec<u8>)]) -> (String, Vec<u8>) {
        let manifest: String = files
            .iter()
            .map(|(name, data)| format!("{}  {}\n", hex::encode(Sha256::digest(data)), name))
            .collect();

        (CHECKSUMS_ASSET.to_owned(), manifest.into_bytes())
    }

    #[tokio::test]
    async fn test_detect_latest() {
        let base = serve(Some("v9.9.9"), Vec::new());
        let updater = GithubUpdater::new().unwrap().with_api_base(&base);

        let release = updater.detect_latest("owner/repo").await.unwrap().unwrap();
        assert_eq!(Version::new(9, 9, 9), release.version);
        assert_eq!("Bug fixes", release.notes);
    }

    #[tokio::test]
    async fn test_detect_latest_no_releases() {
        let base = serve(None, Vec::new());
        let updater = GithubUpdater::new().unwrap().with_api_base(&base);

        assert!(updater.detect_latest("owner/repo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_self_installs_archive() {
        let files = vec![(platform_asset(".tar.gz"), tar_gz("dht22-exporter", b"#!/bin/sh\necho new\n"))];
        let sums = checksums(&files);
        let base = serve(Some("v9.9.9"), files.into_iter().chain([sums]).collect());

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("dht22-exporter");
        fs::write(&exe, b"old").unwrap();

        let updater = GithubUpdater::new()
            .unwrap()
            .with_api_base(&base)
            .with_executable(&exe);
        let release = updater.update_self(&Version::new(0, 1, 0), "owner/repo").await.unwrap();

        assert_eq!(Version::new(9, 9, 9), release.version);
        assert_eq!(b"#!/bin/sh\necho new\n".to_vec(), fs::read(&exe).unwrap());
        assert_eq!(0o755, fs::metadata(&exe).unwrap().permissions().mode() & 0o777);
    }

    #[tokio::test]
    async fn test_update_self_checksum_mismatch_keeps_executable() {
        let files = vec![(platform_asset(""), b"tampered".to_vec())];
        let sums = checksums(&[(platform_asset(""), b"original".to_vec())]);
        let base = serve(Some("v9.9.9"), files.into_iter().chain([sums]).collect());

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("dht22-exporter");
        fs::write(&exe, b"old").unwrap();

        let updater = GithubUpdater::new()
            .unwrap()
            .with_api_base(&base)
            .with_executable(&exe);
        let res = updater.update_self(&Version::new(0, 1, 0), "owner/repo").await;

        assert_eq!(UpdateErrorKind::Checksum, res.unwrap_err().kind());
        assert_eq!(b"old".to_vec(), fs::read(&exe).unwrap());
    }

    #[tokio::test]
    async fn test_update_self_without_manifest_keeps_executable() {
        let base = serve(Some("v9.9.9"), vec![(platform_asset(""), b"unverified".to_vec())]);

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("dht22-exporter");
        fs::write(&exe, b"old").unwrap();

        let updater = GithubUpdater::new()
            .unwrap()
            .with_api_base(&base)
            .with_executable(&exe);
        let res = updater.update_self(&Version::new(0, 1, 0), "owner/repo").await;

        assert_eq!(UpdateErrorKind::Checksum, res.unwrap_err().kind());
        assert_eq!(b"old".to_vec(), fs::read(&exe).unwrap());
    }

    #[tokio::test]
    async fn test_update_self_up_to_date_keeps_executable() {
        let base = serve(Some("v1.0.0"), vec![(platform_asset(""), b"new".to_vec())]);

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("dht22-exporter");
        fs::write(&exe, b"old").unwrap();

        let updater = GithubUpdater::new()
            .unwrap()
            .with_api_base(&base)
            .with_executable(&exe);
        let release = updater.update_self(&Version::new(1, 0, 0), "owner/repo").await.unwrap();

        assert_eq!(Version::new(1, 0, 0), release.version);
        assert_eq!(b"old".to_vec(), fs::read(&exe).unwrap());
    }

    #[tokio::test]
    async fn test_update_self_no_releases() {
        let base = serve(None, Vec::new());
        let updater = GithubUpdater::new().unwrap().with_api_base(&base);
        let res = updater.update_self(&Version::new(1, 0, 0), "owner/repo").await;

        assert_eq!(UpdateErrorKind::NotFound, res.unwrap_err().kind());
    }
}
