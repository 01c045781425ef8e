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

//! Check for, and optionally install, newer releases of this program at startup.

mod github;

pub use crate::update::github::GithubUpdater;

use semver::Version;
use std::error::Error;
use std::fmt::{self, Formatter};

/// Kinds of errors that can be encountered while looking for or applying an update
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum UpdateErrorKind {
    Client,
    Network,
    NotFound,
    Version,
    Asset,
    Checksum,
    Install,
}

impl UpdateErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            UpdateErrorKind::Client => "client",
            UpdateErrorKind::Network => "network",
            UpdateErrorKind::NotFound => "not_found",
            UpdateErrorKind::Version => "version",
            UpdateErrorKind::Asset => "asset",
            UpdateErrorKind::Checksum => "checksum",
            UpdateErrorKind::Install => "install",
        }
    }
}

/// Error finding, downloading, or installing a release
#[derive(Debug)]
pub enum UpdateError {
    KindMsg(UpdateErrorKind, &'static str),
    KindMsgCause(UpdateErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl UpdateError {
    pub fn kind(&self) -> UpdateErrorKind {
        match self {
            UpdateError::KindMsg(kind, _) => *kind,
            UpdateError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UpdateError::KindMsg(_, msg) => msg.fmt(f),
            UpdateError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for UpdateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            UpdateError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// A published release of this program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub notes: String,
}

/// Source of releases that can also replace the running executable.
#[allow(async_fn_in_trait)]
pub trait Updater {
    /// Find the latest release in `repository`, `None` if it has no releases.
    async fn detect_latest(&self, repository: &str) -> Result<Option<Release>, UpdateError>;

    /// Replace the running executable with the latest release in `repository` if it
    /// is newer than `current`. The latest release is returned either way.
    async fn update_self(&self, current: &Version, repository: &str) -> Result<Release, UpdateError>;
}

/// What to do when checking for an update at startup
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum UpdateMode {
    /// Only log whether a newer release exists
    CheckOnly,
    /// Install a newer release if one exists
    Apply,
}

/// Result of a startup update check
#[derive(PartialEq, Eq, Debug, Clone)]
pub enum UpdateOutcome {
    /// Nothing newer than the running version was found
    UpToDate,
    /// A newer release exists but was not installed
    Available(Version),
    /// The repository has no releases
    NotFound,
    /// A newer release was installed over the running executable
    Updated(Release),
    /// The check or the installation failed
    Failed,
}

impl UpdateOutcome {
    /// True when the running executable was replaced and the process should exit
    /// so a supervisor can start the new version.
    pub fn requires_restart(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Check `repository` for a release newer than `current` and, depending on `mode`,
/// install it. Errors are logged and reported as `UpdateOutcome::Failed`, never
/// returned: a failed update check must not prevent startup.
pub async fn check_for_update<U>(updater: &U, mode: UpdateMode, current: &Version, repository: &str) -> UpdateOutcome
where
    U: Updater,
{
    match mode {
        UpdateMode::CheckOnly => match updater.detect_latest(repository).await {
            Ok(Some(release)) => {
                tracing::info!(
                    message = "found latest version",
                    latest = %release.version,
                    current = %current,
                    repository = repository
                );

                if release.version > *current {
                    UpdateOutcome::Available(release.version)
                } else {
                    UpdateOutcome::UpToDate
                }
            }
            Ok(None) => {
                tracing::warn!(message = "couldn't find latest version", repository = repository);
                UpdateOutcome::NotFound
            }
            Err(e) => {
                tracing::error!(message = "error finding latest version", repository = repository, error = %e);
                UpdateOutcome::Failed
            }
        },
        UpdateMode::Apply => match updater.update_self(current, repository).await {
            Ok(release) if release.version > *current => {
                tracing::info!(
                    message = "successfully updated",
                    version = %release.version,
                    previous = %current,
                    release_notes = %release.notes
                );
                UpdateOutcome::Updated(release)
            }
            Ok(release) => {
                tracing::info!(
                    message = "current binary is the latest version",
                    latest = %release.version,
                    current = %current
                );
                UpdateOutcome::UpToDate
            }
            Err(e) if e.kind() == UpdateErrorKind::NotFound => {
                tracing::warn!(message = "couldn't find latest version", repository = repository, error = %e);
                UpdateOutcome::NotFound
            }
            Err(e) => {
                tracing::error!(message = "binary update failed", repository = repository, error = %e);
                UpdateOutcome::Failed
            }
        },
    }
}
