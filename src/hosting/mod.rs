//! Dataset hosting backends.
//!
//! A hosting service serves prepared dataset exports (images plus labels in
//! a requested annotation format) addressed by workspace, project and
//! version. Unlike the artifact registry it is download-only.

#[cfg(feature = "roboflow")]
pub mod roboflow;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credential::Credential;
use crate::error::AvailaiError;

/// Version the hosting backend is asked for when the caller gives none.
pub const DEFAULT_HOSTED_VERSION: u32 = 1;

/// Base URL of the public Roboflow API.
pub const DEFAULT_ROBOFLOW_API_URL: &str = "https://api.roboflow.com";

/// Whole-request timeout for Roboflow calls.
pub const DEFAULT_ROBOFLOW_TIMEOUT: Duration = Duration::from_secs(60);

/// Address of one exported dataset version on a hosting service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedVersion {
    pub workspace: String,
    pub project: String,
    pub version: u32,
    /// Export format, e.g. `yolov8` or `coco`.
    pub format: String,
}

impl fmt::Display for HostedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({})",
            self.workspace, self.project, self.version, self.format
        )
    }
}

/// A service that hands out dataset exports.
pub trait DatasetHost {
    fn backend_name(&self) -> &str;

    /// Fetches `version` and writes it below `location`, returning the
    /// directory holding the dataset.
    fn download(
        &self,
        credential: &Credential,
        version: &HostedVersion,
        location: &Path,
    ) -> Result<PathBuf, AvailaiError>;
}
