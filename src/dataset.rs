//! Dataset handles.
//!
//! A [`DatasetHandle`] ties a local directory to a logical dataset name and a
//! remote project. It holds no connection: every operation takes the backend
//! it talks to as an argument, opens one session, and closes it before
//! returning.
//!
//! Backend failures are returned as [`AvailaiError::BackendCommunication`]
//! and are also logged once, with the dataset name, at `error` level.
//! Local problems (bad path, missing credential, invalid arguments) are
//! returned without logging.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::credential::{resolve_credential, Credential};
use crate::error::AvailaiError;
use crate::hosting::{DatasetHost, HostedVersion, DEFAULT_HOSTED_VERSION};
use crate::metadata::{with_preprocessing_steps, Metadata};
use crate::registry::{
    Artifact, ArtifactRef, ArtifactRegistry, Connection, JobType, Table, DATASET_ARTIFACT_TYPE,
    LATEST_ALIAS, SAMPLE_TABLE_LABEL,
};

/// How the handle's directory is going to be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// The directory is a source and must already exist.
    #[default]
    Upload,
    /// The directory is a destination and is created on first write.
    Download,
}

/// Optional construction parameters.
#[derive(Clone, Debug, Default)]
pub struct DatasetOptions {
    /// Logical dataset name. Defaults to the last segment of the path.
    pub name: Option<String>,
    /// Remote project. Defaults to the dataset name.
    pub project: Option<String>,
    pub mode: OpenMode,
}

/// Request for [`DatasetHandle::download_from_secondary_backend`].
#[derive(Clone, Copy, Debug)]
pub struct HostedDownload<'a> {
    /// Export format, e.g. `yolov8`.
    pub format: &'a str,
    /// API key, or a path to a file containing it.
    pub secret: &'a str,
    pub workspace: &'a str,
    /// Overrides the handle's project.
    pub project: Option<&'a str>,
    /// Defaults to [`DEFAULT_HOSTED_VERSION`].
    pub version: Option<u32>,
}

/// A local directory treated as a dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatasetHandle {
    path: PathBuf,
    name: String,
    project: String,
    mode: OpenMode,
}

impl DatasetHandle {
    /// Creates a handle for `path`.
    ///
    /// # Errors
    /// Returns [`AvailaiError::InvalidPath`] if `path` is not an existing
    /// directory in upload mode, exists but is not a directory in download
    /// mode, or yields no name when none is given.
    pub fn open(path: impl Into<PathBuf>, options: DatasetOptions) -> Result<Self, AvailaiError> {
        let path = path.into();

        match options.mode {
            OpenMode::Upload if !path.is_dir() => {
                return Err(AvailaiError::InvalidPath {
                    path,
                    reason: "does not exist or is not a directory".to_string(),
                });
            }
            OpenMode::Download if path.exists() && !path.is_dir() => {
                return Err(AvailaiError::InvalidPath {
                    path,
                    reason: "exists but is not a directory".to_string(),
                });
            }
            _ => {}
        }

        let name = match options.name.filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => default_name(&path).ok_or_else(|| AvailaiError::InvalidPath {
                path: path.clone(),
                reason: "cannot derive a dataset name from the path; pass one explicitly"
                    .to_string(),
            })?,
        };
        let project = options
            .project
            .filter(|project| !project.trim().is_empty())
            .unwrap_or_else(|| name.clone());

        Ok(Self {
            path,
            name,
            project,
            mode: options.mode,
        })
    }

    /// Handle over an existing directory, with default name and project.
    pub fn for_upload(path: impl Into<PathBuf>) -> Result<Self, AvailaiError> {
        Self::open(path, DatasetOptions::default())
    }

    /// Handle over a download destination, with default name and project.
    pub fn for_download(path: impl Into<PathBuf>) -> Result<Self, AvailaiError> {
        Self::open(
            path,
            DatasetOptions {
                mode: OpenMode::Download,
                ..DatasetOptions::default()
            },
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Logs into `registry`.
    ///
    /// `secret` is an API key or a path to a file containing one. Without a
    /// secret the registry's ambient credential is used.
    ///
    /// # Errors
    /// [`AvailaiError::Credential`] when no credential can be resolved, or
    /// the registry's error if it rejects the login.
    pub fn connect<'r>(
        &self,
        registry: &'r dyn ArtifactRegistry,
        secret: Option<&str>,
    ) -> Result<Connection<'r>, AvailaiError> {
        let credential = match secret {
            Some(secret) => resolve_credential(secret)?,
            None => registry.ambient_credential().ok_or_else(|| {
                AvailaiError::Credential(format!(
                    "no API key given for {} and no ambient login is configured",
                    registry.backend_name()
                ))
            })?,
        };
        let auth = registry.authenticate(credential)?;
        Ok(Connection::new(registry, auth))
    }

    /// Pushes the directory as a new version of the `dataset` artifact named
    /// after this handle.
    pub fn upload_artifact(
        &self,
        connection: &Connection<'_>,
        metadata: Option<Metadata>,
    ) -> Result<ArtifactRef, AvailaiError> {
        self.require_existing_dir()?;

        let mut artifact = Artifact::new(
            &self.name,
            DATASET_ARTIFACT_TYPE,
            metadata.unwrap_or_default(),
        );
        let excluded: Vec<&Path> = connection.registry().storage_root().into_iter().collect();
        artifact.add_dir_excluding(&self.path, &excluded)?;

        let reference = self
            .log_artifact(connection, &artifact)
            .map_err(|err| self.report("upload", connection.backend_name(), err))?;

        tracing::info!(
            dataset = %self.name,
            project = %self.project,
            artifact = %reference,
            files = artifact.entries().len(),
            "artifact uploaded"
        );
        Ok(reference)
    }

    /// Pulls an artifact version into the handle's directory.
    ///
    /// `artifact` may already carry a version (`name:v3`), in which case
    /// `version` is ignored. An empty `artifact` means this dataset's name.
    pub fn download_artifact(
        &self,
        connection: &Connection<'_>,
        artifact: &str,
        version: &str,
    ) -> Result<PathBuf, AvailaiError> {
        let identifier = self.artifact_identifier(artifact, version);
        self.ensure_dir()?;

        let directory = self
            .fetch_artifact(connection, &identifier)
            .map_err(|err| self.report("download", connection.backend_name(), err))?;

        tracing::info!(
            dataset = %self.name,
            artifact = %identifier,
            directory = %directory.display(),
            "artifact downloaded"
        );
        Ok(directory)
    }

    /// Fetches a dataset export from a hosting service into the handle's
    /// directory.
    ///
    /// # Errors
    /// [`AvailaiError::Validation`] when `workspace` or `format` is empty
    /// (checked first), [`AvailaiError::Credential`] when the secret does
    /// not resolve, otherwise the host's error.
    pub fn download_from_secondary_backend(
        &self,
        host: &dyn DatasetHost,
        request: &HostedDownload<'_>,
    ) -> Result<PathBuf, AvailaiError> {
        if request.workspace.trim().is_empty() {
            return Err(AvailaiError::Validation(format!(
                "workspace is required for {} downloads",
                host.backend_name()
            )));
        }
        if request.format.trim().is_empty() {
            return Err(AvailaiError::Validation(format!(
                "export format is required for {} downloads",
                host.backend_name()
            )));
        }
        let credential: Credential = resolve_credential(request.secret)?;

        let version = HostedVersion {
            workspace: request.workspace.to_string(),
            project: request
                .project
                .filter(|project| !project.trim().is_empty())
                .unwrap_or(self.project.as_str())
                .to_string(),
            version: request.version.unwrap_or(DEFAULT_HOSTED_VERSION),
            format: request.format.to_string(),
        };

        self.ensure_dir()?;
        let directory = host
            .download(&credential, &version, &self.path)
            .map_err(|err| {
                if err.is_backend() {
                    tracing::error!(
                        dataset = %self.name,
                        project = %version.project,
                        workspace = %version.workspace,
                        error = %err,
                        "download of dataset '{}' from {} failed",
                        self.name,
                        host.backend_name()
                    );
                }
                err
            })?;

        tracing::info!(
            dataset = %self.name,
            export = %version,
            directory = %directory.display(),
            "hosted dataset downloaded"
        );
        Ok(directory)
    }

    /// Uploads the dataset with `steps` recorded as preprocessing
    /// provenance.
    ///
    /// Nothing in the directory is transformed. `target` and `steps` only
    /// describe work done elsewhere; `steps` ends up under the
    /// `preprocessing_steps` metadata key, overwriting any previous value.
    pub fn preprocess(
        &self,
        connection: &Connection<'_>,
        target: &str,
        steps: Value,
        metadata: Option<Metadata>,
    ) -> Result<ArtifactRef, AvailaiError> {
        tracing::info!(preprocess_target = target, steps = %steps, "recording preprocessing steps");
        let metadata = with_preprocessing_steps(metadata.unwrap_or_default(), steps);
        self.upload_artifact(connection, Some(metadata))
    }

    /// Logs the fixed demonstration table to the project.
    pub fn log_sample_table(&self, connection: &Connection<'_>) -> Result<(), AvailaiError> {
        self.write_table(connection, SAMPLE_TABLE_LABEL, &Table::sample())
            .map_err(|err| self.report("table logging", connection.backend_name(), err))?;

        tracing::info!(project = %self.project, label = SAMPLE_TABLE_LABEL, "table logged");
        Ok(())
    }

    /// All stored versions of this dataset's artifact, oldest first.
    pub fn list_artifacts(
        &self,
        connection: &Connection<'_>,
    ) -> Result<Vec<ArtifactRef>, AvailaiError> {
        self.collect_artifacts(connection)
            .map_err(|err| self.report("listing", connection.backend_name(), err))
    }

    fn log_artifact(
        &self,
        connection: &Connection<'_>,
        artifact: &Artifact,
    ) -> Result<ArtifactRef, AvailaiError> {
        let mut session = connection.session(&self.project, JobType::UploadData)?;
        let reference = session.log_artifact(artifact)?;
        session.finish()?;
        Ok(reference)
    }

    fn fetch_artifact(
        &self,
        connection: &Connection<'_>,
        identifier: &str,
    ) -> Result<PathBuf, AvailaiError> {
        let mut session = connection.session(&self.project, JobType::DownloadData)?;
        let handle = session.use_artifact(identifier, DATASET_ARTIFACT_TYPE)?;
        let directory = handle.download(&self.path)?;
        session.finish()?;
        Ok(directory)
    }

    fn write_table(
        &self,
        connection: &Connection<'_>,
        label: &str,
        table: &Table,
    ) -> Result<(), AvailaiError> {
        let mut session = connection.session(&self.project, JobType::CreateTable)?;
        session.log_table(label, table)?;
        session.finish()
    }

    fn collect_artifacts(
        &self,
        connection: &Connection<'_>,
    ) -> Result<Vec<ArtifactRef>, AvailaiError> {
        let mut session = connection.session(&self.project, JobType::ListData)?;
        let references = session.list_artifacts(&self.name, DATASET_ARTIFACT_TYPE)?;
        session.finish()?;
        Ok(references)
    }

    fn artifact_identifier(&self, artifact: &str, version: &str) -> String {
        let artifact = if artifact.trim().is_empty() {
            self.name.as_str()
        } else {
            artifact
        };
        if artifact.contains(':') {
            return artifact.to_string();
        }
        let version = if version.trim().is_empty() {
            LATEST_ALIAS
        } else {
            version
        };
        format!("{artifact}:{version}")
    }

    /// Logs backend failures once; other errors pass through silently.
    fn report(&self, operation: &str, backend: &str, err: AvailaiError) -> AvailaiError {
        if err.is_backend() {
            tracing::error!(
                dataset = %self.name,
                project = %self.project,
                error = %err,
                "{operation} of dataset '{}' via {backend} failed",
                self.name
            );
        }
        err
    }

    fn require_existing_dir(&self) -> Result<(), AvailaiError> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(AvailaiError::InvalidPath {
                path: self.path.clone(),
                reason: "does not exist or is not a directory".to_string(),
            })
        }
    }

    fn ensure_dir(&self) -> Result<(), AvailaiError> {
        if self.path.exists() && !self.path.is_dir() {
            return Err(AvailaiError::InvalidPath {
                path: self.path.clone(),
                reason: "exists but is not a directory".to_string(),
            });
        }
        std::fs::create_dir_all(&self.path)?;
        Ok(())
    }
}

/// Lexically normalizes `path`: drops `.` components and folds `..` into
/// the preceding segment where there is one.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    normalized.pop();
                } else if !matches!(
                    normalized.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_))
                ) {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Last segment of the normalized path, falling back to the canonical path
/// for inputs like `.` that have no segment of their own.
fn default_name(path: &Path) -> Option<String> {
    let normalized = normalize_path(path);
    if let Some(Component::Normal(last)) = normalized.components().next_back() {
        return Some(last.to_string_lossy().into_owned());
    }

    let canonical = path.canonicalize().ok()?;
    canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
