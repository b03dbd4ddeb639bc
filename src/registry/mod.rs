//! Artifact registry interface.
//!
//! This module owns the contract with the experiment-tracking / artifact
//! registry backend: authentication, run sessions, artifact logging and
//! retrieval, and table logging. Concrete storage lives in submodules.

pub mod offline;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::credential::Credential;
use crate::error::AvailaiError;
use crate::metadata::Metadata;

pub use offline::OfflineRegistry;

/// Type tag under which datasets are stored.
pub const DATASET_ARTIFACT_TYPE: &str = "dataset";

/// Alias resolving to the newest version of an artifact.
pub const LATEST_ALIAS: &str = "latest";

/// Kind of work a session performs, recorded with the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    UploadData,
    DownloadData,
    CreateTable,
    ListData,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::UploadData => "upload_data",
            JobType::DownloadData => "download_data",
            JobType::CreateTable => "create_table",
            JobType::ListData => "list_data",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

/// Reference to a logged artifact version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ArtifactRef {
    /// Backend identifier in `name:version` form.
    pub fn id(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// A file scheduled for upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactEntry {
    /// Path inside the artifact, always `/`-separated.
    pub name: String,
    /// Where the bytes come from on the local filesystem.
    pub source: PathBuf,
}

/// An artifact being assembled for upload.
#[derive(Clone, Debug)]
pub struct Artifact {
    name: String,
    kind: String,
    metadata: Metadata,
    entries: Vec<ArtifactEntry>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            metadata,
            entries: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn entries(&self) -> &[ArtifactEntry] {
        &self.entries
    }

    /// Adds every regular file below `dir`, keyed by its path relative to
    /// `dir`. Returns the number of files added.
    ///
    /// Entries are added in file-name order so manifests are stable.
    pub fn add_dir(&mut self, dir: &Path) -> Result<usize, AvailaiError> {
        self.add_dir_excluding(dir, &[])
    }

    /// Like [`Artifact::add_dir`], but prunes any of `excluded` that lie
    /// inside `dir`. Excluded paths that do not exist are ignored.
    pub fn add_dir_excluding(
        &mut self,
        dir: &Path,
        excluded: &[&Path],
    ) -> Result<usize, AvailaiError> {
        let before = self.entries.len();
        let pruned = pruned_subdirs(dir, excluded);

        let walker = WalkDir::new(dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let keep = match entry.path().strip_prefix(dir) {
                    Ok(relative) => !pruned.iter().any(|path| path == relative),
                    Err(_) => true,
                };
                if !keep {
                    tracing::debug!(
                        path = %entry.path().display(),
                        "skipping excluded directory"
                    );
                }
                keep
            });

        for entry in walker {
            let entry = entry.map_err(|source| {
                AvailaiError::Io(std::io::Error::other(format!(
                    "failed walking '{}': {}",
                    dir.display(),
                    source
                )))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(dir).map_err(|_| {
                AvailaiError::Io(std::io::Error::other(format!(
                    "'{}' is not inside '{}'",
                    entry.path().display(),
                    dir.display()
                )))
            })?;

            let name = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            self.entries.push(ArtifactEntry {
                name,
                source: entry.path().to_path_buf(),
            });
        }

        Ok(self.entries.len() - before)
    }
}

/// Paths of `excluded`, relative to `dir`, for those strictly inside it.
fn pruned_subdirs(dir: &Path, excluded: &[&Path]) -> Vec<PathBuf> {
    let Ok(base) = dir.canonicalize() else {
        return Vec::new();
    };
    excluded
        .iter()
        .filter_map(|path| path.canonicalize().ok())
        .filter_map(|path| path.strip_prefix(&base).ok().map(Path::to_path_buf))
        .filter(|relative| !relative.as_os_str().is_empty())
        .collect()
}

/// A small table of scalar values logged to a run.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Label under which [`Table::sample`] is logged.
pub const SAMPLE_TABLE_LABEL: &str = "Football player dataset";

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row. The row must have one value per column.
    pub fn add_row(&mut self, row: Vec<Value>) -> Result<(), AvailaiError> {
        if row.len() != self.columns.len() {
            return Err(AvailaiError::Validation(format!(
                "table row has {} value(s), expected {}",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// The fixed two-by-two demonstration table.
    pub fn sample() -> Self {
        Self {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![
                vec![Value::from("a1"), Value::from("b1")],
                vec![Value::from("a2"), Value::from("b2")],
            ],
        }
    }
}

/// Proof of a successful login, handed back to the registry that issued it.
#[derive(Clone, Debug)]
pub struct Auth {
    backend: String,
    credential: Credential,
}

impl Auth {
    pub fn new(backend: impl Into<String>, credential: Credential) -> Self {
        Self {
            backend: backend.into(),
            credential,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

/// An artifact version retrieved through [`RegistrySession::use_artifact`].
pub trait ArtifactHandle {
    fn reference(&self) -> &ArtifactRef;

    fn metadata(&self) -> &Metadata;

    /// Materializes the artifact's files under `destination` and returns the
    /// directory they were written to.
    fn download(&self, destination: &Path) -> Result<PathBuf, AvailaiError>;
}

/// One run against the registry.
pub trait RegistrySession {
    fn id(&self) -> &str;

    fn log_artifact(&mut self, artifact: &Artifact) -> Result<ArtifactRef, AvailaiError>;

    fn use_artifact(
        &mut self,
        identifier: &str,
        kind: &str,
    ) -> Result<Box<dyn ArtifactHandle>, AvailaiError>;

    /// All versions of `name` with type `kind`, oldest first.
    fn list_artifacts(&mut self, name: &str, kind: &str) -> Result<Vec<ArtifactRef>, AvailaiError>;

    fn log_table(&mut self, label: &str, table: &Table) -> Result<(), AvailaiError>;

    fn finish(&mut self, status: RunStatus) -> Result<(), AvailaiError>;
}

/// An experiment-tracking service that stores versioned artifacts.
pub trait ArtifactRegistry {
    /// Name used in logs and error messages.
    fn backend_name(&self) -> &str;

    /// Credential available from the environment or a previous login, if any.
    fn ambient_credential(&self) -> Option<Credential> {
        None
    }

    /// Local directory the registry writes into, if it has one. Uploads
    /// never pick up files from below it.
    fn storage_root(&self) -> Option<&Path> {
        None
    }

    fn authenticate(&self, credential: Credential) -> Result<Auth, AvailaiError>;

    fn begin_session(
        &self,
        auth: &Auth,
        project: &str,
        job: JobType,
    ) -> Result<Box<dyn RegistrySession>, AvailaiError>;
}

/// An authenticated registry, owned by the caller.
pub struct Connection<'r> {
    registry: &'r dyn ArtifactRegistry,
    auth: Auth,
}

impl<'r> Connection<'r> {
    pub fn new(registry: &'r dyn ArtifactRegistry, auth: Auth) -> Self {
        Self { registry, auth }
    }

    pub fn registry(&self) -> &'r dyn ArtifactRegistry {
        self.registry
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn backend_name(&self) -> &str {
        self.registry.backend_name()
    }

    /// Opens a session that is closed when the returned guard goes away.
    pub fn session(&self, project: &str, job: JobType) -> Result<Session, AvailaiError> {
        let inner = self.registry.begin_session(&self.auth, project, job)?;
        tracing::debug!(
            backend = self.registry.backend_name(),
            project,
            job = %job,
            session = inner.id(),
            "session opened"
        );
        Ok(Session {
            inner,
            closed: false,
        })
    }
}

/// Scoped registry session.
///
/// [`Session::finish`] closes it as finished. Dropping it without calling
/// `finish` closes it as failed.
pub struct Session {
    inner: Box<dyn RegistrySession>,
    closed: bool,
}

impl Session {
    pub fn finish(mut self) -> Result<(), AvailaiError> {
        self.closed = true;
        self.inner.finish(RunStatus::Finished)
    }
}

impl Deref for Session {
    type Target = dyn RegistrySession;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.inner.finish(RunStatus::Failed) {
            tracing::warn!(session = self.inner.id(), error = %err, "failed to close session");
        }
    }
}

/// Splits `name[:version]` into its parts. A missing version means `latest`.
pub fn parse_artifact_identifier(identifier: &str) -> (&str, &str) {
    match identifier.rsplit_once(':') {
        Some((name, version)) if !version.is_empty() => (name, version),
        Some((name, _)) => (name, LATEST_ALIAS),
        None => (identifier, LATEST_ALIAS),
    }
}
