//! Filesystem-backed artifact registry.
//!
//! Stores runs and versioned artifacts under a root directory, the way a
//! tracking service keeps an offline run directory for later sync:
//!
//! ```text
//! <root>/<project>/artifacts/<name>/v<N>/manifest.json
//! <root>/<project>/artifacts/<name>/v<N>/files/...
//! <root>/<project>/runs/<run-id>/run.json
//! <root>/<project>/runs/<run-id>/tables/<label>.csv
//! ```
//!
//! Each manifest records the size and CRC32C of every file, which downloads
//! verify.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    parse_artifact_identifier, Artifact, ArtifactHandle, ArtifactRef, ArtifactRegistry, Auth,
    JobType, RegistrySession, RunStatus, Table, LATEST_ALIAS,
};
use crate::credential::Credential;
use crate::error::AvailaiError;
use crate::metadata::Metadata;

/// Environment variable consulted for an ambient credential by default.
pub const DEFAULT_API_KEY_ENV: &str = "WANDB_API_KEY";

const BACKEND_NAME: &str = "offline-registry";
const MANIFEST_FILE: &str = "manifest.json";
const RUN_FILE: &str = "run.json";

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Registry rooted at a local directory.
#[derive(Clone, Debug)]
pub struct OfflineRegistry {
    root: PathBuf,
    api_key_env: Option<String>,
}

impl OfflineRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            api_key_env: Some(DEFAULT_API_KEY_ENV.to_string()),
        }
    }

    /// Sets the environment variable read for an ambient credential.
    /// `None` disables the ambient fallback.
    pub fn with_api_key_env(mut self, api_key_env: Option<String>) -> Self {
        self.api_key_env = api_key_env;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactRegistry for OfflineRegistry {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn ambient_credential(&self) -> Option<Credential> {
        let var = self.api_key_env.as_deref()?;
        let value = std::env::var(var).ok()?;
        Credential::new(value).ok()
    }

    fn storage_root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn authenticate(&self, credential: Credential) -> Result<Auth, AvailaiError> {
        Ok(Auth::new(BACKEND_NAME, credential))
    }

    fn begin_session(
        &self,
        auth: &Auth,
        project: &str,
        job: JobType,
    ) -> Result<Box<dyn RegistrySession>, AvailaiError> {
        if auth.backend() != BACKEND_NAME {
            return Err(AvailaiError::backend(
                BACKEND_NAME,
                format!("login was issued by '{}'", auth.backend()),
            ));
        }
        validate_component("project", project)?;

        let project_dir = self.root.join(project);
        let id = new_run_id();
        let run_dir = project_dir.join("runs").join(&id);
        fs::create_dir_all(&run_dir).map_err(|source| storage_error(&run_dir, source))?;

        let session = OfflineSession {
            project_dir,
            run_dir,
            record: RunRecord {
                id,
                project: project.to_string(),
                job_type: job,
                status: RunStatus::Running,
                started_at: unix_now(),
                finished_at: None,
                logged_artifacts: Vec::new(),
                used_artifacts: Vec::new(),
                tables: Vec::new(),
            },
        };
        session.save_record()?;

        Ok(Box::new(session))
    }
}

/// Per-run bookkeeping written to `run.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub project: String,
    pub job_type: JobType,
    pub status: RunStatus,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub logged_artifacts: Vec<String>,
    pub used_artifacts: Vec<String>,
    pub tables: Vec<String>,
}

/// Contents of an artifact version's `manifest.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub created_at: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub files: Vec<ManifestEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub crc32c: u32,
}

impl Manifest {
    fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            name: self.name.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Writes an artifact's files and manifest into `staging`.
fn stage_version(
    artifact: &Artifact,
    staging: &Path,
    version_label: &str,
) -> Result<Manifest, AvailaiError> {
    let files_dir = staging.join("files");
    fs::create_dir_all(&files_dir).map_err(|source| storage_error(&files_dir, source))?;

    let manifest = Manifest {
        name: artifact.name().to_string(),
        kind: artifact.kind().to_string(),
        version: version_label.to_string(),
        created_at: unix_now(),
        metadata: artifact.metadata().clone(),
        files: write_entries(artifact, &files_dir)?,
    };
    write_manifest(&staging.join(MANIFEST_FILE), &manifest)?;
    Ok(manifest)
}

struct OfflineSession {
    project_dir: PathBuf,
    run_dir: PathBuf,
    record: RunRecord,
}

impl OfflineSession {
    fn artifact_dir(&self, name: &str) -> PathBuf {
        self.project_dir.join("artifacts").join(name)
    }

    fn save_record(&self) -> Result<(), AvailaiError> {
        let path = self.run_dir.join(RUN_FILE);
        let file = File::create(&path).map_err(|source| storage_error(&path, source))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.record)
            .map_err(|source| AvailaiError::backend(BACKEND_NAME, source.to_string()))
    }
}

impl RegistrySession for OfflineSession {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn log_artifact(&mut self, artifact: &Artifact) -> Result<ArtifactRef, AvailaiError> {
        validate_component("artifact name", artifact.name())?;

        let artifact_dir = self.artifact_dir(artifact.name());
        fs::create_dir_all(&artifact_dir).map_err(|source| storage_error(&artifact_dir, source))?;

        let version = next_version(&artifact_dir)?;
        let version_label = format!("v{version}");

        // A version directory only appears by renaming a complete staging
        // directory. Staging is removed on any failure.
        let staging = artifact_dir.join(format!(".staging-{}", self.record.id));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|source| storage_error(&staging, source))?;
        }
        let version_dir = artifact_dir.join(&version_label);
        let stored = stage_version(artifact, &staging, &version_label).and_then(|manifest| {
            fs::rename(&staging, &version_dir)
                .map_err(|source| storage_error(&version_dir, source))?;
            Ok(manifest)
        });
        let manifest = match stored {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        let reference = manifest.reference();
        tracing::debug!(
            artifact = %reference,
            files = manifest.files.len(),
            "artifact version stored"
        );
        self.record.logged_artifacts.push(reference.id());
        self.save_record()?;

        Ok(reference)
    }

    fn use_artifact(
        &mut self,
        identifier: &str,
        kind: &str,
    ) -> Result<Box<dyn ArtifactHandle>, AvailaiError> {
        let (name, alias) = parse_artifact_identifier(identifier);
        validate_component("artifact name", name)?;

        let artifact_dir = self.artifact_dir(name);
        let versions = list_versions(&artifact_dir)?;
        let version = if alias == LATEST_ALIAS {
            versions.last().copied()
        } else {
            parse_version_label(alias).filter(|wanted| versions.contains(wanted))
        };
        let Some(version) = version else {
            return Err(AvailaiError::backend(
                BACKEND_NAME,
                format!("artifact '{name}:{alias}' not found"),
            ));
        };

        let version_dir = artifact_dir.join(format!("v{version}"));
        let manifest = read_manifest(&version_dir.join(MANIFEST_FILE))?;
        if manifest.kind != kind {
            return Err(AvailaiError::backend(
                BACKEND_NAME,
                format!(
                    "artifact '{}' has type '{}', expected '{}'",
                    manifest.reference(),
                    manifest.kind,
                    kind
                ),
            ));
        }

        let handle = OfflineArtifact {
            reference: manifest.reference(),
            files_dir: version_dir.join("files"),
            manifest,
        };
        self.record.used_artifacts.push(handle.reference.id());
        self.save_record()?;

        Ok(Box::new(handle))
    }

    fn list_artifacts(&mut self, name: &str, kind: &str) -> Result<Vec<ArtifactRef>, AvailaiError> {
        validate_component("artifact name", name)?;

        let artifact_dir = self.artifact_dir(name);
        let mut references = Vec::new();
        for version in list_versions(&artifact_dir)? {
            let manifest =
                read_manifest(&artifact_dir.join(format!("v{version}")).join(MANIFEST_FILE))?;
            if manifest.kind == kind {
                references.push(manifest.reference());
            }
        }
        Ok(references)
    }

    fn log_table(&mut self, label: &str, table: &Table) -> Result<(), AvailaiError> {
        let tables_dir = self.run_dir.join("tables");
        fs::create_dir_all(&tables_dir).map_err(|source| storage_error(&tables_dir, source))?;

        let path = tables_dir.join(format!("{}.csv", table_file_stem(label)));
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|source| AvailaiError::backend(BACKEND_NAME, source.to_string()))?;
        writer
            .write_record(&table.columns)
            .map_err(|source| AvailaiError::backend(BACKEND_NAME, source.to_string()))?;
        for row in &table.rows {
            writer
                .write_record(row.iter().map(cell_text))
                .map_err(|source| AvailaiError::backend(BACKEND_NAME, source.to_string()))?;
        }
        writer.flush().map_err(|source| storage_error(&path, source))?;

        self.record.tables.push(label.to_string());
        self.save_record()
    }

    fn finish(&mut self, status: RunStatus) -> Result<(), AvailaiError> {
        self.record.status = status;
        self.record.finished_at = Some(unix_now());
        self.save_record()
    }
}

struct OfflineArtifact {
    reference: ArtifactRef,
    files_dir: PathBuf,
    manifest: Manifest,
}

impl ArtifactHandle for OfflineArtifact {
    fn reference(&self) -> &ArtifactRef {
        &self.reference
    }

    fn metadata(&self) -> &Metadata {
        &self.manifest.metadata
    }

    fn download(&self, destination: &Path) -> Result<PathBuf, AvailaiError> {
        fs::create_dir_all(destination).map_err(|source| storage_error(destination, source))?;

        for entry in &self.manifest.files {
            let relative = safe_relative_path(&entry.path)?;
            let source_path = self.files_dir.join(&relative);
            let target = destination.join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| storage_error(parent, source))?;
            }
            fs::copy(&source_path, &target).map_err(|source| storage_error(&source_path, source))?;

            let (size, crc) = checksum_file(&target)?;
            if size != entry.size || crc != entry.crc32c {
                return Err(AvailaiError::backend(
                    BACKEND_NAME,
                    format!(
                        "checksum mismatch for '{}' in '{}' \
                         (expected {} bytes crc32c {:08x}, found {} bytes crc32c {:08x})",
                        entry.path, self.reference, entry.size, entry.crc32c, size, crc
                    ),
                ));
            }
        }

        Ok(destination.to_path_buf())
    }
}

fn write_entries(
    artifact: &Artifact,
    files_dir: &Path,
) -> Result<Vec<ManifestEntry>, AvailaiError> {
    let mut files = Vec::with_capacity(artifact.entries().len());
    for entry in artifact.entries() {
        let relative = safe_relative_path(&entry.name)?;
        let target = files_dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| storage_error(parent, source))?;
        }
        fs::copy(&entry.source, &target).map_err(|source| storage_error(&entry.source, source))?;

        let (size, crc32c) = checksum_file(&target)?;
        files.push(ManifestEntry {
            path: entry.name.clone(),
            size,
            crc32c,
        });
    }
    Ok(files)
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<(), AvailaiError> {
    let file = File::create(path).map_err(|source| storage_error(path, source))?;
    serde_json::to_writer_pretty(BufWriter::new(file), manifest)
        .map_err(|source| AvailaiError::backend(BACKEND_NAME, source.to_string()))
}

fn read_manifest(path: &Path) -> Result<Manifest, AvailaiError> {
    let file = File::open(path).map_err(|source| storage_error(path, source))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| AvailaiError::ManifestParse {
        path: path.to_path_buf(),
        source,
    })
}

fn checksum_file(path: &Path) -> Result<(u64, u32), AvailaiError> {
    let mut file = File::open(path).map_err(|source| storage_error(path, source))?;
    let mut buffer = vec![0u8; 64 * 1024];
    let mut crc = 0u32;
    let mut size = 0u64;
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|source| storage_error(path, source))?;
        if read == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buffer[..read]);
        size += read as u64;
    }
    Ok((size, crc))
}

/// Existing version numbers under an artifact directory, ascending.
fn list_versions(artifact_dir: &Path) -> Result<Vec<u64>, AvailaiError> {
    if !artifact_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut versions = Vec::new();
    for entry in fs::read_dir(artifact_dir).map_err(|source| storage_error(artifact_dir, source))? {
        let entry = entry.map_err(|source| storage_error(artifact_dir, source))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(version) = entry.file_name().to_str().and_then(parse_version_label) {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

fn next_version(artifact_dir: &Path) -> Result<u64, AvailaiError> {
    Ok(list_versions(artifact_dir)?
        .last()
        .map(|latest| latest + 1)
        .unwrap_or(0))
}

fn parse_version_label(label: &str) -> Option<u64> {
    let digits = label.strip_prefix('v')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Rejects names that would escape or collide in the directory layout.
fn validate_component(what: &str, value: &str) -> Result<(), AvailaiError> {
    let bad = value.trim().is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', ':']);
    if bad {
        return Err(AvailaiError::Validation(format!(
            "{what} '{value}' must be non-empty and must not contain '/', '\\' or ':'"
        )));
    }
    Ok(())
}

fn safe_relative_path(name: &str) -> Result<PathBuf, AvailaiError> {
    let path = PathBuf::from(name);
    let safe = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(AvailaiError::backend(
            BACKEND_NAME,
            format!("refusing unsafe artifact path '{name}'"),
        ));
    }
    Ok(path)
}

fn table_file_stem(label: &str) -> String {
    let stem: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "table".to_string()
    } else {
        stem
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}-{}", nanos, std::process::id(), counter)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn storage_error(path: &Path, source: std::io::Error) -> AvailaiError {
    AvailaiError::backend(BACKEND_NAME, format!("'{}': {}", path.display(), source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_labels_parse_strictly() {
        assert_eq!(parse_version_label("v0"), Some(0));
        assert_eq!(parse_version_label("v12"), Some(12));
        assert_eq!(parse_version_label("v"), None);
        assert_eq!(parse_version_label("12"), None);
        assert_eq!(parse_version_label("v1a"), None);
        assert_eq!(parse_version_label("v+1"), None);
    }

    #[test]
    fn component_validation_rejects_separators() {
        assert!(validate_component("project", "football").is_ok());
        assert!(validate_component("project", "").is_err());
        assert!(validate_component("project", "..").is_err());
        assert!(validate_component("project", "a/b").is_err());
        assert!(validate_component("artifact name", "cats:v1").is_err());
    }

    #[test]
    fn unsafe_manifest_paths_are_refused() {
        assert!(safe_relative_path("images/a.jpg").is_ok());
        assert!(safe_relative_path("../escape.txt").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("").is_err());
    }

    #[test]
    fn table_labels_become_file_stems() {
        assert_eq!(
            table_file_stem("Football player dataset"),
            "football_player_dataset"
        );
        assert_eq!(table_file_stem(""), "table");
    }

    #[test]
    fn next_version_counts_from_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(next_version(dir.path()).expect("version"), 0);

        fs::create_dir(dir.path().join("v0")).expect("mkdir");
        fs::create_dir(dir.path().join("v3")).expect("mkdir");
        fs::create_dir(dir.path().join(".staging-x")).expect("mkdir");
        assert_eq!(next_version(dir.path()).expect("version"), 4);
    }

    #[test]
    fn session_finish_updates_run_record() {
        let root = tempfile::tempdir().expect("tempdir");
        let registry = OfflineRegistry::new(root.path()).with_api_key_env(None);
        let auth = registry
            .authenticate(Credential::new("key").expect("credential"))
            .expect("auth");

        let mut session = registry
            .begin_session(&auth, "football", JobType::CreateTable)
            .expect("session");
        let run_file = root
            .path()
            .join("football/runs")
            .join(session.id())
            .join(RUN_FILE);
        session.finish(RunStatus::Finished).expect("finish");

        let record: RunRecord =
            serde_json::from_str(&fs::read_to_string(run_file).expect("read run")).expect("parse");
        assert_eq!(record.status, RunStatus::Finished);
        assert_eq!(record.job_type, JobType::CreateTable);
        assert!(record.finished_at.is_some());
    }
}
