#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use availai::credential::Credential;
use availai::hosting::{DatasetHost, HostedVersion};
use availai::metadata::Metadata;
use availai::registry::{
    Artifact, ArtifactHandle, ArtifactRef, ArtifactRegistry, Auth, JobType, RegistrySession,
    RunStatus, Table,
};
use availai::AvailaiError;

/// Writes a small YOLO-style dataset under `root`.
pub fn write_sample_dataset(root: &Path) {
    fs::create_dir_all(root.join("images/train")).expect("create images dir");
    fs::create_dir_all(root.join("labels/train")).expect("create labels dir");
    fs::write(root.join("data.yaml"), "names:\n  - ball\n  - player\n").expect("write data.yaml");
    fs::write(root.join("images/train/frame_001.jpg"), [0xFFu8, 0xD8, 0xFF, 0xE0])
        .expect("write image");
    fs::write(
        root.join("labels/train/frame_001.txt"),
        "1 0.5 0.5 0.1 0.2\n0 0.2 0.3 0.05 0.05\n",
    )
    .expect("write label");
}

/// What a [`FakeRegistry`] saw.
#[derive(Default)]
pub struct FakeState {
    pub sessions: Vec<(String, JobType)>,
    pub closed: Vec<RunStatus>,
    pub uploads: Vec<Artifact>,
    pub tables: Vec<(String, Table)>,
    pub used: Vec<String>,
}

/// In-memory registry that records calls and can be told to fail.
#[derive(Default)]
pub struct FakeRegistry {
    pub state: Rc<RefCell<FakeState>>,
    pub fail_with: Option<String>,
    pub ambient: Option<String>,
}

impl FakeRegistry {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }
}

impl ArtifactRegistry for FakeRegistry {
    fn backend_name(&self) -> &str {
        "fake-registry"
    }

    fn ambient_credential(&self) -> Option<Credential> {
        self.ambient.clone().and_then(|key| Credential::new(key).ok())
    }

    fn authenticate(&self, credential: Credential) -> Result<Auth, AvailaiError> {
        Ok(Auth::new("fake-registry", credential))
    }

    fn begin_session(
        &self,
        _auth: &Auth,
        project: &str,
        job: JobType,
    ) -> Result<Box<dyn RegistrySession>, AvailaiError> {
        self.state
            .borrow_mut()
            .sessions
            .push((project.to_string(), job));
        Ok(Box::new(FakeSession {
            state: Rc::clone(&self.state),
            fail_with: self.fail_with.clone(),
        }))
    }
}

struct FakeSession {
    state: Rc<RefCell<FakeState>>,
    fail_with: Option<String>,
}

impl FakeSession {
    fn check(&self) -> Result<(), AvailaiError> {
        match &self.fail_with {
            Some(message) => Err(AvailaiError::backend("fake-registry", message.clone())),
            None => Ok(()),
        }
    }
}

impl RegistrySession for FakeSession {
    fn id(&self) -> &str {
        "fake-run"
    }

    fn log_artifact(&mut self, artifact: &Artifact) -> Result<ArtifactRef, AvailaiError> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        let version = format!("v{}", state.uploads.len());
        state.uploads.push(artifact.clone());
        Ok(ArtifactRef {
            name: artifact.name().to_string(),
            version,
            kind: artifact.kind().to_string(),
        })
    }

    fn use_artifact(
        &mut self,
        identifier: &str,
        kind: &str,
    ) -> Result<Box<dyn ArtifactHandle>, AvailaiError> {
        self.check()?;
        self.state.borrow_mut().used.push(identifier.to_string());
        let (name, version) = availai::registry::parse_artifact_identifier(identifier);
        Ok(Box::new(FakeArtifact {
            reference: ArtifactRef {
                name: name.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
            },
            metadata: Metadata::new(),
        }))
    }

    fn list_artifacts(&mut self, name: &str, kind: &str) -> Result<Vec<ArtifactRef>, AvailaiError> {
        self.check()?;
        Ok(self
            .state
            .borrow()
            .uploads
            .iter()
            .enumerate()
            .filter(|(_, artifact)| artifact.name() == name && artifact.kind() == kind)
            .map(|(index, artifact)| ArtifactRef {
                name: artifact.name().to_string(),
                version: format!("v{index}"),
                kind: artifact.kind().to_string(),
            })
            .collect())
    }

    fn log_table(&mut self, label: &str, table: &Table) -> Result<(), AvailaiError> {
        self.check()?;
        self.state
            .borrow_mut()
            .tables
            .push((label.to_string(), table.clone()));
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) -> Result<(), AvailaiError> {
        self.state.borrow_mut().closed.push(status);
        Ok(())
    }
}

struct FakeArtifact {
    reference: ArtifactRef,
    metadata: Metadata,
}

impl ArtifactHandle for FakeArtifact {
    fn reference(&self) -> &ArtifactRef {
        &self.reference
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn download(&self, destination: &Path) -> Result<PathBuf, AvailaiError> {
        fs::create_dir_all(destination)?;
        fs::write(destination.join("payload.txt"), self.reference.id())?;
        Ok(destination.to_path_buf())
    }
}

/// Hosting backend that records requests and writes a marker file.
#[derive(Default)]
pub struct FakeHost {
    pub requests: RefCell<Vec<(String, HostedVersion)>>,
    pub fail_with: Option<String>,
}

impl DatasetHost for FakeHost {
    fn backend_name(&self) -> &str {
        "fake-host"
    }

    fn download(
        &self,
        credential: &Credential,
        version: &HostedVersion,
        location: &Path,
    ) -> Result<PathBuf, AvailaiError> {
        self.requests
            .borrow_mut()
            .push((credential.expose().to_string(), version.clone()));
        if let Some(message) = &self.fail_with {
            return Err(AvailaiError::backend("fake-host", message.clone()));
        }
        fs::write(location.join("data.yaml"), "names: []\n")?;
        Ok(location.to_path_buf())
    }
}

/// Shared buffer that `tracing` output is written into.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().expect("log buffer lock").clone();
        String::from_utf8(bytes).expect("utf8 logs")
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("log buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs `f` with all log events captured, returning its result and the
/// formatted log lines.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}
