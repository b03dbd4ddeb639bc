//! Roboflow dataset exports over the public REST API.
//!
//! Asking `GET /{workspace}/{project}/{version}/{format}` for an export
//! returns a JSON document whose `export.link` points at a zip archive. The
//! archive is streamed next to the destination and unpacked there.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use super::{DatasetHost, HostedVersion, DEFAULT_ROBOFLOW_API_URL, DEFAULT_ROBOFLOW_TIMEOUT};
use crate::credential::Credential;
use crate::error::AvailaiError;

const BACKEND_NAME: &str = "roboflow";
const ARCHIVE_FILE: &str = "roboflow.zip";

/// Blocking Roboflow API client.
#[derive(Clone, Debug)]
pub struct RoboflowClient {
    api_url: String,
    agent: ureq::Agent,
}

impl RoboflowClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_ROBOFLOW_API_URL)
    }

    pub fn with_base_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            agent: build_agent(DEFAULT_ROBOFLOW_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn export_url(
        &self,
        credential: &Credential,
        version: &HostedVersion,
    ) -> Result<url::Url, AvailaiError> {
        let mut url = url::Url::parse(&self.api_url).map_err(|source| {
            AvailaiError::Validation(format!(
                "invalid Roboflow API URL '{}': {source}",
                self.api_url
            ))
        })?;
        let version_number = version.version.to_string();

        url.path_segments_mut()
            .map_err(|_| {
                AvailaiError::Validation(format!(
                    "Roboflow API URL '{}' cannot carry a path",
                    self.api_url
                ))
            })?
            .pop_if_empty()
            .extend([
                version.workspace.as_str(),
                version.project.as_str(),
                version_number.as_str(),
                version.format.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("api_key", credential.expose());

        Ok(url)
    }

    /// Asks for the export and returns the archive link.
    fn fetch_export_link(
        &self,
        credential: &Credential,
        version: &HostedVersion,
    ) -> Result<String, AvailaiError> {
        let url = self.export_url(credential, version)?;

        let mut response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|source| request_error(&source, credential, "export request"))?;
        let body: Value = response
            .body_mut()
            .read_json()
            .map_err(|source| request_error(&source, credential, "export response"))?;

        extract_export_link(&body).ok_or_else(|| {
            let detail = body
                .get("error")
                .and_then(|error| {
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .or_else(|| error.as_str())
                })
                .map(str::to_string)
                .unwrap_or_else(|| "response has no export link".to_string());
            AvailaiError::backend(
                BACKEND_NAME,
                format!("export of {version} is not available: {detail}"),
            )
        })
    }

    fn download_archive(
        &self,
        link: &str,
        credential: &Credential,
        archive_path: &Path,
    ) -> Result<u64, AvailaiError> {
        let mut response = self
            .agent
            .get(link)
            .call()
            .map_err(|source| request_error(&source, credential, "archive download"))?;

        let file = File::create(archive_path)?;
        let mut writer = BufWriter::new(file);
        let mut reader = response.body_mut().as_reader();
        let copied = std::io::copy(&mut reader, &mut writer).map_err(|source| {
            AvailaiError::backend(
                BACKEND_NAME,
                redact(&format!("archive download interrupted: {source}"), credential),
            )
        })?;
        writer.flush()?;
        Ok(copied)
    }
}

impl Default for RoboflowClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetHost for RoboflowClient {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn download(
        &self,
        credential: &Credential,
        version: &HostedVersion,
        location: &Path,
    ) -> Result<PathBuf, AvailaiError> {
        let link = self.fetch_export_link(credential, version)?;
        tracing::debug!(export = %version, "export link received");

        std::fs::create_dir_all(location)?;
        let archive_path = location.join(ARCHIVE_FILE);
        let result = self
            .download_archive(&link, credential, &archive_path)
            .and_then(|bytes| {
                tracing::debug!(bytes, archive = %archive_path.display(), "archive downloaded");
                extract_archive(&archive_path, location)
            });
        if archive_path.exists() {
            if let Err(err) = std::fs::remove_file(&archive_path) {
                tracing::warn!(
                    archive = %archive_path.display(),
                    error = %err,
                    "could not remove archive"
                );
            }
        }
        result?;

        Ok(location.to_path_buf())
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    config.into()
}

fn extract_export_link(body: &Value) -> Option<String> {
    body.get("export")
        .and_then(|export| export.get("link"))
        .and_then(Value::as_str)
        .filter(|link| !link.is_empty())
        .map(str::to_string)
}

fn extract_archive(archive_path: &Path, location: &Path) -> Result<(), AvailaiError> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|source| {
        AvailaiError::backend(BACKEND_NAME, format!("downloaded export is not a zip: {source}"))
    })?;
    archive.extract(location).map_err(|source| {
        AvailaiError::backend(
            BACKEND_NAME,
            format!("failed extracting export into '{}': {source}", location.display()),
        )
    })
}

fn request_error(source: &ureq::Error, credential: &Credential, stage: &str) -> AvailaiError {
    let message = match source {
        ureq::Error::StatusCode(code @ (401 | 403)) => {
            format!("{stage} rejected: authentication failed (HTTP {code})")
        }
        ureq::Error::StatusCode(code) => format!("{stage} failed with HTTP {code}"),
        other => format!("{stage} failed: {other}"),
    };
    AvailaiError::backend(BACKEND_NAME, redact(&message, credential))
}

fn redact(message: &str, credential: &Credential) -> String {
    message.replace(credential.expose(), "***")
}
