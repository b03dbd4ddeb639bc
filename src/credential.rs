//! Credential resolution.
//!
//! A credential is supplied either as the secret itself or as a path to a
//! file holding it. The file form is what most CI setups use, since it keeps
//! the key out of the process argument list.

use std::fmt;
use std::path::Path;

use crate::error::AvailaiError;

/// A resolved secret. Formatting never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a secret that is already known to be non-empty.
    pub fn new(secret: impl Into<String>) -> Result<Self, AvailaiError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(AvailaiError::Credential(
                "credential is empty".to_string(),
            ));
        }
        Ok(Self(secret))
    }

    /// The raw secret, for handing to a backend client.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Resolve a secret that may be given literally or as a file reference.
///
/// If `secret_or_path` names an existing regular file, its trimmed contents
/// are the credential. Otherwise the value is used verbatim.
///
/// # Errors
/// Returns [`AvailaiError::Credential`] when the file cannot be read or the
/// resolved secret is empty.
pub fn resolve_credential(secret_or_path: &str) -> Result<Credential, AvailaiError> {
    let candidate = Path::new(secret_or_path);
    if !secret_or_path.is_empty() && candidate.is_file() {
        let contents = std::fs::read_to_string(candidate).map_err(|source| {
            AvailaiError::Credential(format!(
                "failed to read credential file '{}': {}",
                candidate.display(),
                source
            ))
        })?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Err(AvailaiError::Credential(format!(
                "credential file '{}' is empty",
                candidate.display()
            )));
        }
        tracing::debug!(file = %candidate.display(), "read credential from file");
        return Ok(Credential(trimmed.to_string()));
    }

    Credential::new(secret_or_path)
}
