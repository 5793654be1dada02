//! CIS benchmark artifacts for control plane nodes
//!
//! Two documents are written before the API server starts:
//!
//! - an audit policy logging every request at `Metadata` level
//! - an encryption configuration encrypting `secrets` with AES-CBC under the
//!   bootstrap encryption secret, falling back to `identity` for reads of
//!   data written before encryption was enabled
//!
//! Both are written owner read-only (0400) and only if absent: the first
//! bootstrap wins and later runs leave the files alone.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::secrets::{Token, SECRET_BYTES};

/// Default audit policy location
pub const DEFAULT_AUDIT_POLICY_PATH: &str = "/etc/kubernetes/audit-policy.yaml";

/// Default encryption config location
pub const DEFAULT_ENCRYPTION_CONFIG_PATH: &str = "/etc/kubernetes/encryptionconfig.yaml";

/// Mode of every artifact
pub const ARTIFACT_MODE: u32 = 0o400;

const AUDIT_POLICY: &str = include_str!("../../templates/audit-policy.yaml");

const ENCRYPTION_CONFIG_TEMPLATE: &str = include_str!("../../templates/encryption-config.yaml");

/// Errors while producing compliance artifacts
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The encryption secret is not base64 of a 32 byte key
    #[error("invalid encryption secret: {0}")]
    InvalidSecret(String),

    /// Template rendering failed
    #[error("failed to render {name}: {source}")]
    Template {
        /// Template name
        name: &'static str,
        /// Rendering error
        #[source]
        source: minijinja::Error,
    },

    /// Writing an artifact failed
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        /// Target path
        path: PathBuf,
        /// I/O error
        #[source]
        source: io::Error,
    },
}

/// Output locations of the artifacts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArtifactPaths {
    /// Audit policy file
    pub audit_policy: PathBuf,
    /// Encryption configuration file
    pub encryption_config: PathBuf,
}

impl Default for ArtifactPaths {
    fn default() -> Self {
        Self {
            audit_policy: PathBuf::from(DEFAULT_AUDIT_POLICY_PATH),
            encryption_config: PathBuf::from(DEFAULT_ENCRYPTION_CONFIG_PATH),
        }
    }
}

/// What a write did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The file was created
    Written,
    /// The file existed and was left untouched
    AlreadyPresent,
}

/// Writer for the control plane compliance artifacts
#[derive(Clone, Debug, Default)]
pub struct ComplianceArtifacts {
    paths: ArtifactPaths,
}

impl ComplianceArtifacts {
    /// Writer targeting `paths`
    pub fn new(paths: ArtifactPaths) -> Self {
        Self { paths }
    }

    /// Target paths
    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// The static audit policy document
    pub fn audit_policy() -> &'static str {
        AUDIT_POLICY
    }

    /// Render the encryption configuration for `secret`
    pub fn encryption_config(secret: &Token) -> Result<Zeroizing<String>, ArtifactError> {
        validate_secret(secret)?;

        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.add_template("encryption-config", ENCRYPTION_CONFIG_TEMPLATE)
            .map_err(|source| ArtifactError::Template {
                name: "encryption-config",
                source,
            })?;

        env.get_template("encryption-config")
            .and_then(|t| t.render(context! { aescbc_encryption_secret => secret.as_str() }))
            .map(Zeroizing::new)
            .map_err(|source| ArtifactError::Template {
                name: "encryption-config",
                source,
            })
    }

    /// Write the audit policy if absent
    pub fn write_audit_policy(&self) -> Result<WriteOutcome, ArtifactError> {
        write_once(&self.paths.audit_policy, AUDIT_POLICY.as_bytes())
    }

    /// Write the encryption configuration if absent
    ///
    /// The secret is validated even when the file already exists.
    pub fn write_encryption_config(&self, secret: &Token) -> Result<WriteOutcome, ArtifactError> {
        let rendered = Self::encryption_config(secret)?;
        write_once(&self.paths.encryption_config, rendered.as_bytes())
    }

    /// Write every control plane artifact: audit policy, then encryption config
    pub fn enforce_master_requirements(&self, secret: &Token) -> Result<(), ArtifactError> {
        self.write_audit_policy()?;
        self.write_encryption_config(secret)?;
        Ok(())
    }
}

/// Write both artifacts to their default locations
pub fn enforce_master_requirements(secret: &Token) -> Result<(), ArtifactError> {
    ComplianceArtifacts::default().enforce_master_requirements(secret)
}

fn validate_secret(secret: &Token) -> Result<(), ArtifactError> {
    let key = Zeroizing::new(
        STANDARD
            .decode(secret.as_str())
            .map_err(|e| ArtifactError::InvalidSecret(e.to_string()))?,
    );
    if key.len() != SECRET_BYTES {
        return Err(ArtifactError::InvalidSecret(format!(
            "expected {} byte key, got {}",
            SECRET_BYTES,
            key.len()
        )));
    }
    Ok(())
}

/// Create `path` with mode 0400 unless it exists
fn write_once(path: &Path, contents: &[u8]) -> Result<WriteOutcome, ArtifactError> {
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(ARTIFACT_MODE)
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "Artifact already present, leaving it");
            return Ok(WriteOutcome::AlreadyPresent);
        }
        Err(e) => return Err(io_err(e)),
    };

    file.write_all(contents).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    info!(path = %path.display(), "Wrote compliance artifact");
    Ok(WriteOutcome::Written)
}
