//! Error types for nodetrust

use thiserror::Error;

use crate::bootstrap::{InputError, TopologyError};
use crate::cis::ArtifactError;
use crate::pki::PkiError;
use crate::secrets::SecretError;
use crate::trustd::{IssuanceError, IssuanceErrorKind};

/// Main error type for nodetrust operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Secure random source failure
    #[error("secret generation error: {0}")]
    Secret(#[from] SecretError),

    /// CA, key or certificate failure
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Bootstrap bundle construction failure
    #[error("bootstrap input error: {0}")]
    Input(#[from] InputError),

    /// Cluster topology lacks what an accessor needs
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Remote identity issuance failure
    #[error("issuance error: {0}")]
    Issuance(#[from] IssuanceError),

    /// Compliance artifact failure
    #[error("compliance artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether retrying the whole operation may succeed
    ///
    /// Only issuance bounds qualify: the trust service may come back or
    /// approve later. Entropy, credential and topology failures are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Issuance(e) => matches!(
                e.kind(),
                IssuanceErrorKind::EndpointsExhausted
                    | IssuanceErrorKind::DeadlineExceeded
                    | IssuanceErrorKind::Transport
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trustd::{EndpointErrors, RemoteEndpoint, TransportError};
    use std::time::Duration;

    // ==========================================================================
    // Story Tests: Error Propagation Through a Node Bootstrap
    // ==========================================================================
    //
    // Each module reports failures in its own error type; callers that drive
    // a whole bootstrap work with `nodetrust::Error` and decide from it
    // whether to retry or stop.

    /// Story: a broken RNG stops the bootstrap for good
    #[test]
    fn story_entropy_failure_is_permanent() {
        let err: Error = SecretError::Entropy("getrandom failed".to_string()).into();

        assert!(err.to_string().contains("secret generation error"));
        assert!(err.to_string().contains("getrandom failed"));
        assert!(!err.is_retryable());
    }

    /// Story: a corrupt CA on disk is reported, not retried
    #[test]
    fn story_malformed_credential_is_permanent() {
        let err: Error = PkiError::MalformedCredential("bad PEM block".to_string()).into();

        assert!(err.to_string().contains("pki error"));
        assert!(matches!(err, Error::Pki(PkiError::MalformedCredential(_))));
        assert!(!err.is_retryable());
    }

    /// Story: rendering against an empty topology is a caller error
    #[test]
    fn story_topology_error_surfaces_operation() {
        let err: Error = TopologyError::NoMasterIps {
            operation: "api server endpoint",
        }
        .into();

        assert!(err.to_string().contains("api server endpoint"));
        assert!(!err.is_retryable());
    }

    /// Story: trust service outages and slow approvals may be retried
    #[test]
    fn story_issuance_bounds_are_retryable() {
        let mut failures = EndpointErrors::default();
        failures.push(
            RemoteEndpoint::new("10.0.0.1", 50001),
            TransportError::Connect("refused".to_string()),
        );

        let exhausted: Error = IssuanceError::EndpointsExhausted(failures).into();
        assert!(exhausted.is_retryable());
        assert!(exhausted.to_string().contains("10.0.0.1:50001"));

        let timeout: Error = IssuanceError::DeadlineExceeded {
            elapsed: Duration::from_secs(300),
        }
        .into();
        assert!(timeout.is_retryable());

        // The operator asked to stop; never retry on their behalf
        let canceled: Error = IssuanceError::Canceled.into();
        assert!(!canceled.is_retryable());

        let no_endpoints: Error = IssuanceError::NoEndpoints.into();
        assert!(!no_endpoints.is_retryable());
    }

    #[test]
    fn config_error_construction() {
        let err = Error::config(format!("cannot read {}", "/etc/nodetrust.yaml"));
        assert_eq!(
            err.to_string(),
            "configuration error: cannot read /etc/nodetrust.yaml"
        );
    }
}
