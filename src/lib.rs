//! nodetrust - cluster trust bootstrap
//!
//! Produces the one-shot trust bundle a new Kubernetes cluster needs and
//! obtains signed identities for nodes joining it.
//!
//! # Architecture
//!
//! - At cluster creation, [`bootstrap::Input`] generates three independent
//!   root CAs (etcd, Kubernetes, OS), an admin identity signed by the OS CA,
//!   and the kubeadm/trustd secrets. The bundle is rendered into node
//!   configuration and discarded.
//! - A joining node generates its own key and CSR and asks the trust service
//!   (trustd) to sign it through [`trustd::RemoteIdentityIssuer`], failing
//!   over across endpoints and polling until an operator approves.
//! - Control plane nodes write CIS artifacts (audit policy, encryption
//!   config) through [`cis::ComplianceArtifacts`].
//!
//! # Modules
//!
//! - [`secrets`] - Token and secret generation over a secure RNG
//! - [`pki`] - Root CAs, leaf identities and chain verification
//! - [`bootstrap`] - The cluster bootstrap bundle
//! - [`proto`] - gRPC definitions for the trust service
//! - [`trustd`] - Remote identity issuance
//! - [`cis`] - Compliance artifacts for control plane nodes
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cis;
pub mod error;
pub mod pki;
pub mod proto;
pub mod secrets;
pub mod trustd;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default port of the trust service (trustd)
pub const DEFAULT_TRUSTD_PORT: u16 = 50001;

/// Default Kubernetes API server port
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;
