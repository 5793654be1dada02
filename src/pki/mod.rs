//! PKI primitives for the cluster trust fabric
//!
//! This module wraps rcgen for everything the bootstrap needs:
//! - Self-signed root CAs ([`CertificateAuthority`])
//! - The three cluster roots (etcd, Kubernetes, OS) via [`CaFactory`]
//! - Keypair + CSR generation and CSR signing ([`identity`])
//! - Certificate inspection and chain verification (x509-parser)
//!
//! # Structured outputs
//!
//! A freshly generated CA keeps its rcgen [`Issuer`] next to the PEM
//! encoding, so signing with it never re-decodes PEM. PEM is only parsed when
//! CA material is loaded from storage with [`CertificateAuthority::from_pem`],
//! which is where malformed credentials are reported.

mod factory;
pub mod identity;

use std::fmt;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SignatureAlgorithm,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

pub use factory::{CaFactory, RootCas};
pub use identity::{mint_admin_identity, sign_request, verify_csr, IdentityRequest};

/// Default validity window for root CAs (10 years, 87600 hours)
pub const CA_VALIDITY: std::time::Duration = std::time::Duration::from_secs(87_600 * 3600);

/// Default validity window for leaf certificates (1 year)
pub const CERT_VALIDITY: std::time::Duration = std::time::Duration::from_secs(8_760 * 3600);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate or CSR generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// A PEM block, certificate or key could not be decoded
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// CSR is malformed or its self-signature does not verify
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::MalformedCredential(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Key algorithm for generated key pairs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// RSA 2048 with SHA-256
    Rsa,
    /// ECDSA P-256 with SHA-256
    #[default]
    Ecdsa,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            KeyAlgorithm::Rsa => &rcgen::PKCS_RSA_SHA256,
            KeyAlgorithm::Ecdsa => &rcgen::PKCS_ECDSA_P256_SHA256,
        }
    }

    /// Generate a fresh key pair for this algorithm
    pub fn generate_key(self) -> Result<KeyPair> {
        KeyPair::generate_for(self.signature_algorithm())
            .map_err(|e| PkiError::KeyGeneration(format!("{:?}: {}", self, e)))
    }
}

/// A PEM-encoded certificate and its private key
///
/// Both halves are always populated; the constructor rejects empty input.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PemCertAndKey {
    /// PEM certificate
    #[serde(rename = "crt")]
    pub cert: String,
    /// PEM private key (zeroized on drop)
    pub key: Zeroizing<String>,
}

impl PemCertAndKey {
    /// Pair a certificate and key, rejecting empty halves
    pub fn new(cert: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let cert = cert.into();
        let key = Zeroizing::new(key.into());
        if cert.trim().is_empty() || key.trim().is_empty() {
            return Err(PkiError::MalformedCredential(
                "certificate and key must both be present".to_string(),
            ));
        }
        Ok(Self { cert, key })
    }
}

impl fmt::Debug for PemCertAndKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemCertAndKey")
            .field("cert", &self.cert)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Parameters for a self-signed root CA
#[derive(Clone, Debug)]
pub struct CaOptions {
    /// Subject organization
    pub organization: String,
    /// Key algorithm of the CA key
    pub algorithm: KeyAlgorithm,
    /// Expiry of the CA certificate
    pub not_after: ::time::OffsetDateTime,
}

impl CaOptions {
    /// ECDSA CA for `organization`, valid for [`CA_VALIDITY`] from now
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            algorithm: KeyAlgorithm::Ecdsa,
            not_after: ::time::OffsetDateTime::now_utc() + CA_VALIDITY,
        }
    }

    /// Use RSA instead of ECDSA
    pub fn rsa(mut self, use_rsa: bool) -> Self {
        self.algorithm = if use_rsa {
            KeyAlgorithm::Rsa
        } else {
            KeyAlgorithm::Ecdsa
        };
        self
    }

    /// Set the expiry
    pub fn not_after(mut self, not_after: ::time::OffsetDateTime) -> Self {
        self.not_after = not_after;
        self
    }
}

/// A root certificate authority
///
/// Holds the rcgen signing handle alongside the PEM encoding handed to
/// downstream config renderers.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    pem: PemCertAndKey,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(options: &CaOptions) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(options.organization.clone()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = ::time::OffsetDateTime::now_utc();
        params.not_after = options.not_after;

        let key = options.algorithm.generate_key()?;
        let cert = params.self_signed(&key).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e))
        })?;

        let pem = PemCertAndKey::new(cert.pem(), key.serialize_pem())?;

        Ok(Self {
            issuer: Issuer::new(params, key),
            pem,
        })
    }

    /// Load a CA from stored PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::MalformedCredential(format!("failed to parse CA key: {}", e)))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key).map_err(|e| {
            PkiError::MalformedCredential(format!("failed to parse CA cert: {}", e))
        })?;

        Ok(Self {
            issuer,
            pem: PemCertAndKey::new(cert_pem, key_pem)?,
        })
    }

    /// PEM encoding of the certificate and key
    pub fn pem(&self) -> &PemCertAndKey {
        &self.pem
    }

    /// The CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.pem.cert
    }

    /// The CA private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.pem.key
    }

    /// Signing handle for issuing leaf certificates
    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Validity and subject of the CA certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(self.cert_pem())
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("pem", &self.pem)
            .finish_non_exhaustive()
    }
}

/// Subject and validity of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject organization (empty if absent)
    pub organization: String,
    /// Subject common name (empty if absent)
    pub common_name: String,
    /// Whether basic constraints mark this as a CA
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            PkiError::MalformedCredential(format!("failed to parse certificate: {}", e))
        })?;

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            organization: first_attr(cert.subject().iter_organization()),
            common_name: first_attr(cert.subject().iter_common_name()),
            is_ca: cert.is_ca(),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

fn first_attr<'a, 'b: 'a>(mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>) -> String {
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Verify that `cert_pem` is signed by the key of `ca_cert_pem` and is
/// currently inside its validity window
///
/// Returns `Ok(false)` for a well-formed certificate that does not chain to
/// the CA; malformed input is an error.
pub fn verify_cert_chain(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let ca_der = parse_pem(ca_cert_pem)?;

    let (_, cert) = X509Certificate::from_der(&cert_der).map_err(|e| {
        PkiError::MalformedCredential(format!("failed to parse certificate: {}", e))
    })?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::MalformedCredential(format!("failed to parse CA cert: {}", e)))?;

    if cert.verify_signature(Some(ca.public_key())).is_err() {
        return Ok(false);
    }

    Ok(cert.validity().is_valid())
}
