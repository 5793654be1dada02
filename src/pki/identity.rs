//! Leaf identities: keypair + CSR generation and CSR signing
//!
//! The private key never leaves the [`IdentityRequest`]; only the CSR is
//! handed to a signer, whether that is a local CA or the remote trust service.

use std::fmt;
use std::net::IpAddr;

use rcgen::{
    string::Ia5String, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::debug;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use super::{
    parse_pem, CertificateAuthority, KeyAlgorithm, PemCertAndKey, PkiError, Result, CERT_VALIDITY,
};

/// A locally generated key pair and the CSR built from it
pub struct IdentityRequest {
    key: KeyPair,
    csr_pem: String,
    sans: Vec<String>,
}

impl IdentityRequest {
    /// Generate an ECDSA key pair and a CSR carrying `sans`
    ///
    /// Entries that parse as IP addresses become IP SANs; everything else is
    /// a DNS SAN.
    pub fn new(sans: &[String]) -> Result<Self> {
        Self::with_common_name(None, sans)
    }

    /// Like [`IdentityRequest::new`] with an optional subject common name
    pub fn with_common_name(common_name: Option<&str>, sans: &[String]) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        if let Some(cn) = common_name {
            dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        }
        params.distinguished_name = dn;
        params.subject_alt_names = sans
            .iter()
            .map(|san| to_san(san))
            .collect::<Result<Vec<_>>>()?;

        let key = KeyAlgorithm::Ecdsa.generate_key()?;

        let csr = params.serialize_request(&key).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key,
            csr_pem,
            sans: sans.to_vec(),
        })
    }

    /// The CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// The private key in PEM format
    pub fn key_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(self.key.serialize_pem())
    }

    /// Requested subject alternative names
    pub fn sans(&self) -> &[String] {
        &self.sans
    }
}

impl fmt::Debug for IdentityRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRequest")
            .field("sans", &self.sans)
            .finish_non_exhaustive()
    }
}

fn to_san(san: &str) -> Result<SanType> {
    if let Ok(ip) = san.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(san.to_string())
        .map(SanType::DnsName)
        .map_err(|e| PkiError::CertificateGeneration(format!("invalid DNS name '{}': {}", san, e)))
}

/// Check that a PEM CSR is well formed and self-signed by its embedded key
pub fn verify_csr(csr_pem: &str) -> Result<()> {
    let der = parse_pem(csr_pem).map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;
    csr.verify_signature()
        .map_err(|e| PkiError::InvalidCsr(format!("CSR signature does not verify: {}", e)))
}

/// Sign a CSR with `ca`, returning the leaf certificate in PEM format
///
/// Subject and SANs come from the CSR; key usage, client+server auth and a
/// one year validity are imposed by the signer.
pub fn sign_request(ca: &CertificateAuthority, csr_pem: &str) -> Result<String> {
    verify_csr(csr_pem)?;

    let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

    csr_params.params.is_ca = IsCa::NoCa;
    csr_params.params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    csr_params.params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    let now = ::time::OffsetDateTime::now_utc();
    csr_params.params.not_before = now;
    csr_params.params.not_after = now + CERT_VALIDITY;

    let cert = csr_params.signed_by(ca.issuer()).map_err(|e| {
        PkiError::CertificateGeneration(format!("failed to sign certificate: {}", e))
    })?;

    Ok(cert.pem())
}

/// Mint the cluster admin identity, signed by the OS CA
///
/// A fresh key pair is generated for the admin; the certificate carries the
/// loopback addresses as IP SANs.
pub fn mint_admin_identity(
    os_ca: &CertificateAuthority,
    loopback: &[IpAddr],
) -> Result<PemCertAndKey> {
    let sans: Vec<String> = loopback.iter().map(ToString::to_string).collect();
    let request = IdentityRequest::new(&sans)?;
    let cert = sign_request(os_ca, request.csr_pem())?;

    debug!(sans = ?sans, "Minted admin identity");
    PemCertAndKey::new(cert, request.key_pem().as_str())
}
