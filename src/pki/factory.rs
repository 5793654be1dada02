//! Root CA generation for a new cluster

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CaOptions, CertificateAuthority, PkiError, Result, CA_VALIDITY};

/// Organization of the etcd root CA
pub const DEFAULT_ETCD_ORGANIZATION: &str = "etcd";

/// Organization of the Kubernetes root CA
pub const DEFAULT_KUBERNETES_ORGANIZATION: &str = "kubernetes-CA-organization";

/// Organization of the OS root CA
pub const DEFAULT_OS_ORGANIZATION: &str = "os-CA-organization";

/// Parameterization of the three cluster root CAs
///
/// etcd and Kubernetes roots use RSA; the OS root uses ECDSA. All three share
/// one validity window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaFactory {
    /// Organization of the etcd CA
    pub etcd_organization: String,
    /// Organization of the Kubernetes CA
    pub kubernetes_organization: String,
    /// Organization of the OS CA
    pub os_organization: String,
    /// CA validity in hours
    pub validity_hours: u64,
}

impl Default for CaFactory {
    fn default() -> Self {
        Self {
            etcd_organization: DEFAULT_ETCD_ORGANIZATION.to_string(),
            kubernetes_organization: DEFAULT_KUBERNETES_ORGANIZATION.to_string(),
            os_organization: DEFAULT_OS_ORGANIZATION.to_string(),
            validity_hours: CA_VALIDITY.as_secs() / 3600,
        }
    }
}

/// The three independent cluster roots
#[derive(Debug)]
pub struct RootCas {
    /// etcd peer/client CA
    pub etcd: CertificateAuthority,
    /// Kubernetes cluster CA
    pub kubernetes: CertificateAuthority,
    /// OS API CA; also signs the admin identity
    pub os: CertificateAuthority,
}

impl CaFactory {
    /// Create one self-signed CA
    pub fn new_ca(
        &self,
        organization: &str,
        use_rsa: bool,
        not_after: ::time::OffsetDateTime,
    ) -> Result<CertificateAuthority> {
        let options = CaOptions::new(organization)
            .rsa(use_rsa)
            .not_after(not_after);
        let ca = CertificateAuthority::new(&options)?;

        info!(
            organization = %organization,
            algorithm = ?options.algorithm,
            not_after = %not_after,
            "Generated root CA"
        );
        Ok(ca)
    }

    /// Expiry for CAs generated now
    ///
    /// Fails when the validity window runs past what an X.509 date can hold.
    pub fn not_after(&self) -> Result<::time::OffsetDateTime> {
        let out_of_range = || {
            PkiError::CertificateGeneration(format!(
                "CA validity of {} hours is out of range",
                self.validity_hours
            ))
        };

        let secs = i64::try_from(self.validity_hours)
            .ok()
            .and_then(|hours| hours.checked_mul(3600))
            .ok_or_else(out_of_range)?;
        ::time::OffsetDateTime::now_utc()
            .checked_add(::time::Duration::seconds(secs))
            .ok_or_else(out_of_range)
    }

    /// Generate the etcd, Kubernetes and OS roots
    ///
    /// Any failure aborts the whole set; no partial result is returned.
    pub fn generate(&self) -> Result<RootCas> {
        let not_after = self.not_after()?;

        Ok(RootCas {
            etcd: self.new_ca(&self.etcd_organization, true, not_after)?,
            kubernetes: self.new_ca(&self.kubernetes_organization, true, not_after)?,
            os: self.new_ca(&self.os_organization, false, not_after)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{verify_cert_chain, CertificateInfo};

    #[test]
    fn defaults_match_cluster_conventions() {
        let factory = CaFactory::default();
        assert_eq!(factory.etcd_organization, "etcd");
        assert_eq!(factory.kubernetes_organization, "kubernetes-CA-organization");
        assert_eq!(factory.os_organization, "os-CA-organization");
        assert_eq!(factory.validity_hours, 87_600);
    }

    /// Story: a new cluster gets three unrelated trust roots
    ///
    /// Compromise of one root must not let it sign for another, so each CA
    /// has its own key and none verifies another's certificate.
    #[test]
    fn story_three_independent_roots() {
        let roots = CaFactory::default().generate().unwrap();

        let etcd = CertificateInfo::from_pem(roots.etcd.cert_pem()).unwrap();
        let k8s = CertificateInfo::from_pem(roots.kubernetes.cert_pem()).unwrap();
        let os = CertificateInfo::from_pem(roots.os.cert_pem()).unwrap();

        assert_eq!(etcd.organization, "etcd");
        assert_eq!(k8s.organization, "kubernetes-CA-organization");
        assert_eq!(os.organization, "os-CA-organization");
        assert!(etcd.is_ca && k8s.is_ca && os.is_ca);

        assert!(!verify_cert_chain(roots.etcd.cert_pem(), roots.kubernetes.cert_pem()).unwrap());
        assert!(!verify_cert_chain(roots.os.cert_pem(), roots.etcd.cert_pem()).unwrap());
        assert_ne!(roots.etcd.key_pem(), roots.kubernetes.key_pem());
    }

    #[test]
    fn os_root_is_elliptic_curve_and_others_rsa() {
        let roots = CaFactory::default().generate().unwrap();

        assert!(roots.os.key_pem().contains("PRIVATE KEY"));
        // PKCS#8 RSA keys are far longer than P-256 keys
        assert!(roots.etcd.key_pem().len() > 3 * roots.os.key_pem().len());
        assert!(roots.kubernetes.key_pem().len() > 3 * roots.os.key_pem().len());
    }

    #[test]
    fn custom_names_and_validity_are_applied() {
        let factory = CaFactory {
            etcd_organization: "acme-etcd".to_string(),
            kubernetes_organization: "acme-k8s".to_string(),
            os_organization: "acme-os".to_string(),
            validity_hours: 24,
        };
        let roots = factory.generate().unwrap();

        let os = CertificateInfo::from_pem(roots.os.cert_pem()).unwrap();
        assert_eq!(os.organization, "acme-os");
        assert!((os.lifetime_secs() - 24 * 3600).abs() < 60);
    }

    /// Story: a config file asks for a validity no certificate can carry
    ///
    /// The bootstrap must fail with an error instead of taking the process
    /// down, whether the window overflows the hour count or the calendar.
    #[test]
    fn story_out_of_range_validity_is_an_error() {
        for yaml in ["validityHours: 100000000", "validityHours: 18446744073709551615"] {
            let factory: CaFactory = serde_yaml::from_str(yaml).unwrap();

            assert!(matches!(
                factory.not_after(),
                Err(PkiError::CertificateGeneration(_))
            ));
            let err = factory.generate().unwrap_err();
            assert!(err.to_string().contains("out of range"), "{}", err);
        }
    }
}
