//! Bootstrap input: the one-shot trust bundle for a new cluster
//!
//! [`Input`] is built once when a cluster is created, then rendered into
//! node-specific configuration and discarded. Construction is synchronous:
//!
//! 1. Pick the address family from the master IPs (pod/service CIDRs, loopback)
//! 2. Generate the kubeadm bootstrap token, certificate key and AES-CBC secret
//! 3. Generate the trustd token
//! 4. Generate the etcd, Kubernetes and OS root CAs
//! 5. Mint the admin identity against the OS CA
//!
//! Any failure aborts construction; a partial bundle is never returned.
//!
//! # Topology accessors
//!
//! Accessors that need a master IP return [`TopologyError`] instead of
//! panicking when the topology is empty, so renderers can report a bad
//! cluster definition to the caller.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::pki::{mint_admin_identity, CaFactory, PemCertAndKey, PkiError};
use crate::secrets::{EntropySource, SecretError, SecretGenerator, SystemEntropy, Token};

/// Pod network for IPv4 clusters
pub const DEFAULT_IPV4_POD_NET: &str = "10.244.0.0/16";

/// Service network for IPv4 clusters
pub const DEFAULT_IPV4_SERVICE_NET: &str = "10.96.0.0/12";

/// Pod network for IPv6 clusters
pub const DEFAULT_IPV6_POD_NET: &str = "fc00:db8:10::/56";

/// Service network for IPv6 clusters
pub const DEFAULT_IPV6_SERVICE_NET: &str = "fc00:db8:20::/112";

/// Kubernetes DNS domain for services
pub const DEFAULT_SERVICE_DOMAIN: &str = "cluster.local";

/// Errors from accessors that depend on the cluster topology
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// The operation needs at least one master IP
    #[error("cannot compute {operation} without any master IPs")]
    NoMasterIps {
        /// Accessor that was called
        operation: &'static str,
    },

    /// Neither an explicit control plane endpoint nor a master IP is set
    #[error("no control plane endpoint and no master IPs to derive one from")]
    NoControlPlaneEndpoint,
}

/// Errors while building an [`Input`]
#[derive(Debug, Error)]
pub enum InputError {
    /// Secret generation failed
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// CA or identity generation failed
    #[error(transparent)]
    Pki(#[from] PkiError),
}

/// IP family of the cluster control plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    /// IPv4 control plane
    V4,
    /// IPv6-only control plane
    V6,
}

impl AddressFamily {
    /// Detect the family of a set of master addresses
    ///
    /// IPv6 only when at least one address is IPv6 (and not IPv4-mapped) and
    /// none is IPv4. Entries that are not IP literals are ignored.
    ///
    /// Mixed v4/v6 masters resolve to V4, not V6 as an any-IPv6 check would;
    /// dual-stack renderers must pick their family explicitly.
    pub fn detect<S: AsRef<str>>(addrs: &[S]) -> Self {
        let mut saw_v6 = false;
        for addr in addrs {
            match addr.as_ref().parse::<IpAddr>() {
                Ok(IpAddr::V4(_)) => return AddressFamily::V4,
                Ok(IpAddr::V6(v6)) if v6.to_ipv4_mapped().is_some() => return AddressFamily::V4,
                Ok(IpAddr::V6(_)) => saw_v6 = true,
                Err(_) => {}
            }
        }
        if saw_v6 {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        }
    }

    /// Loopback address of this family
    pub fn loopback(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// Default pod and service CIDRs per address family
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkDefaults {
    /// Pod CIDR for IPv4 clusters
    pub ipv4_pod_net: String,
    /// Service CIDR for IPv4 clusters
    pub ipv4_service_net: String,
    /// Pod CIDR for IPv6 clusters
    pub ipv6_pod_net: String,
    /// Service CIDR for IPv6 clusters
    pub ipv6_service_net: String,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            ipv4_pod_net: DEFAULT_IPV4_POD_NET.to_string(),
            ipv4_service_net: DEFAULT_IPV4_SERVICE_NET.to_string(),
            ipv6_pod_net: DEFAULT_IPV6_POD_NET.to_string(),
            ipv6_service_net: DEFAULT_IPV6_SERVICE_NET.to_string(),
        }
    }
}

impl NetworkDefaults {
    /// (pod CIDR, service CIDR) for `family`
    pub fn for_family(&self, family: AddressFamily) -> (&str, &str) {
        match family {
            AddressFamily::V4 => (&self.ipv4_pod_net, &self.ipv4_service_net),
            AddressFamily::V6 => (&self.ipv6_pod_net, &self.ipv6_service_net),
        }
    }
}

/// Overridable defaults for [`Input`] construction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InputConfig {
    /// Default CIDRs per address family
    pub networks: NetworkDefaults,
    /// Kubernetes service DNS domain
    pub service_domain: String,
    /// Canonical control plane address (DNS name, LB IP, optional port)
    pub control_plane_endpoint: Option<String>,
    /// Extra SANs for the API server certificate
    pub additional_subject_alt_names: Vec<String>,
    /// etcd runs outside the control plane nodes
    pub external_etcd: bool,
    /// Root CA naming and validity
    pub certificate_authorities: CaFactory,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            networks: NetworkDefaults::default(),
            service_domain: DEFAULT_SERVICE_DOMAIN.to_string(),
            control_plane_endpoint: None,
            additional_subject_alt_names: Vec::new(),
            external_etcd: false,
            certificate_authorities: CaFactory::default(),
        }
    }
}

impl InputConfig {
    /// Load overrides from a YAML file; absent keys keep their defaults
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&content)
            .map_err(|e| crate::Error::config(format!("invalid config {}: {}", path.display(), e)))
    }
}

/// PEM certificates and keys of the bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certs {
    /// Admin client identity, signed by the OS CA
    pub admin: PemCertAndKey,
    /// etcd root CA
    pub etcd: PemCertAndKey,
    /// Kubernetes root CA
    pub k8s: PemCertAndKey,
    /// OS root CA
    pub os: PemCertAndKey,
}

/// Kubeadm secrets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmTokens {
    /// `xxxxxx.xxxxxxxxxxxxxxxx` join token
    pub bootstrap_token: Token,
    /// Base64 AES-CBC key for secret encryption at rest
    pub aescbc_encryption_secret: Token,
    /// Hex SHA-256 key for control plane certificate upload
    pub certificate_key: Token,
}

/// Credentials for the trust service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustdInfo {
    /// Bearer token, same shape as the bootstrap token
    pub token: Token,
}

/// The bootstrap bundle for one cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    /// Root CAs and admin identity
    pub certs: Certs,
    /// Canonical control plane address; defaults to the first master IP
    pub control_plane_endpoint: Option<String>,
    /// Control plane node addresses, first one is the init node
    pub master_ips: Vec<String>,
    /// Extra API server SANs
    pub additional_subject_alt_names: Vec<String>,
    /// Cluster name
    pub cluster_name: String,
    /// Kubernetes service DNS domain
    pub service_domain: String,
    /// Pod CIDRs
    pub pod_net: Vec<String>,
    /// Service CIDRs
    pub service_net: Vec<String>,
    /// Kubernetes version to deploy
    pub kubernetes_version: String,
    /// Kubeadm secrets
    pub kubeadm_tokens: KubeadmTokens,
    /// Trust service credentials
    pub trustd_info: TrustdInfo,
    /// etcd runs outside the control plane nodes
    pub external_etcd: bool,
}

impl Input {
    /// Generate a bundle with default networks, CA names and the system RNG
    pub fn new(
        cluster_name: &str,
        master_ips: Vec<String>,
        kubernetes_version: &str,
    ) -> Result<Self, InputError> {
        Self::with_config(
            cluster_name,
            master_ips,
            kubernetes_version,
            &InputConfig::default(),
            &SecretGenerator::<SystemEntropy>::new(),
        )
    }

    /// Generate a bundle with explicit defaults and secret source
    pub fn with_config<E: EntropySource>(
        cluster_name: &str,
        master_ips: Vec<String>,
        kubernetes_version: &str,
        config: &InputConfig,
        secrets: &SecretGenerator<E>,
    ) -> Result<Self, InputError> {
        let family = AddressFamily::detect(&master_ips);
        let (pod_net, service_net) = config.networks.for_family(family);

        info!(
            cluster = %cluster_name,
            masters = master_ips.len(),
            family = ?family,
            "Generating bootstrap input"
        );

        let kubeadm_tokens = KubeadmTokens {
            bootstrap_token: secrets.bootstrap_token()?,
            certificate_key: secrets.certificate_key()?,
            aescbc_encryption_secret: secrets.encryption_token()?,
        };
        let trustd_info = TrustdInfo {
            token: secrets.bootstrap_token()?,
        };

        let roots = config.certificate_authorities.generate()?;
        let admin = mint_admin_identity(&roots.os, &[family.loopback()])?;

        let certs = Certs {
            admin,
            etcd: roots.etcd.pem().clone(),
            k8s: roots.kubernetes.pem().clone(),
            os: roots.os.pem().clone(),
        };

        Ok(Self {
            certs,
            control_plane_endpoint: config.control_plane_endpoint.clone(),
            master_ips,
            additional_subject_alt_names: config.additional_subject_alt_names.clone(),
            cluster_name: cluster_name.to_string(),
            service_domain: config.service_domain.clone(),
            pod_net: vec![pod_net.to_string()],
            service_net: vec![service_net.to_string()],
            kubernetes_version: kubernetes_version.to_string(),
            kubeadm_tokens,
            trustd_info,
            external_etcd: config.external_etcd,
        })
    }

    /// Address family of the master IPs
    pub fn address_family(&self) -> AddressFamily {
        AddressFamily::detect(&self.master_ips)
    }

    fn first_master(&self, operation: &'static str) -> Result<&str, TopologyError> {
        self.master_ips
            .first()
            .map(String::as_str)
            .ok_or(TopologyError::NoMasterIps { operation })
    }

    /// Comma-joined master IPs
    pub fn endpoints(&self) -> Result<String, TopologyError> {
        self.first_master("endpoints")?;
        Ok(self.master_ips.join(","))
    }

    /// `host:port` of the API server, always the first master
    ///
    /// An empty `port` yields the bare host (bracketed if IPv6).
    pub fn api_server_endpoint(&self, port: &str) -> Result<String, TopologyError> {
        let host = self.first_master("api server endpoint")?;
        if port.is_empty() {
            return Ok(format_address(host));
        }
        Ok(join_host_port(host, port))
    }

    /// Canonical control plane address
    ///
    /// The explicit endpoint is returned verbatim; otherwise the first master.
    pub fn control_plane_endpoint(&self) -> Result<String, TopologyError> {
        if let Some(endpoint) = self
            .control_plane_endpoint
            .as_deref()
            .filter(|e| !e.is_empty())
        {
            return Ok(endpoint.to_string());
        }
        let host = self
            .master_ips
            .first()
            .ok_or(TopologyError::NoControlPlaneEndpoint)?;
        Ok(format_address(host))
    }

    /// SANs for the API server certificate
    ///
    /// Both loopbacks, then the master IPs, then the additional SANs. Order is
    /// preserved and duplicates are kept.
    pub fn api_server_sans(&self) -> Vec<String> {
        let mut sans = vec![
            Ipv4Addr::LOCALHOST.to_string(),
            Ipv6Addr::LOCALHOST.to_string(),
        ];
        sans.extend(self.master_ips.iter().cloned());
        sans.extend(self.additional_subject_alt_names.iter().cloned());
        sans
    }
}

/// Bracket bare IPv6 literals so they can be followed by a port
pub fn format_address(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]", host),
        _ => host.to_string(),
    }
}

/// `host:port`, bracketing hosts that contain a colon
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
