//! nodetrust - cluster trust bootstrap CLI

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nodetrust::bootstrap::{Input, InputConfig};
use nodetrust::cis::{
    ArtifactPaths, ComplianceArtifacts, DEFAULT_AUDIT_POLICY_PATH, DEFAULT_ENCRYPTION_CONFIG_PATH,
};
use nodetrust::pki::{CertificateInfo, IdentityRequest};
use nodetrust::secrets::{SecretGenerator, Token};
use nodetrust::trustd::{GrpcConnector, IssuerConfig, RemoteIdentityIssuer};
use nodetrust::DEFAULT_TRUSTD_PORT;

/// Exit status when a rerun may succeed (EX_TEMPFAIL), so a supervisor can
/// restart the join
const EXIT_RETRYABLE: i32 = 75;

/// nodetrust - cluster trust bootstrap: root CAs, tokens and node identities
#[derive(Parser, Debug)]
#[command(name = "nodetrust", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the bootstrap bundle for a new cluster
    ///
    /// Creates the etcd, Kubernetes and OS root CAs, the admin identity and
    /// all bootstrap tokens, and prints them as YAML.
    Generate(GenerateArgs),

    /// Obtain a signed node identity from the trust service
    ///
    /// Generates a key pair and CSR locally and polls trustd until the
    /// certificate is issued. Ctrl-C aborts.
    Identity(IdentityArgs),

    /// Write the CIS audit policy and encryption config on a master node
    Cis(CisArgs),
}

#[derive(Parser, Debug)]
struct GenerateArgs {
    /// Cluster name
    #[arg(long, env = "NODETRUST_CLUSTER_NAME")]
    cluster_name: String,

    /// Control plane node address; repeat or comma-separate for several
    #[arg(
        long = "master-ip",
        env = "NODETRUST_MASTER_IPS",
        value_delimiter = ',',
        required = true
    )]
    master_ips: Vec<String>,

    /// Kubernetes version to deploy
    #[arg(long, env = "NODETRUST_KUBERNETES_VERSION", default_value = "v1.30.0")]
    kubernetes_version: String,

    /// Canonical control plane address (overrides the config file)
    #[arg(long, env = "NODETRUST_CONTROL_PLANE_ENDPOINT")]
    control_plane_endpoint: Option<String>,

    /// YAML file with network, CA and SAN overrides
    #[arg(short = 'f', long = "config", env = "NODETRUST_CONFIG")]
    config_file: Option<PathBuf>,

    /// Write the bundle here (mode 0600) instead of stdout
    #[arg(short, long, env = "NODETRUST_OUTPUT")]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct IdentityArgs {
    /// trustd endpoint (`host` or `host:port`); repeat or comma-separate for failover
    #[arg(
        long = "endpoint",
        env = "NODETRUST_ENDPOINTS",
        value_delimiter = ',',
        required = true
    )]
    endpoints: Vec<String>,

    /// trustd token
    #[arg(long, env = "NODETRUST_TOKEN", hide_env_values = true)]
    token: String,

    /// Port for endpoints given without one
    #[arg(long, env = "NODETRUST_PORT", default_value_t = DEFAULT_TRUSTD_PORT)]
    port: u16,

    /// CA certificate to verify trustd with; plaintext when absent
    #[arg(long, env = "NODETRUST_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Name to verify the trustd certificate against (defaults to the endpoint host)
    #[arg(long, env = "NODETRUST_TLS_SERVER_NAME", requires = "ca_cert")]
    tls_server_name: Option<String>,

    /// Subject alternative name for the node certificate; repeatable
    #[arg(long = "san", env = "NODETRUST_SANS", value_delimiter = ',')]
    sans: Vec<String>,

    /// Subject common name for the node certificate
    #[arg(long, env = "NODETRUST_COMMON_NAME")]
    common_name: Option<String>,

    /// Directory receiving ca.crt, node.crt and node.key
    #[arg(long, env = "NODETRUST_OUT_DIR")]
    out_dir: PathBuf,

    /// Overall issuance deadline in seconds
    #[arg(long, env = "NODETRUST_TIMEOUT_SECS", default_value = "300")]
    timeout_secs: u64,
}

#[derive(Parser, Debug)]
struct CisArgs {
    /// Base64 AES-CBC encryption secret from the bootstrap bundle
    #[arg(long, env = "NODETRUST_ENCRYPTION_SECRET", hide_env_values = true)]
    encryption_secret: String,

    /// Audit policy output path
    #[arg(
        long,
        env = "NODETRUST_AUDIT_POLICY",
        default_value = DEFAULT_AUDIT_POLICY_PATH
    )]
    audit_policy: PathBuf,

    /// Encryption config output path
    #[arg(
        long,
        env = "NODETRUST_ENCRYPTION_CONFIG",
        default_value = DEFAULT_ENCRYPTION_CONFIG_PATH
    )]
    encryption_config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             TLS to the trust service cannot be established securely.",
            e
        );
        std::process::exit(1);
    }

    // Logs go to stderr so `generate` can print the bundle on stdout
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Generate(args) => run_generate(args),
        Commands::Identity(args) => run_identity(args).await,
        Commands::Cis(args) => run_cis(args),
    };

    if let Err(e) = &result {
        if e
            .downcast_ref::<nodetrust::Error>()
            .is_some_and(nodetrust::Error::is_retryable)
        {
            tracing::error!(error = %e, "Failed, rerun may succeed");
            std::process::exit(EXIT_RETRYABLE);
        }
    }
    result
}

/// Build the bootstrap bundle and emit it as YAML
fn run_generate(args: GenerateArgs) -> anyhow::Result<()> {
    let mut config = match &args.config_file {
        Some(path) => InputConfig::from_file(path)?,
        None => InputConfig::default(),
    };
    if args.control_plane_endpoint.is_some() {
        config.control_plane_endpoint = args.control_plane_endpoint.clone();
    }

    let input = Input::with_config(
        &args.cluster_name,
        args.master_ips,
        &args.kubernetes_version,
        &config,
        &SecretGenerator::new(),
    )?;

    let os_ca = CertificateInfo::from_pem(&input.certs.os.cert)?;
    tracing::info!(
        cluster = %input.cluster_name,
        control_plane = %input.control_plane_endpoint()?,
        ca_not_after = %os_ca.not_after,
        "Bootstrap bundle generated"
    );

    let yaml = zeroize::Zeroizing::new(
        serde_yaml::to_string(&input).context("failed to serialize bootstrap bundle")?,
    );
    match &args.output {
        Some(path) => write_file(path, yaml.as_bytes(), 0o600)?,
        None => std::io::stdout()
            .write_all(yaml.as_bytes())
            .context("failed to write bundle to stdout")?,
    }
    Ok(())
}

/// Run the remote issuance flow and store the node identity
async fn run_identity(args: IdentityArgs) -> anyhow::Result<()> {
    let config = IssuerConfig {
        deadline: std::time::Duration::from_secs(args.timeout_secs),
        ..IssuerConfig::default()
    };

    let mut connector = GrpcConnector::new(&config);
    if let Some(path) = &args.ca_cert {
        let ca = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read CA certificate {}", path.display()))?;
        connector = connector.with_ca_certificate(ca);
    }
    if let Some(name) = &args.tls_server_name {
        connector = connector.with_domain_name(name);
    }

    let issuer = RemoteIdentityIssuer::from_hosts(
        connector,
        &args.endpoints,
        args.port,
        Token::new(args.token),
        config,
    )?;

    let request = IdentityRequest::with_common_name(args.common_name.as_deref(), &args.sans)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, canceling issuance");
            on_signal.cancel();
        }
    });

    let identity = issuer
        .issue(request.csr_pem(), &cancel)
        .await
        .map_err(nodetrust::Error::from)?;

    let crt = std::str::from_utf8(&identity.crt).context("issued certificate is not PEM")?;
    let issued = CertificateInfo::from_pem(crt)?;

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    write_file(&args.out_dir.join("ca.crt"), &identity.ca, 0o644)?;
    write_file(&args.out_dir.join("node.crt"), &identity.crt, 0o644)?;
    write_file(&args.out_dir.join("node.key"), request.key_pem().as_bytes(), 0o600)?;

    tracing::info!(
        endpoint = %identity.endpoint,
        common_name = %issued.common_name,
        not_after = issued.not_after,
        out_dir = %args.out_dir.display(),
        "Node identity stored"
    );
    Ok(())
}

/// Write the control plane compliance artifacts
fn run_cis(args: CisArgs) -> anyhow::Result<()> {
    let artifacts = ComplianceArtifacts::new(ArtifactPaths {
        audit_policy: args.audit_policy,
        encryption_config: args.encryption_config,
    });
    artifacts.enforce_master_requirements(&Token::new(args.encryption_secret))?;
    Ok(())
}

/// Write `contents` to `path` with `mode`, replacing any existing file
///
/// `mode` only applies on creation, so an existing file is narrowed to
/// `mode` before anything is written to it.
fn write_file(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_permissions(Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    /// Story: a world-readable key from an earlier run is overwritten
    ///
    /// The new key must not inherit the old file's loose permissions.
    #[test]
    fn story_rewrite_narrows_existing_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("node.key");
        std::fs::write(&key, "old key").unwrap();
        std::fs::set_permissions(&key, Permissions::from_mode(0o644)).unwrap();

        write_file(&key, b"new key", 0o600).unwrap();

        assert_eq!(mode_of(&key), 0o600);
        assert_eq!(std::fs::read_to_string(&key).unwrap(), "new key");
    }

    #[test]
    fn new_file_gets_requested_mode() {
        let dir = tempfile::tempdir().unwrap();
        let crt = dir.path().join("node.crt");

        write_file(&crt, b"cert", 0o644).unwrap();
        assert_eq!(mode_of(&crt), 0o644);
    }

    #[test]
    fn cli_parses_identity_flags() {
        let cli = Cli::try_parse_from([
            "nodetrust",
            "identity",
            "--endpoint",
            "10.0.0.1,10.0.0.2:6000",
            "--token",
            "abcdef.0123456789abcdef",
            "--ca-cert",
            "/etc/trustd/ca.crt",
            "--tls-server-name",
            "trustd.cluster.local",
            "--out-dir",
            "/var/lib/node",
        ])
        .unwrap();

        match cli.command {
            Commands::Identity(args) => {
                assert_eq!(args.endpoints, vec!["10.0.0.1", "10.0.0.2:6000"]);
                assert_eq!(args.tls_server_name.as_deref(), Some("trustd.cluster.local"));
                assert_eq!(args.port, DEFAULT_TRUSTD_PORT);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn tls_server_name_requires_ca_cert() {
        let result = Cli::try_parse_from([
            "nodetrust",
            "identity",
            "--endpoint",
            "10.0.0.1",
            "--token",
            "abcdef.0123456789abcdef",
            "--tls-server-name",
            "trustd.cluster.local",
            "--out-dir",
            "/var/lib/node",
        ]);
        assert!(result.is_err());
    }
}
