//! Remote node identity issuance through the trust service (trustd)
//!
//! A joining node holds a freshly generated key and CSR but no signed
//! certificate. [`RemoteIdentityIssuer`] submits the CSR to one of an ordered
//! list of trustd endpoints, authenticated with the shared trustd token, and
//! polls until the signed identity comes back.
//!
//! ```text
//! SelectEndpoint -> Connecting -> Polling -> {Issued, TimedOut, Failed}
//! ```
//!
//! - Endpoints are dialed strictly in order; each failure is recorded and the
//!   next endpoint tried. If all fail the call ends with
//!   [`IssuanceError::EndpointsExhausted`] carrying every failure.
//! - The CSR is submitted once. A failed submission still proceeds to polling
//!   since the service may have accepted it.
//! - Polls repeat the same request every poll interval. An empty response
//!   means approval is pending.
//! - A five minute deadline from the start of the call and the caller's
//!   [`CancellationToken`](tokio_util::sync::CancellationToken) both preempt
//!   every wait.
//!
//! The transport sits behind [`TrustConnector`]/[`TrustClient`] so the state
//! machine can be driven by in-memory fakes; [`GrpcConnector`] is the tonic
//! implementation.

mod client;
mod issuer;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::bootstrap::join_host_port;
use crate::proto::{CertificateRequest, CertificateResponse};
use crate::secrets::Token;

pub use client::{GrpcClient, GrpcConnector};
pub use issuer::{IssuedIdentity, RemoteIdentityIssuer};

/// Errors from a single transport operation against one endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint could not be turned into a URI or TLS config
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Dial or handshake failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// The call itself failed
    #[error("rpc failed: {0}")]
    Rpc(String),
}

/// One endpoint and why it failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    /// Endpoint that failed
    pub endpoint: RemoteEndpoint,
    /// Failure cause
    pub error: TransportError,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

/// Per-endpoint failures collected during endpoint selection, in dial order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointErrors(Vec<EndpointFailure>);

impl EndpointErrors {
    /// Record a failure
    pub fn push(&mut self, endpoint: RemoteEndpoint, error: TransportError) {
        self.0.push(EndpointFailure { endpoint, error });
    }

    /// Underlying failures, in dial order
    pub fn causes(&self) -> &[EndpointFailure] {
        &self.0
    }

    /// Number of failed endpoints
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// No endpoint failed
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EndpointErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} endpoint(s) failed", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for EndpointErrors {}

/// Terminal errors of an issuance call
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// The endpoint list was empty
    #[error("at least one root of trust endpoint is required")]
    NoEndpoints,

    /// An endpoint string could not be parsed
    #[error("invalid trust endpoint '{0}'")]
    InvalidEndpoint(String),

    /// Issuer timing cannot be scheduled
    #[error("invalid issuer configuration: {0}")]
    InvalidConfig(String),

    /// Every endpoint refused the connection
    #[error("unable to reach any trust endpoint: {0}")]
    EndpointsExhausted(EndpointErrors),

    /// A single-shot request failed after connecting
    #[error("certificate request to {endpoint} failed: {source}")]
    Request {
        /// Endpoint the request went to
        endpoint: RemoteEndpoint,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// The overall deadline expired before a certificate was issued
    #[error("timeout waiting for certificate after {elapsed:?}")]
    DeadlineExceeded {
        /// Time since the call started
        elapsed: Duration,
    },

    /// The caller canceled the call
    #[error("certificate issuance canceled")]
    Canceled,
}

/// Which bound ended an issuance call, without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceErrorKind {
    /// Bad endpoint input
    InvalidInput,
    /// All endpoints failed
    EndpointsExhausted,
    /// Single-shot request failed
    Transport,
    /// Deadline hit
    DeadlineExceeded,
    /// Canceled by the caller
    Canceled,
}

impl IssuanceError {
    /// Fieldless kind for matching
    pub fn kind(&self) -> IssuanceErrorKind {
        match self {
            IssuanceError::NoEndpoints
            | IssuanceError::InvalidEndpoint(_)
            | IssuanceError::InvalidConfig(_) => IssuanceErrorKind::InvalidInput,
            IssuanceError::EndpointsExhausted(_) => IssuanceErrorKind::EndpointsExhausted,
            IssuanceError::Request { .. } => IssuanceErrorKind::Transport,
            IssuanceError::DeadlineExceeded { .. } => IssuanceErrorKind::DeadlineExceeded,
            IssuanceError::Canceled => IssuanceErrorKind::Canceled,
        }
    }

    /// Terminal state this error leaves the state machine in
    pub fn terminal_state(&self) -> IssuanceState {
        match self {
            IssuanceError::DeadlineExceeded { .. } => IssuanceState::TimedOut,
            _ => IssuanceState::Failed,
        }
    }

    /// Per-endpoint failures, if this error carries them
    pub fn endpoint_errors(&self) -> Option<&EndpointErrors> {
        match self {
            IssuanceError::EndpointsExhausted(errors) => Some(errors),
            _ => None,
        }
    }
}

/// States of one issuance call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    /// Picking the next endpoint to dial
    SelectEndpoint,
    /// Dialing an endpoint
    Connecting,
    /// Connected; waiting for the certificate
    Polling,
    /// Certificate received
    Issued,
    /// Deadline expired
    TimedOut,
    /// Canceled or out of endpoints
    Failed,
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssuanceState::SelectEndpoint => "select-endpoint",
            IssuanceState::Connecting => "connecting",
            IssuanceState::Polling => "polling",
            IssuanceState::Issued => "issued",
            IssuanceState::TimedOut => "timed-out",
            IssuanceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A trustd `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteEndpoint {
    /// Hostname or IP literal, without brackets
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl RemoteEndpoint {
    /// Create an endpoint from parts
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    ///
    /// A bare IPv6 literal (more than one colon, no brackets) is a host.
    /// `default_port` applies when no port is given.
    pub fn parse(value: &str, default_port: u16) -> Result<Self, IssuanceError> {
        let invalid = || IssuanceError::InvalidEndpoint(value.to_string());
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid());
        }

        if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            let port = match tail {
                "" => default_port,
                _ => tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(invalid)?,
            };
            return Ok(Self::new(host, port));
        }

        match value.matches(':').count() {
            0 => Ok(Self::new(value, default_port)),
            1 => {
                let (host, port) = value.split_once(':').ok_or_else(invalid)?;
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = port.parse().map_err(|_| invalid())?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(value, default_port)),
        }
    }

    /// Parse a list of endpoints sharing a default port
    pub fn parse_all<S: AsRef<str>>(
        values: &[S],
        default_port: u16,
    ) -> Result<Vec<Self>, IssuanceError> {
        values
            .iter()
            .map(|v| Self::parse(v.as_ref(), default_port))
            .collect()
    }

    /// `scheme://host:port` URI for dialing
    pub fn uri(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{}://{}", scheme, self)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host, &self.port.to_string()))
    }
}

/// Timing of an issuance call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuerConfig {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Bound on the whole call, from its start
    pub deadline: Duration,
    /// Per-endpoint dial timeout
    pub connect_timeout: Duration,
    /// Per-call RPC timeout
    pub rpc_timeout: Duration,
}

impl IssuerConfig {
    /// Reject timing the runtime cannot schedule
    ///
    /// A zero poll interval would spin, and a deadline or interval past the
    /// clock's range cannot be turned into an instant.
    pub fn validate(&self) -> Result<(), IssuanceError> {
        if self.poll_interval.is_zero() {
            return Err(IssuanceError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let now = tokio::time::Instant::now();
        offset(now, self.deadline, "deadline")?;
        offset(now, self.poll_interval, "poll interval")?;
        Ok(())
    }
}

/// `from + by`, or `InvalidConfig` naming `what` when it overflows
pub(crate) fn offset(
    from: tokio::time::Instant,
    by: Duration,
    what: &str,
) -> Result<tokio::time::Instant, IssuanceError> {
    from.checked_add(by)
        .ok_or_else(|| IssuanceError::InvalidConfig(format!("{} of {:?} is out of range", what, by)))
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens authenticated connections to trustd endpoints
#[async_trait]
pub trait TrustConnector: Send + Sync {
    /// Connected client type
    type Client: TrustClient;

    /// Dial `endpoint`, attaching `token` to every call on the connection
    async fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        token: &Token,
    ) -> Result<Self::Client, TransportError>;
}

/// An authenticated connection to one trustd endpoint
#[async_trait]
pub trait TrustClient: Send {
    /// Submit (or re-submit) a CSR
    async fn certificate(
        &mut self,
        request: CertificateRequest,
    ) -> Result<CertificateResponse, TransportError>;
}
