//! The issuance state machine

use std::future::Future;

use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    offset, EndpointErrors, IssuanceError, IssuanceState, IssuerConfig, RemoteEndpoint,
    TrustClient, TrustConnector,
};
use crate::proto::{CertificateRequest, CertificateResponse};
use crate::secrets::Token;

/// A signed identity returned by trustd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedIdentity {
    /// PEM issuing CA
    pub ca: Vec<u8>,
    /// PEM leaf certificate
    pub crt: Vec<u8>,
    /// Endpoint that issued it
    pub endpoint: RemoteEndpoint,
    /// Endpoints that failed before `endpoint` was reached
    pub failover: EndpointErrors,
    /// Poll attempts after the initial submission
    pub polls: u32,
}

/// Obtains a node identity from trustd
///
/// Holds the ordered endpoint list and the shared token; each call to
/// [`issue`](Self::issue) is independent, so one issuer can serve concurrent
/// calls.
pub struct RemoteIdentityIssuer<C> {
    connector: C,
    endpoints: Vec<RemoteEndpoint>,
    token: Token,
    config: IssuerConfig,
}

impl<C> std::fmt::Debug for RemoteIdentityIssuer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdentityIssuer")
            .field("endpoints", &self.endpoints)
            .field("token", &self.token)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Endpoint selected during `SelectEndpoint`
struct Selected<T> {
    client: T,
    endpoint: RemoteEndpoint,
    failover: EndpointErrors,
}

impl<C: TrustConnector> RemoteIdentityIssuer<C> {
    /// Create an issuer over `endpoints`, tried in order
    ///
    /// Fails on an empty endpoint list or timing that cannot be scheduled.
    pub fn new(
        connector: C,
        endpoints: Vec<RemoteEndpoint>,
        token: Token,
        config: IssuerConfig,
    ) -> Result<Self, IssuanceError> {
        if endpoints.is_empty() {
            return Err(IssuanceError::NoEndpoints);
        }
        config.validate()?;
        Ok(Self {
            connector,
            endpoints,
            token,
            config,
        })
    }

    /// Create an issuer from host strings sharing a default port
    ///
    /// Each entry may carry its own port (`host:port`, `[v6]:port`).
    pub fn from_hosts<S: AsRef<str>>(
        connector: C,
        hosts: &[S],
        port: u16,
        token: Token,
        config: IssuerConfig,
    ) -> Result<Self, IssuanceError> {
        if hosts.is_empty() {
            return Err(IssuanceError::NoEndpoints);
        }
        let endpoints = RemoteEndpoint::parse_all(hosts, port)?;
        Self::new(connector, endpoints, token, config)
    }

    /// Endpoints in dial order
    pub fn endpoints(&self) -> &[RemoteEndpoint] {
        &self.endpoints
    }

    /// Submit `csr_pem` once and return whatever trustd answers
    ///
    /// An empty response means the identity is not issued yet. Connection
    /// failover applies; polling does not.
    pub async fn certificate(
        &self,
        csr_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<CertificateResponse, IssuanceError> {
        let start = Instant::now();
        let deadline = offset(start, self.config.deadline, "deadline")?;
        let mut selected = self.select_endpoint(start, deadline, cancel).await?;

        let request = CertificateRequest {
            csr: csr_pem.as_bytes().to_vec(),
        };
        race(
            start,
            deadline,
            cancel,
            selected.client.certificate(request),
        )
        .await?
        .map_err(|source| IssuanceError::Request {
            endpoint: selected.endpoint,
            source,
        })
    }

    /// Run the full issuance state machine for `csr_pem`
    pub async fn issue(
        &self,
        csr_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<IssuedIdentity, IssuanceError> {
        let start = Instant::now();
        let deadline = offset(start, self.config.deadline, "deadline")?;

        let result = self.run(csr_pem, start, deadline, cancel).await;
        match &result {
            Ok(identity) => info!(
                state = %IssuanceState::Issued,
                endpoint = %identity.endpoint,
                polls = identity.polls,
                failed_endpoints = identity.failover.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Node identity issued"
            ),
            Err(e) => warn!(
                state = %e.terminal_state(),
                error = %e,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Node identity issuance failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        csr_pem: &str,
        start: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<IssuedIdentity, IssuanceError> {
        let Selected {
            mut client,
            endpoint,
            failover,
        } = self.select_endpoint(start, deadline, cancel).await?;

        let request = CertificateRequest {
            csr: csr_pem.as_bytes().to_vec(),
        };
        let issued = |response: CertificateResponse, polls: u32| IssuedIdentity {
            ca: response.ca,
            crt: response.crt,
            endpoint: endpoint.clone(),
            failover: failover.clone(),
            polls,
        };

        // The submission may be accepted even when the call reports an error
        match race(start, deadline, cancel, client.certificate(request.clone())).await? {
            Ok(response) if response.is_issued() => return Ok(issued(response, 0)),
            Ok(_) => debug!(endpoint = %endpoint, "CSR submitted, awaiting approval"),
            Err(e) => warn!(
                endpoint = %endpoint,
                error = %e,
                "CSR submission failed, polling anyway"
            ),
        }

        debug!(state = %IssuanceState::Polling, endpoint = %endpoint, "Issuance state");
        let first_poll = offset(Instant::now(), self.config.poll_interval, "poll interval")?;
        let mut ticker = interval_at(first_poll, self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut polls = 0u32;
        loop {
            race(start, deadline, cancel, ticker.tick()).await?;
            polls += 1;

            match race(start, deadline, cancel, client.certificate(request.clone())).await? {
                Ok(response) if response.is_issued() => return Ok(issued(response, polls)),
                Ok(_) => debug!(endpoint = %endpoint, attempt = polls, "Certificate not ready"),
                Err(e) => warn!(
                    endpoint = %endpoint,
                    attempt = polls,
                    error = %e,
                    "Certificate poll failed"
                ),
            }
        }
    }

    /// `SelectEndpoint` and `Connecting`: dial endpoints in order
    async fn select_endpoint(
        &self,
        start: Instant,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Selected<C::Client>, IssuanceError> {
        let mut failover = EndpointErrors::default();

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            debug!(
                state = %IssuanceState::SelectEndpoint,
                candidate = index + 1,
                of = self.endpoints.len(),
                "Issuance state"
            );
            debug!(state = %IssuanceState::Connecting, endpoint = %endpoint, "Issuance state");
            info!(endpoint = %endpoint, "Connecting to trust endpoint");

            match race(
                start,
                deadline,
                cancel,
                self.connector.connect(endpoint, &self.token),
            )
            .await?
            {
                Ok(client) => {
                    return Ok(Selected {
                        client,
                        endpoint: endpoint.clone(),
                        failover,
                    })
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Trust endpoint unreachable, trying next");
                    failover.push(endpoint.clone(), e);
                }
            }
        }

        Err(IssuanceError::EndpointsExhausted(failover))
    }
}

/// Run `fut` unless cancellation or the deadline comes first
async fn race<F: Future>(
    start: Instant,
    deadline: Instant,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, IssuanceError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IssuanceError::Canceled),
        _ = sleep_until(deadline) => Err(IssuanceError::DeadlineExceeded {
            elapsed: start.elapsed(),
        }),
        out = fut => Ok(out),
    }
}
