//! tonic transport for trustd

use std::time::Duration;

use async_trait::async_trait;
use tonic::codegen::InterceptedService;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use super::{IssuerConfig, RemoteEndpoint, TransportError, TrustClient, TrustConnector};
use crate::proto::{CertificateRequest, CertificateResponse, SecurityServiceClient, TokenAuth};
use crate::secrets::Token;

/// Dials trustd over gRPC, with TLS when a CA certificate is configured
///
/// There is no client identity at this stage; the token is the only
/// credential.
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    rpc_timeout: Duration,
    ca_cert_pem: Option<String>,
    domain_name: Option<String>,
}

impl GrpcConnector {
    /// Plaintext connector using the issuer's timeouts
    pub fn new(config: &IssuerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            rpc_timeout: config.rpc_timeout,
            ca_cert_pem: None,
            domain_name: None,
        }
    }

    /// Verify trustd against `ca_cert_pem` over TLS
    pub fn with_ca_certificate(mut self, ca_cert_pem: impl Into<String>) -> Self {
        self.ca_cert_pem = Some(ca_cert_pem.into());
        self
    }

    /// Override the TLS server name (defaults to the endpoint host)
    pub fn with_domain_name(mut self, domain_name: impl Into<String>) -> Self {
        self.domain_name = Some(domain_name.into());
        self
    }

    fn endpoint(&self, endpoint: &RemoteEndpoint) -> Result<Endpoint, TransportError> {
        let uri = endpoint.uri(self.ca_cert_pem.is_some());
        let mut channel = Endpoint::from_shared(uri)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.rpc_timeout);

        if let Some(ca) = &self.ca_cert_pem {
            let domain = self.domain_name.as_deref().unwrap_or(&endpoint.host);
            let tls = ClientTlsConfig::new()
                .ca_certificate(Certificate::from_pem(ca))
                .domain_name(domain);
            channel = channel
                .tls_config(tls)
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        }

        Ok(channel)
    }
}

/// Connected trustd client
#[derive(Debug, Clone)]
pub struct GrpcClient {
    inner: SecurityServiceClient<InterceptedService<Channel, TokenAuth>>,
}

#[async_trait]
impl TrustConnector for GrpcConnector {
    type Client = GrpcClient;

    async fn connect(
        &self,
        endpoint: &RemoteEndpoint,
        token: &Token,
    ) -> Result<GrpcClient, TransportError> {
        let auth = TokenAuth::new(token).map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = self
            .endpoint(endpoint)?
            .connect()
            .await
            .map_err(|e| TransportError::Connect(format_transport_error(&e)))?;

        debug!(endpoint = %endpoint, "Connected to trust endpoint");
        Ok(GrpcClient {
            inner: SecurityServiceClient::with_interceptor(channel, auth),
        })
    }
}

#[async_trait]
impl TrustClient for GrpcClient {
    async fn certificate(
        &mut self,
        request: CertificateRequest,
    ) -> Result<CertificateResponse, TransportError> {
        self.inner
            .certificate(request)
            .await
            .map(tonic::Response::into_inner)
            .map_err(|status| TransportError::Rpc(status.to_string()))
    }
}

/// tonic's transport error hides the useful part in its source chain
fn format_transport_error(err: &tonic::transport::Error) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_endpoint_uses_http() {
        let connector = GrpcConnector::new(&IssuerConfig::default());
        let endpoint = connector
            .endpoint(&RemoteEndpoint::new("10.0.0.1", 50001))
            .unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().host(), Some("10.0.0.1"));
        assert_eq!(endpoint.uri().port_u16(), Some(50001));
    }

    /// Story: nothing listens on the trust port, the dial fails fast
    #[tokio::test]
    async fn story_closed_port_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = GrpcConnector::new(&IssuerConfig {
            connect_timeout: Duration::from_secs(2),
            ..IssuerConfig::default()
        });
        let result = connector
            .connect(
                &RemoteEndpoint::new("127.0.0.1", port),
                &Token::new("abcdef.0123456789abcdef"),
            )
            .await;

        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    // ==========================================================================
    // Integration Tests: Real gRPC Server
    // ==========================================================================

    use crate::proto::{SecurityService, SecurityServiceServer, TOKEN_METADATA_KEY};
    use crate::trustd::RemoteIdentityIssuer;
    use tokio_util::sync::CancellationToken;
    use tonic::{Request, Response, Status};

    const TOKEN: &str = "abcdef.0123456789abcdef";

    /// trustd stand-in: checks the token and echoes the CSR back as the leaf
    struct EchoTrustd;

    #[tonic::async_trait]
    impl SecurityService for EchoTrustd {
        async fn certificate(
            &self,
            request: Request<CertificateRequest>,
        ) -> Result<Response<CertificateResponse>, Status> {
            let presented = request
                .metadata()
                .get(TOKEN_METADATA_KEY)
                .and_then(|v| v.to_str().ok());
            if presented != Some(TOKEN) {
                return Err(Status::unauthenticated("invalid token"));
            }

            Ok(Response::new(CertificateResponse {
                ca: b"CA PEM".to_vec(),
                crt: request.into_inner().csr,
            }))
        }
    }

    async fn start_trustd() -> (RemoteEndpoint, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(SecurityServiceServer::new(EchoTrustd))
                .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        (RemoteEndpoint::new("127.0.0.1", addr.port()), handle)
    }

    /// Integration test: the token reaches trustd in call metadata
    #[tokio::test]
    async fn integration_token_is_sent_with_every_call() {
        let (endpoint, server) = start_trustd().await;
        let connector = GrpcConnector::new(&IssuerConfig::default());

        let mut client = connector
            .connect(&endpoint, &Token::new(TOKEN))
            .await
            .unwrap();
        for _ in 0..2 {
            let response = client
                .certificate(CertificateRequest {
                    csr: b"CSR PEM".to_vec(),
                })
                .await
                .unwrap();
            assert_eq!(response.crt, b"CSR PEM");
        }

        server.abort();
    }

    #[tokio::test]
    async fn integration_wrong_token_is_rejected_by_server() {
        let (endpoint, server) = start_trustd().await;
        let connector = GrpcConnector::new(&IssuerConfig::default());

        let mut client = connector
            .connect(&endpoint, &Token::new("zzzzzz.zzzzzzzzzzzzzzzz"))
            .await
            .unwrap();
        let err = client
            .certificate(CertificateRequest {
                csr: b"CSR PEM".to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rpc(ref msg) if msg.contains("invalid token")));

        server.abort();
    }

    /// Integration test: full issuance over the wire with the first endpoint down
    #[tokio::test]
    async fn integration_issuer_fails_over_to_live_server() {
        let (live, server) = start_trustd().await;
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            RemoteEndpoint::new("127.0.0.1", listener.local_addr().unwrap().port())
        };

        let config = IssuerConfig {
            connect_timeout: Duration::from_secs(2),
            ..IssuerConfig::default()
        };
        let issuer = RemoteIdentityIssuer::new(
            GrpcConnector::new(&config),
            vec![dead.clone(), live.clone()],
            Token::new(TOKEN),
            config,
        )
        .unwrap();

        let identity = issuer
            .issue("CSR PEM", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(identity.endpoint, live);
        assert_eq!(identity.polls, 0);
        assert_eq!(identity.crt, b"CSR PEM");
        assert_eq!(identity.failover.causes()[0].endpoint, dead);

        server.abort();
    }
}
