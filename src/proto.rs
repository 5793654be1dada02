//! gRPC protocol definitions for the node identity trust service
//!
//! This module contains the generated Protobuf and gRPC code for
//! `securityapi.SecurityService` (see `proto/security.proto`), plus the
//! interceptor that authenticates every call.
//!
//! # Protocol Overview
//!
//! A joining node sends its PEM CSR in a [`CertificateRequest`]. The service
//! answers with a [`CertificateResponse`]: both fields set once the identity
//! has been issued, both empty while approval is pending. Repeating the same
//! request is idempotent.
//!
//! Every call carries the shared trustd token in the `token` metadata entry,
//! attached by [`TokenAuth`].
//!
//! # Example
//!
//! ```ignore
//! use nodetrust::proto::{CertificateRequest, SecurityServiceClient, TokenAuth};
//!
//! let channel = Endpoint::from_static("http://10.0.0.1:50001").connect().await?;
//! let auth = TokenAuth::new(&token)?;
//! let mut client = SecurityServiceClient::with_interceptor(channel, auth);
//!
//! let response = client
//!     .certificate(CertificateRequest { csr: csr_pem.into_bytes() })
//!     .await?
//!     .into_inner();
//! ```

#![allow(missing_docs)] // Generated code doesn't have docs

use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::secrets::Token;

/// Generated protobuf and gRPC code for the trust service
pub mod securityapi {
    tonic::include_proto!("securityapi");
}

// Re-export commonly used types at the module level for convenience
pub use securityapi::security_service_client::SecurityServiceClient;
pub use securityapi::security_service_server::{SecurityService, SecurityServiceServer};
pub use securityapi::*;

/// Metadata key carrying the trustd token
pub const TOKEN_METADATA_KEY: &str = "token";

impl CertificateResponse {
    /// Both the CA and the leaf are present
    pub fn is_issued(&self) -> bool {
        !self.ca.is_empty() && !self.crt.is_empty()
    }
}

/// Interceptor attaching the trustd token to every call
#[derive(Clone)]
pub struct TokenAuth {
    value: MetadataValue<Ascii>,
}

impl TokenAuth {
    /// Fails if the token is not valid ASCII metadata
    pub fn new(token: &Token) -> Result<Self, Status> {
        let value = token
            .as_str()
            .parse::<MetadataValue<Ascii>>()
            .map_err(|_| Status::unauthenticated("token is not valid metadata"))?;
        Ok(Self { value })
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth").finish_non_exhaustive()
    }
}

impl Interceptor for TokenAuth {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert(TOKEN_METADATA_KEY, self.value.clone());
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn empty_response_is_not_issued() {
        assert!(!CertificateResponse::default().is_issued());
        assert!(!CertificateResponse {
            ca: b"ca".to_vec(),
            crt: Vec::new(),
        }
        .is_issued());
        assert!(CertificateResponse {
            ca: b"ca".to_vec(),
            crt: b"crt".to_vec(),
        }
        .is_issued());
    }

    #[test]
    fn request_uses_field_one() {
        let encoded = CertificateRequest {
            csr: b"csr".to_vec(),
        }
        .encode_to_vec();

        // tag 1, wire type 2 (length-delimited), length 3
        assert_eq!(encoded, vec![0x0a, 0x03, b'c', b's', b'r']);
    }

    #[test]
    fn token_auth_attaches_metadata() {
        let mut auth = TokenAuth::new(&Token::new("abcdef.0123456789abcdef")).unwrap();
        let request = auth.call(Request::new(())).unwrap();

        assert_eq!(
            request.metadata().get(TOKEN_METADATA_KEY).unwrap(),
            "abcdef.0123456789abcdef"
        );
    }

    #[test]
    fn token_auth_rejects_non_ascii_token() {
        assert!(TokenAuth::new(&Token::new("bad\ntoken")).is_err());
    }

    #[test]
    fn token_auth_debug_hides_value() {
        let auth = TokenAuth::new(&Token::new("abcdef.0123456789abcdef")).unwrap();
        assert!(!format!("{:?}", auth).contains("0123456789abcdef"));
    }
}
