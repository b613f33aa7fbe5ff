//! TLS client configuration with ALPN
//!
//! Certificates are verified against the bundled web PKI roots unless the
//! connector is built insecure (self-signed load targets).

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use surge_core::SurgeError;

/// Application protocol offered during the handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alpn {
    Http1,
    H2,
}

impl Alpn {
    pub fn id(&self) -> &'static [u8] {
        match self {
            Self::Http1 => b"http/1.1",
            Self::H2 => b"h2",
        }
    }
}

/// Builds TLS sessions for pools
#[derive(Clone)]
pub struct TlsConnector {
    http1: tokio_rustls::TlsConnector,
    h2: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(insecure: bool) -> Result<Self, SurgeError> {
        Ok(Self {
            http1: client_config(insecure, Alpn::Http1)?,
            h2: client_config(insecure, Alpn::H2)?,
        })
    }

    /// Run the handshake over an established TCP stream
    pub async fn connect(
        &self,
        alpn: Alpn,
        host: &str,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>, SurgeError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| SurgeError::Connect(format!("invalid server name {host}: {e}")))?;
        let connector = match alpn {
            Alpn::Http1 => &self.http1,
            Alpn::H2 => &self.h2,
        };
        connector
            .connect(name, tcp)
            .await
            .map_err(|e| SurgeError::Connect(format!("TLS handshake with {host}: {e}")))
    }
}

fn client_config(insecure: bool, alpn: Alpn) -> Result<tokio_rustls::TlsConnector, SurgeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| SurgeError::Internal(format!("TLS config: {e}")))?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth()
    } else {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![alpn.id().to_vec()];
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

/// Skips certificate checks but still validates handshake signatures
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectors_build() {
        assert!(TlsConnector::new(false).is_ok());
        assert!(TlsConnector::new(true).is_ok());
        assert_eq!(Alpn::H2.id(), b"h2");
    }
}
