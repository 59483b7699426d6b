//! TLS layer using tokio-rustls
//!
//! Wraps the inner stream in a TLS client session. The ClientHello carries
//! the configured server name, which is the profile's SNI override when one
//! is set: the socket still goes to the proxy host, only the handshake
//! parameters change.
//!
//! Certificate verification is opt-in. SNI-fronted endpoints typically
//! present a certificate for a name other than the one dialed, so the default
//! verifier accepts any certificate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::{BoxedStream, Connector, SharedConnector, TlsConfig, TransportError};

/// TLS layer over an inner connector
#[derive(Debug)]
pub struct TlsLayer {
    inner: SharedConnector,
    tls: TlsConfig,
    handshake_timeout: Duration,
    client_config: Arc<ClientConfig>,
}

impl TlsLayer {
    /// Create a TLS layer
    ///
    /// # Errors
    ///
    /// Returns `TransportError::TlsConfigError` if the client configuration
    /// cannot be built.
    pub fn new(
        inner: SharedConnector,
        tls: TlsConfig,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client_config = Self::create_tls_config(&tls)?;
        Ok(Self {
            inner,
            tls,
            handshake_timeout,
            client_config: Arc::new(client_config),
        })
    }

    /// Server name sent in the ClientHello
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.tls.server_name
    }

    /// Create TLS client configuration
    fn create_tls_config(tls_config: &TlsConfig) -> Result<ClientConfig, TransportError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::tls_config(e.to_string()))?;

        let config = if tls_config.verify_certificate {
            let root_store =
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth()
        };

        Ok(config)
    }
}

#[async_trait]
impl Connector for TlsLayer {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let server_name: ServerName<'static> = self
            .tls
            .server_name
            .clone()
            .try_into()
            .map_err(|_| TransportError::invalid_server_name(&self.tls.server_name))?;

        let stream = self.inner.connect().await?;

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let handshake = connector.connect(server_name, stream);
        let tls_stream = timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::timeout(
                    format!("TLS handshake with {}", self.tls.server_name),
                    u64::try_from(self.handshake_timeout.as_millis()).unwrap_or(u64::MAX),
                )
            })?
            .map_err(|e| TransportError::tls_handshake(&self.tls.server_name, e.to_string()))?;

        tracing::debug!(
            server_name = %self.tls.server_name,
            verify = self.tls.verify_certificate,
            "TLS session established"
        );

        Ok(Box::new(tls_stream))
    }

    fn describe(&self) -> String {
        format!("tls(sni={}) -> {}", self.tls.server_name, self.inner.describe())
    }
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
