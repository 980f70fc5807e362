// Shared transport configuration for building reqwest::Client instances
// and the WebSocket upgrade.
//
// The lamp-control client, the fallback sync client, and the push channel
// share TLS, timeout, and bearer-token settings through this module.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore, SignatureScheme,
    WantsVerifier,
};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::Connector;

use crate::error::Error;

const USER_AGENT: &str = concat!("guidelight/", env!("CARGO_PKG_VERSION"));

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (lab backends with self-signed certs).
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
    /// Bearer token sent as `Authorization` on every request.
    pub api_token: Option<SecretString>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(10),
            api_token: None,
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(headers) = self.auth_headers()? {
            builder = builder.default_headers(headers);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Set the bearer token.
    pub fn with_api_token(mut self, token: SecretString) -> Self {
        self.api_token = Some(token);
        self
    }

    /// TLS connector for the WebSocket upgrade.
    ///
    /// `None` leaves tungstenite on its bundled webpki roots, which is what
    /// [`TlsMode::System`] means for the push channel.
    pub fn websocket_connector(&self) -> Result<Option<Connector>, Error> {
        let config = match &self.tls {
            TlsMode::System => return Ok(None),
            TlsMode::CustomCa(path) => rustls_builder(ring_provider())?
                .with_root_certificates(load_ca_roots(path)?)
                .with_no_client_auth(),
            TlsMode::DangerAcceptInvalid => {
                let provider = ring_provider();
                rustls_builder(Arc::clone(&provider))?
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { provider }))
                    .with_no_client_auth()
            }
        };
        Ok(Some(Connector::Rustls(Arc::new(config))))
    }

    /// `Authorization` value for requests that cannot take a `HeaderMap`,
    /// such as the WebSocket upgrade.
    pub(crate) fn authorization(&self) -> Result<Option<SecretString>, Error> {
        let Some(headers) = self.auth_headers()? else {
            return Ok(None);
        };
        Ok(headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| SecretString::from(v.to_owned())))
    }

    fn auth_headers(&self) -> Result<Option<HeaderMap>, Error> {
        let Some(ref token) = self.api_token else {
            return Ok(None);
        };
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|_| Error::Authentication {
                message: "API token contains characters not allowed in a header".into(),
            })?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(Some(headers))
    }
}

fn ring_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn rustls_builder(
    provider: Arc<CryptoProvider>,
) -> Result<ConfigBuilder<ClientConfig, WantsVerifier>, Error> {
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("no usable TLS protocol version: {e}")))
}

fn load_ca_roots(path: &Path) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
    for cert in certs {
        let cert = cert.map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Skips chain and hostname checks but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_is_sensitive() {
        let config = TransportConfig::default().with_api_token(SecretString::from("s3cret".to_string()));
        let headers = config.auth_headers().unwrap().unwrap();
        let value = headers.get(AUTHORIZATION).unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().unwrap(), "Bearer s3cret");
    }

    #[test]
    fn no_token_means_no_headers() {
        assert!(TransportConfig::default().auth_headers().unwrap().is_none());
    }

    #[test]
    fn rejects_token_with_newline() {
        let config = TransportConfig::default().with_api_token(SecretString::from("bad\ntoken".to_string()));
        assert!(matches!(
            config.auth_headers(),
            Err(Error::Authentication { .. })
        ));
    }

    #[test]
    fn authorization_carries_bearer_for_websocket() {
        let config = TransportConfig::default().with_api_token(SecretString::from("s3cret".to_string()));
        let value = config.authorization().unwrap().unwrap();
        assert_eq!(value.expose_secret(), "Bearer s3cret");
        assert!(TransportConfig::default().authorization().unwrap().is_none());
    }

    #[test]
    fn system_tls_uses_default_websocket_connector() {
        assert!(TransportConfig::default().websocket_connector().unwrap().is_none());
    }

    #[test]
    fn accept_invalid_builds_rustls_connector() {
        let config = TransportConfig {
            tls: TlsMode::DangerAcceptInvalid,
            ..TransportConfig::default()
        };
        assert!(matches!(
            config.websocket_connector().unwrap(),
            Some(Connector::Rustls(_))
        ));
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            tls: TlsMode::CustomCa(dir.path().join("absent.pem")),
            ..TransportConfig::default()
        };
        assert!(matches!(config.websocket_connector(), Err(Error::Tls(_))));
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();
        let config = TransportConfig {
            tls: TlsMode::CustomCa(path),
            ..TransportConfig::default()
        };
        assert!(matches!(config.websocket_connector(), Err(Error::Tls(_))));
    }
}
