use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::sync::Arc;

use crate::TunnelError;

/// The process-wide provider if one was installed, ring otherwise
fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let certs = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TunnelError::Certificate(
            "No certificates found in PEM content".to_string(),
        ));
    }
    Ok(certs)
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TunnelError::Certificate("No private key found in PEM content".to_string()))
}

fn load_root_store_from_pem(pem_content: &str) -> Result<RootCertStore, TunnelError> {
    let ca_certs = load_certs_from_pem(pem_content)?;
    let mut root_store = RootCertStore::empty();
    for cert in ca_certs {
        root_store.add(cert).map_err(|e| {
            TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

/// Load the broker's TLS config.
///
/// Clients authenticate with the shared token after the handshake, so no
/// client certificate is requested.
pub fn load_server_config(cert_pem: &str, key_pem: &str) -> Result<ServerConfig, TunnelError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;

    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(format!("Failed to select protocol versions: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build server config: {}", e)))?;

    Ok(config)
}

/// Load the client's TLS config.
///
/// With a CA the broker certificate is verified against it. Without one any
/// broker certificate is accepted, matching brokers that mint an ephemeral
/// identity at startup.
pub fn load_client_config(ca_pem: Option<&str>) -> Result<ClientConfig, TunnelError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(format!("Failed to select protocol versions: {}", e)))?;

    let config = match ca_pem {
        Some(ca_pem) => builder
            .with_root_certificates(load_root_store_from_pem(ca_pem)?)
            .with_no_client_auth(),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                algorithms: provider.signature_verification_algorithms,
            }))
            .with_no_client_auth(),
    };

    Ok(config)
}

/// Skips chain and name checks but still verifies handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BrokerIdentity;

    #[test]
    fn test_server_config_from_generated_identity() {
        let identity = BrokerIdentity::generate(&["localhost".to_string()]).unwrap();
        let config = load_server_config(&identity.cert_pem, &identity.key_pem);
        assert!(config.is_ok());
    }

    #[test]
    fn test_client_config_with_and_without_ca() {
        let identity = BrokerIdentity::generate(&["localhost".to_string()]).unwrap();
        assert!(load_client_config(Some(&identity.cert_pem)).is_ok());
        assert!(load_client_config(None).is_ok());
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let err = load_certs_from_pem("not a certificate").unwrap_err();
        assert!(matches!(err, TunnelError::Certificate(_)));

        let err = load_private_key_from_pem("not a key").unwrap_err();
        assert!(matches!(err, TunnelError::Certificate(_)));
    }
}
