use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::TunnelError;

/// PEM-encoded certificate and key the broker presents over TLS
#[derive(Clone)]
pub struct BrokerIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl BrokerIdentity {
    /// Mint a self-signed identity valid for the given names.
    ///
    /// Used when the broker is started without a configured certificate.
    /// The identity lives only as long as the process.
    pub fn generate(subject_alt_names: &[String]) -> Result<Self, TunnelError> {
        let key_pair = KeyPair::generate()
            .map_err(|e| TunnelError::Certificate(format!("Failed to generate key: {}", e)))?;

        let mut params = CertificateParams::new(subject_alt_names.to_vec())
            .map_err(|e| TunnelError::Certificate(format!("Invalid subject name: {}", e)))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "burrow broker");
        params.distinguished_name = dn;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            TunnelError::Certificate(format!("Failed to self-sign certificate: {}", e))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

impl std::fmt::Debug for BrokerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerIdentity")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_produces_pem() {
        let identity =
            BrokerIdentity::generate(&["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        assert!(identity.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(identity.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_debug_hides_key() {
        let identity = BrokerIdentity::generate(&["localhost".to_string()]).unwrap();
        let printed = format!("{:?}", identity);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("PRIVATE KEY"));
    }
}
