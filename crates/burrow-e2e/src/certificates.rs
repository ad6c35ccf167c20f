//! Test certificate generation using rcgen
//!
//! Clients verify the broker against a throwaway CA, so the TLS path under
//! test is the same one a deployment with a real CA takes.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A CA and a broker certificate it signed
#[derive(Clone)]
pub struct TestCertificates {
    pub ca_cert_pem: String,

    /// Broker certificate PEM, valid for localhost
    pub broker_cert_pem: String,
    pub broker_key_pem: String,
}

impl TestCertificates {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("Failed to generate CA key");

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "Burrow Test CA");
            dn.push(DnType::OrganizationName, "Burrow E2E Tests");
            dn
        };
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .expect("Failed to create CA cert");

        // Consumes ca_key
        let ca_issuer = Issuer::new(ca_params, ca_key);

        let broker_key = KeyPair::generate().expect("Failed to generate broker key");
        let mut broker_params = CertificateParams::default();
        broker_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "localhost");
            dn
        };
        broker_params.subject_alt_names = vec![
            rcgen::SanType::DnsName("localhost".try_into().expect("valid DNS name")),
            rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            rcgen::SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        broker_params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        broker_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let broker_cert = broker_params
            .signed_by(&broker_key, &ca_issuer)
            .expect("Failed to create broker cert");

        Self {
            ca_cert_pem: ca_cert.pem(),
            broker_cert_pem: broker_cert.pem(),
            broker_key_pem: broker_key.serialize_pem(),
        }
    }
}
