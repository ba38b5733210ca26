//! TLS configuration utilities for the proxy endpoints

use crate::error::{GatehouseError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Build a rustls server config from a PEM cert/key file pair.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(cert_path.as_ref())
        .map_err(|e| GatehouseError::TlsError(format!("failed to read cert: {}", e)))?;
    let key_pem = std::fs::read(key_path.as_ref())
        .map_err(|e| GatehouseError::TlsError(format!("failed to read key: {}", e)))?;

    let certs = parse_pem_certs(&cert_pem)?;
    if certs.is_empty() {
        return Err(GatehouseError::TlsError(
            "no certificates found in cert file".into(),
        ));
    }
    let key = parse_pem_key(&key_pem)?;

    server_config_from_parts(certs, key)
}

/// Build a rustls server config around a freshly generated self-signed
/// certificate.
pub fn self_signed_server_config(common_name: &str) -> Result<rustls::ServerConfig> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Gatehouse");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        SanType::DnsName(
            common_name
                .try_into()
                .map_err(|e| GatehouseError::TlsError(format!("invalid common name: {}", e)))?,
        ),
        SanType::DnsName(
            "localhost"
                .try_into()
                .map_err(|e| GatehouseError::TlsError(format!("invalid SAN: {}", e)))?,
        ),
    ];

    let key_pair = KeyPair::generate()
        .map_err(|e| GatehouseError::TlsError(format!("failed to generate key pair: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| GatehouseError::TlsError(format!("failed to generate certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| GatehouseError::TlsError(format!("failed to serialize key: {:?}", e)))?;

    server_config_from_parts(vec![cert_der], key_der)
}

fn server_config_from_parts(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatehouseError::TlsError(format!("failed to create server config: {}", e)))
}

/// Create a rustls client config for backend connections. With
/// `skip_verify` the backend's identity is not checked; the connection is
/// still encrypted.
pub fn backend_client_config(skip_verify: bool) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder();

    let config = if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    Ok(config)
}

fn parse_pem_certs(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem_data);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatehouseError::TlsError(format!("failed to parse certificates: {}", e)))?;
    Ok(certs)
}

fn parse_pem_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem_data);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatehouseError::TlsError(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| GatehouseError::TlsError("no private key found".into()))
}

/// Certificate verifier that accepts any certificate. Only reachable via
/// the skip-verify option.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
