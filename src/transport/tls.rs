//! TLS wrapping for outbound streams

use crate::config::ProxyConfig;
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Wrap an established TCP stream in TLS, honoring `servername` and
/// `skip-cert-verify`.
pub async fn wrap(stream: TcpStream, config: &ProxyConfig) -> Result<TlsStream<TcpStream>> {
    let connector = create_connector(config.skip_cert_verify);
    let server_name: ServerName<'static> = config
        .server_name()
        .to_string()
        .try_into()
        .map_err(|_| Error::tls(format!("Invalid server name: {}", config.server_name())))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;

    Ok(tls_stream)
}

fn create_connector(skip_cert_verify: bool) -> TlsConnector {
    use rustls::ClientConfig;

    let config = if skip_cert_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .with_root_certificates(root_store())
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

fn root_store() -> rustls::RootCertStore {
    static ROOT_STORE: OnceLock<rustls::RootCertStore> = OnceLock::new();
    ROOT_STORE
        .get_or_init(|| {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            root_store
        })
        .clone()
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
