//! TLS client context for the relay connection.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::info;

use super::config::TunnelConfig;
use super::error::TunnelError;

/// Build the TLS connector for the configured trust model.
///
/// With a CA path set the relay certificate is verified against that
/// anchor; otherwise verification is explicitly disabled (the daemon
/// dials a single well-known relay and treats reachability as the
/// priority, see [`TunnelConfig::insecure_skip_verify`]).
pub fn build_connector(config: &TunnelConfig) -> Result<TlsConnector, TunnelError> {
    // Ensure a process-wide crypto provider is installed; `Err` just
    // means another component got there first.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let client_config = if let Some(ca_path) = &config.relay_ca_cert {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TunnelError::Tls(format!("failed to add CA cert: {e}")))?;
        }
        info!(ca_cert = %ca_path.display(), "Relay TLS pinned to CA certificate");
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        if !config.insecure_skip_verify {
            return Err(TunnelError::Tls(
                "certificate verification requested but no CA certificate configured".into(),
            ));
        }
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TunnelError::Tls(format!("failed to open cert file {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(std::result::Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(TunnelError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Accepts any relay certificate. The deliberate default trust model:
/// one fixed relay endpoint, no chain validation.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_config() -> TunnelConfig {
        let mut config = TunnelConfig::new("relay.test".into(), 9999, "1.0".into());
        config.reconnect_delay = Duration::from_millis(10);
        config
    }

    #[test]
    fn insecure_connector_builds() {
        assert!(build_connector(&test_config()).is_ok());
    }

    #[test]
    fn verification_without_anchor_is_rejected() {
        let mut config = test_config();
        config.insecure_skip_verify = false;
        assert!(build_connector(&config).is_err());
    }

    #[test]
    fn missing_ca_file_fails() {
        let mut config = test_config();
        config.relay_ca_cert = Some("/nonexistent/ca.pem".into());
        assert!(build_connector(&config).is_err());
    }

    #[test]
    fn ca_pinned_connector_builds() {
        let cert = rcgen::generate_simple_self_signed(vec!["relay.test".into()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, cert.cert.pem()).unwrap();

        let mut config = test_config();
        config.relay_ca_cert = Some(path);
        config.insecure_skip_verify = false;
        assert!(build_connector(&config).is_ok());
    }
}
