//! TLS client configuration for the broker session
//!
//! Built once at startup; any failure here is fatal. Uses the rustls
//! version re-exported by rumqttc so the config type matches its transport.

use crate::config::{TlsSection, TlsVersion};
use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, ServerName, UnixTime,
};
use rumqttc::tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("system trust store has no usable certificates")]
    EmptyTrustStore,
    #[error("rejected certificate: {0}")]
    InvalidCertificate(String),
    #[error("client certificate and key must be configured together")]
    IncompleteClientAuth,
    #[error("invalid client identity: {0}")]
    ClientAuth(String),
}

/// Build the rumqttc transport for a TLS-enabled session
pub fn build_tls_transport(section: &TlsSection) -> Result<RumqttcTransport, TlsSetupError> {
    let config = build_client_config(section)?;
    Ok(RumqttcTransport::tls_with_config(TlsConfiguration::Rustls(
        Arc::new(config),
    )))
}

/// Build the rustls client config from the TLS section
pub fn build_client_config(section: &TlsSection) -> Result<ClientConfig, TlsSetupError> {
    let versions: &[&'static rustls::SupportedProtocolVersion] = match section.version {
        TlsVersion::Tls12 => &[&rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
        TlsVersion::Auto => rustls::ALL_VERSIONS,
    };
    let builder = ClientConfig::builder_with_protocol_versions(versions);

    let builder = if section.insecure {
        warn!("TLS certificate and hostname verification is DISABLED (insecure mode)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        builder.with_root_certificates(load_root_store(section.ca_cert_path.as_deref())?)
    };

    match (&section.client_cert_path, &section.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsSetupError::ClientAuth(e.to_string()))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TlsSetupError::IncompleteClientAuth),
    }
}

fn load_root_store(ca_path: Option<&Path>) -> Result<RootCertStore, TlsSetupError> {
    let mut store = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in load_certificates(path)? {
                store
                    .add(cert)
                    .map_err(|e| TlsSetupError::InvalidCertificate(e.to_string()))?;
            }
            debug!(ca = %path.display(), roots = store.len(), "Loaded CA bundle");
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!("Skipping unreadable system certificate source: {}", error);
            }
            let (added, ignored) = store.add_parsable_certificates(native.certs);
            if ignored > 0 {
                debug!(ignored, "Ignored unparsable system certificates");
            }
            if added == 0 {
                return Err(TlsSetupError::EmptyTrustStore);
            }
            debug!(roots = added, "Loaded system trust store");
        }
    }
    Ok(store)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsSetupError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.to_path_buf()))
}

/// Accepts any server certificate. Only installed when `insecure = true`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_insecure_config_builds_without_roots() {
        let section = TlsSection {
            enabled: true,
            insecure: true,
            version: TlsVersion::Tls12,
            ..Default::default()
        };

        assert!(build_client_config(&section).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_fatal() {
        let section = TlsSection {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };

        assert!(matches!(
            build_client_config(&section),
            Err(TlsSetupError::Read { .. })
        ));
    }

    #[test]
    fn test_ca_file_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let section = TlsSection {
            enabled: true,
            ca_cert_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };

        assert!(matches!(
            build_client_config(&section),
            Err(TlsSetupError::NoCertificates(_))
        ));
    }

    #[test]
    fn test_half_configured_client_auth_is_rejected() {
        let section = TlsSection {
            enabled: true,
            insecure: true,
            client_cert_path: Some(PathBuf::from("/tmp/client.pem")),
            ..Default::default()
        };

        assert!(matches!(
            build_client_config(&section),
            Err(TlsSetupError::IncompleteClientAuth)
        ));
    }
}
