//! Certificate, key and trust-anchor loading.
//!
//! Credentials are loaded once at startup; a failure here is fatal to the
//! server. When a trust store is configured, client certificates are
//! required and verified against it.

use crate::config::TlsConfig;
use crate::error::CredentialError;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Material needed to build a server TLS configuration.
#[derive(Debug)]
pub struct Credentials {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    /// Trust anchors for client certificates. `None` disables client auth.
    pub trust_roots: Option<RootCertStore>,
}

/// Source of server credentials.
pub trait CredentialProvider {
    fn credentials(&self) -> Result<Credentials, CredentialError>;
}

/// Credentials stored as PEM files on disk.
#[derive(Debug, Clone)]
pub struct PemFileCredentials {
    cert: PathBuf,
    key: PathBuf,
    trust: Option<PathBuf>,
}

impl PemFileCredentials {
    pub fn new(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            trust: None,
        }
    }

    /// Require client certificates issued by the CAs in `path`.
    pub fn with_trust(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust = Some(path.into());
        self
    }

    pub fn from_config(config: &TlsConfig) -> Self {
        Self {
            cert: config.cert.clone(),
            key: config.key.clone(),
            trust: config.trust.clone(),
        }
    }
}

impl CredentialProvider for PemFileCredentials {
    fn credentials(&self) -> Result<Credentials, CredentialError> {
        let cert_chain = load_certs(&self.cert)?;
        if cert_chain.is_empty() {
            return Err(CredentialError::NoCertificates(display(&self.cert)));
        }

        let private_key =
            PrivateKeyDer::from_pem_file(&self.key).map_err(|e| CredentialError::Read {
                path: display(&self.key),
                message: e.to_string(),
            })?;

        let trust_roots = match &self.trust {
            Some(path) => Some(load_roots(path)?),
            None => None,
        };

        Ok(Credentials {
            cert_chain,
            private_key,
            trust_roots,
        })
    }
}

/// The crypto provider used for every configuration built here.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the server-side rustls configuration.
pub fn server_config(credentials: Credentials) -> Result<Arc<ServerConfig>, CredentialError> {
    let builder =
        ServerConfig::builder_with_provider(crypto_provider()).with_safe_default_protocol_versions()?;

    let builder = match credentials.trust_roots {
        Some(roots) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
                    .build()
                    .map_err(|e| CredentialError::Trust(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder.with_single_cert(credentials.cert_chain, credentials.private_key)?;
    Ok(Arc::new(config))
}

/// Build a client-side rustls configuration trusting `roots`, optionally
/// presenting a client certificate.
pub fn client_config(
    roots: RootCertStore,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> Result<Arc<ClientConfig>, CredentialError> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

    let config = match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let read_err = |e: rustls::pki_types::pem::Error| CredentialError::Read {
        path: display(path),
        message: e.to_string(),
    };
    CertificateDer::pem_file_iter(path)
        .map_err(read_err)?
        .map(|cert| cert.map_err(read_err))
        .collect()
}

fn load_roots(path: &Path) -> Result<RootCertStore, CredentialError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| CredentialError::Trust(format!("{}: {e}", display(path))))?;
    }
    if roots.is_empty() {
        return Err(CredentialError::NoCertificates(display(path)));
    }
    Ok(roots)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPki;
    use rcgen::KeyPair;
    use std::fs;

    fn write_pem_files(dir: &Path, pki: &TestPki) -> (PathBuf, PathBuf, PathBuf) {
        let key = KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        let ca_path = dir.join("ca.crt");
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();
        fs::write(&ca_path, pki.ca_pem()).unwrap();
        (cert_path, key_path, ca_path)
    }

    #[test]
    fn test_load_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let (cert, key, _) = write_pem_files(dir.path(), &pki);

        let creds = PemFileCredentials::new(&cert, &key).credentials().unwrap();
        assert_eq!(creds.cert_chain.len(), 1);
        assert!(creds.trust_roots.is_none());

        server_config(creds).unwrap();
    }

    #[test]
    fn test_load_with_trust_store() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let (cert, key, ca) = write_pem_files(dir.path(), &pki);

        let creds = PemFileCredentials::new(&cert, &key)
            .with_trust(&ca)
            .credentials()
            .unwrap();
        assert_eq!(creds.trust_roots.as_ref().map(|r| r.len()), Some(1));

        server_config(creds).unwrap();
    }

    #[test]
    fn test_missing_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PemFileCredentials::new(dir.path().join("nope.crt"), dir.path().join("nope.key"))
            .credentials()
            .unwrap_err();
        assert!(matches!(err, CredentialError::Read { .. }));
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let (_, key, _) = write_pem_files(dir.path(), &pki);
        let empty = dir.path().join("empty.crt");
        fs::write(&empty, "not a certificate\n").unwrap();

        let err = PemFileCredentials::new(&empty, &key)
            .credentials()
            .unwrap_err();
        assert!(matches!(err, CredentialError::NoCertificates(_)));
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let (cert, _, ca) = write_pem_files(dir.path(), &pki);

        // a certificate is not a private key
        let err = PemFileCredentials::new(&cert, &ca)
            .credentials()
            .unwrap_err();
        assert!(matches!(err, CredentialError::Read { .. }));
    }

    #[test]
    fn test_empty_trust_store_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let (cert, key, _) = write_pem_files(dir.path(), &pki);
        let empty = dir.path().join("empty-ca.crt");
        fs::write(&empty, "").unwrap();

        let err = PemFileCredentials::new(&cert, &key)
            .with_trust(&empty)
            .credentials()
            .unwrap_err();
        assert!(matches!(err, CredentialError::NoCertificates(_)));
    }
}
