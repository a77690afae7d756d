// src/transport.rs
//
// Socket factories handed to the connection factory: the shared plain TCP one, or a
// TLS one built from the configured key and trust stores.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::uri::AMQPScheme;
use p12_keystore::KeyStore;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::RootCertStore;
use tracing::{debug, info};

use crate::binder::ConnectionSpec;
use crate::errors::{AutoConfigError, Result};

static PLATFORM_DEFAULT: OnceLock<Arc<PlainSocketFactory>> = OnceLock::new();

/// Plain TCP transport.
#[derive(Debug, Default)]
pub struct PlainSocketFactory;

/// Client identity presented to the broker: a PKCS#12 archive and its password.
///
/// Only built from an archive that opened with the password and holds a private key.
#[derive(Clone)]
pub struct ClientIdentity {
    pub der: Vec<u8>,
    pub password: String,
    subject: String,
}

impl ClientIdentity {
    /// Subject of the leaf certificate paired with the private key.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("subject", &self.subject)
            .field("der_len", &self.der.len())
            .finish_non_exhaustive()
    }
}

/// TLS transport built from the key and trust stores.
///
/// lapin performs the handshake; this holds exactly what it is handed through
/// [`TlsSocketFactory::tls_config`].
#[derive(Debug)]
pub struct TlsSocketFactory {
    cert_chain: Option<String>,
    trusted_certificates: usize,
    identity: Option<ClientIdentity>,
    trust_store: Option<PathBuf>,
    key_store: Option<PathBuf>,
}

impl TlsSocketFactory {
    pub fn trust_store(&self) -> Option<&Path> {
        self.trust_store.as_deref()
    }

    pub fn key_store(&self) -> Option<&Path> {
        self.key_store.as_deref()
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Certificates from the trust store added on top of the platform roots.
    pub fn trusted_certificates(&self) -> usize {
        self.trusted_certificates
    }

    /// TLS settings in the form lapin expects for an `amqps` connection.
    pub fn tls_config(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: self.identity.as_ref().map(|identity| OwnedIdentity {
                der: identity.der.clone(),
                password: identity.password.clone(),
            }),
            cert_chain: self.cert_chain.clone(),
        }
    }
}

/// The transport a connection factory opens sockets with.
#[derive(Debug, Clone)]
pub enum SocketFactory {
    Plain(Arc<PlainSocketFactory>),
    Tls(Arc<TlsSocketFactory>),
}

impl Default for SocketFactory {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl SocketFactory {
    /// The process-wide plain TCP factory; every call hands out the same instance.
    pub fn platform_default() -> Self {
        SocketFactory::Plain(PLATFORM_DEFAULT.get_or_init(Default::default).clone())
    }

    pub fn is_platform_default(&self) -> bool {
        match self {
            SocketFactory::Plain(factory) => PLATFORM_DEFAULT
                .get()
                .is_some_and(|default| Arc::ptr_eq(default, factory)),
            SocketFactory::Tls(_) => false,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, SocketFactory::Tls(_))
    }

    pub fn scheme(&self) -> AMQPScheme {
        match self {
            SocketFactory::Plain(_) => AMQPScheme::AMQP,
            SocketFactory::Tls(_) => AMQPScheme::AMQPS,
        }
    }

    pub fn tls(&self) -> Option<&TlsSocketFactory> {
        match self {
            SocketFactory::Tls(factory) => Some(factory),
            SocketFactory::Plain(_) => None,
        }
    }

    /// Builds the transport for `spec`.
    ///
    /// Without SSL this is the platform default. With SSL every configured store must
    /// exist and open: the key store as PKCS#12 with its password, the trust store as a
    /// PEM bundle of certificates.
    pub fn from_spec(spec: &ConnectionSpec) -> Result<Self> {
        if !spec.use_ssl {
            return Ok(Self::platform_default());
        }

        let identity = match &spec.key_store {
            Some(path) => Some(load_identity(path, spec.key_store_password.as_deref())?),
            None => None,
        };

        let (trusted_certificates, cert_chain) = match &spec.trust_store {
            Some(path) => {
                let (count, pem) = load_trust_store(path)?;
                (count, Some(pem))
            }
            None => (0, None),
        };

        info!(
            trust_store = ?spec.trust_store,
            key_store = ?spec.key_store,
            trusted_certificates,
            "Using TLS socket factory"
        );

        Ok(SocketFactory::Tls(Arc::new(TlsSocketFactory {
            cert_chain,
            trusted_certificates,
            identity,
            trust_store: spec.trust_store.clone(),
            key_store: spec.key_store.clone(),
        })))
    }
}

fn read_store(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => AutoConfigError::missing_store(path),
        _ => AutoConfigError::TransportInitialization {
            path: path.to_path_buf(),
            reason: format!("could not be opened: {}", e),
        },
    })
}

fn load_identity(path: &Path, password: Option<&str>) -> Result<ClientIdentity> {
    let der = read_store(path)?;
    let password = password.unwrap_or_default();
    let invalid = |reason: String| AutoConfigError::TransportInitialization {
        path: path.to_path_buf(),
        reason,
    };

    let key_store = KeyStore::from_pkcs12(&der, password)
        .map_err(|e| invalid(format!("could not be opened as PKCS#12 with the given password: {}", e)))?;
    let (alias, chain) = key_store
        .private_key_chain()
        .ok_or_else(|| invalid("contains no private key".to_string()))?;
    let subject = chain
        .chain()
        .first()
        .map(|cert| cert.subject().to_string())
        .ok_or_else(|| invalid(format!("has no certificate for key '{}'", alias)))?;

    debug!(key_store = %path.display(), %alias, %subject, "Loaded key store");
    Ok(ClientIdentity {
        der,
        password: password.to_string(),
        subject,
    })
}

/// Parses the bundle the same way the connection will and checks every certificate
/// is usable as a trust anchor.
fn load_trust_store(path: &Path) -> Result<(usize, String)> {
    let bytes = read_store(path)?;
    let invalid = |reason: String| AutoConfigError::TransportInitialization {
        path: path.to_path_buf(),
        reason,
    };

    let certs = CertificateDer::pem_slice_iter(&bytes)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| invalid(format!("is not a valid PEM bundle: {}", e)))?;
    if certs.is_empty() {
        return Err(invalid("contains no certificates".to_string()));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| invalid(format!("contains an unusable certificate: {}", e)))?;
    }
    debug!(trust_store = %path.display(), roots = roots.len(), "Loaded trust store");

    let pem = String::from_utf8(bytes).map_err(|e| invalid(format!("is not UTF-8: {}", e)))?;
    Ok((roots.len(), pem))
}
