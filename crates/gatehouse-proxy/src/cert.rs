//! Listen-side TLS identity.
//!
//! An empty cert path disables client TLS, "*" generates a self-signed
//! certificate, anything else is a PEM cert/key file pair. The handler
//! pulls the current config per accepted connection, so a reload takes
//! effect for new sessions without restarting the listener.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use gatehouse_common::{tls, GatehouseError};
use tracing::info;

enum CertKind {
    Disabled,
    SelfSigned,
    Files { cert: PathBuf, key: PathBuf },
}

pub struct CertSource {
    kind: CertKind,
    current: RwLock<Option<Arc<rustls::ServerConfig>>>,
}

impl CertSource {
    pub fn from_options(listen_cert: &str, listen_key: &str) -> Result<Self, GatehouseError> {
        if listen_cert.is_empty() != listen_key.is_empty() {
            return Err(GatehouseError::ConfigError(
                "must specify either both or neither of cert and key".into(),
            ));
        }

        let kind = match listen_cert {
            "" => CertKind::Disabled,
            "*" => CertKind::SelfSigned,
            _ => CertKind::Files {
                cert: PathBuf::from(listen_cert),
                key: PathBuf::from(listen_key),
            },
        };

        let source = Self {
            kind,
            current: RwLock::new(None),
        };
        source.reload()?;
        Ok(source)
    }

    /// The TLS config to offer the next accepted connection, if any.
    pub fn server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.current.read().unwrap().clone()
    }

    /// Re-read (or regenerate) the certificate. Existing sessions keep
    /// their handshake; new sessions pick up the result.
    pub fn reload(&self) -> Result<(), GatehouseError> {
        let config = match &self.kind {
            CertKind::Disabled => None,
            CertKind::SelfSigned => {
                info!("generating self-signed listener certificate");
                Some(Arc::new(tls::self_signed_server_config("gatehouse")?))
            }
            CertKind::Files { cert, key } => {
                info!("loading listener certificate from {}", cert.display());
                Some(Arc::new(tls::load_server_config(cert, key)?))
            }
        };
        *self.current.write().unwrap() = config;
        Ok(())
    }
}
