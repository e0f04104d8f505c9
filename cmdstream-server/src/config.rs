//! Server configuration
//!
//! This module provides configuration options for the server.

use crate::error::ServerError;
use crate::handler::LostConnCallback;
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "tls-transport")]
use cmdstream_core::Error;
#[cfg(feature = "tls-transport")]
use rustls::{Certificate as RustlsCert, PrivateKey as RustlsKey, ServerConfig as RustlsServerConfig};
#[cfg(feature = "tls-transport")]
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
#[cfg(feature = "tls-transport")]
use std::sync::Arc;

/// Default number of workers
pub const DEFAULT_WORKERS: usize = 8;

/// Default period of the receiver's timed accept
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

pub use cmdstream_core::DEFAULT_HANDSHAKE_TIMEOUT;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Number of workers, which is also the dispatch queue capacity
    pub workers: usize,
    /// How long a single accept waits before the receiver rechecks for a
    /// stop request
    pub accept_timeout: Duration,
    /// Bound on a single TLS handshake
    pub handshake_timeout: Duration,
    /// TLS configuration used by `listen_and_serve`
    pub tls: Option<TlsConfig>,
    /// Called once for every connection whose delegate failed
    pub lost_conn_callback: Option<LostConnCallback>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tls: None,
            lost_conn_callback: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("workers", &self.workers)
            .field("accept_timeout", &self.accept_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tls", &self.tls)
            .field("has_lost_conn_callback", &self.lost_conn_callback.is_some())
            .finish()
    }
}

impl ServerConfig {
    /// Validate the configuration
    ///
    /// A zero worker count is not rejected here; `serve` reports it as
    /// [`ServerError::NoWorkers`].
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.accept_timeout.is_zero() {
            return Err(ServerError::Config(
                "accept_timeout must be greater than 0".to_string(),
            ));
        }

        if self.handshake_timeout.is_zero() {
            return Err(ServerError::Config(
                "handshake_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// TLS configuration
#[derive(Clone)]
pub enum TlsConfig {
    /// PEM encoded certificate chain and private key files
    Pem {
        /// Path to the certificate chain file
        cert_file: PathBuf,
        /// Path to the private key file (PKCS#8 or RSA)
        key_file: PathBuf,
    },
    /// Ready rustls server configuration
    #[cfg(feature = "tls-transport")]
    Rustls(Arc<RustlsServerConfig>),
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfig::Pem {
                cert_file,
                key_file,
            } => f
                .debug_struct("Pem")
                .field("cert_file", cert_file)
                .field("key_file", key_file)
                .finish(),
            #[cfg(feature = "tls-transport")]
            TlsConfig::Rustls(_) => f.write_str("Rustls(<ServerConfig>)"),
        }
    }
}

impl TlsConfig {
    /// Create a configuration from PEM files
    pub fn pem(cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        TlsConfig::Pem {
            cert_file: cert_file.into(),
            key_file: key_file.into(),
        }
    }

    /// Build the rustls server configuration
    #[cfg(feature = "tls-transport")]
    pub fn build(&self) -> cmdstream_core::Result<Arc<RustlsServerConfig>> {
        match self {
            TlsConfig::Pem {
                cert_file,
                key_file,
            } => {
                let certs = load_certs(cert_file)?;
                let key = load_private_key(key_file)?;

                let config = RustlsServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| Error::Config(format!("Invalid TLS certificate/key: {}", e)))?;
                Ok(Arc::new(config))
            }
            TlsConfig::Rustls(config) => Ok(config.clone()),
        }
    }
}

#[cfg(feature = "tls-transport")]
fn read_pem(path: &std::path::Path, what: &str) -> cmdstream_core::Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        Error::Config(format!(
            "Failed to open {} file {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

#[cfg(feature = "tls-transport")]
fn load_certs(path: &std::path::Path) -> cmdstream_core::Result<Vec<RustlsCert>> {
    let pem = read_pem(path, "certificate")?;
    let cert_vec = certs(&mut pem.as_slice()).map_err(|e| {
        Error::Config(format!(
            "Failed to parse certificate file {}: {}",
            path.display(),
            e
        ))
    })?;

    if cert_vec.is_empty() {
        return Err(Error::Config(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(cert_vec.into_iter().map(RustlsCert).collect())
}

#[cfg(feature = "tls-transport")]
fn load_private_key(path: &std::path::Path) -> cmdstream_core::Result<RustlsKey> {
    let pem = read_pem(path, "private key")?;

    if let Ok(keys) = pkcs8_private_keys(&mut pem.as_slice()) {
        if let Some(key) = keys.into_iter().next() {
            return Ok(RustlsKey(key));
        }
    }

    let keys = rsa_private_keys(&mut pem.as_slice()).map_err(|e| {
        Error::Config(format!(
            "Failed to parse private key file {}: {}",
            path.display(),
            e
        ))
    })?;

    keys.into_iter()
        .next()
        .map(RustlsKey)
        .ok_or_else(|| Error::Config(format!("No private keys found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 8);
        assert_eq!(config.accept_timeout, Duration::from_secs(1));
        assert!(config.tls.is_none());
        assert!(config.lost_conn_callback.is_none());
    }

    #[cfg(feature = "tls-transport")]
    #[test]
    fn test_handshake_timeout_matches_tls_listener() {
        assert_eq!(
            ServerConfig::default().handshake_timeout,
            cmdstream_transport_tls::DEFAULT_HANDSHAKE_TIMEOUT
        );
    }

    #[test]
    fn test_server_config_validation() {
        let mut config = ServerConfig {
            accept_timeout: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));

        config.accept_timeout = Duration::from_millis(100);
        config.handshake_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config.handshake_timeout = Duration::from_secs(1);
        config.workers = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_config_debug_shows_paths() {
        let config = TlsConfig::pem("cert.pem", "key.pem");
        let debug = format!("{:?}", config);
        assert!(debug.contains("cert.pem"));
        assert!(debug.contains("key.pem"));
    }

    #[cfg(feature = "tls-transport")]
    mod tls {
        use super::*;
        use std::io::Write;

        fn write_temp(contents: &str) -> tempfile::NamedTempFile {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            file
        }

        #[test]
        fn test_build_from_pem_files() {
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let cert_file = write_temp(&cert.serialize_pem().unwrap());
            let key_file = write_temp(&cert.serialize_private_key_pem());

            let config = TlsConfig::pem(cert_file.path(), key_file.path());
            assert!(config.build().is_ok());
        }

        #[test]
        fn test_missing_file_is_config_error() {
            let config = TlsConfig::pem("/nonexistent/cert.pem", "/nonexistent/key.pem");
            let err = config.build().unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains("certificate"));
        }

        #[test]
        fn test_key_file_without_keys_is_rejected() {
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let cert_pem = cert.serialize_pem().unwrap();
            let cert_file = write_temp(&cert_pem);
            let key_file = write_temp(&cert_pem);

            let err = TlsConfig::pem(cert_file.path(), key_file.path())
                .build()
                .unwrap_err();
            assert!(err.to_string().contains("No private keys"));
        }
    }
}
