//! TLS material loading.
//!
//! The client listen address always serves mutual TLS: the server presents
//! its certificate and requires a client certificate signed by the
//! configured client CA. There is no plaintext mode; a server without
//! loadable TLS material refuses to start.

use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::info;

use crate::config::Config;
use crate::error::ServerError;

pub fn load_server_tls(config: &Config) -> Result<ServerTlsConfig, ServerError> {
    let cert_path = config
        .tls_server_cert
        .as_ref()
        .ok_or_else(|| ServerError::Config("tls_server_cert must be set".into()))?;
    let key_path = config
        .tls_server_key
        .as_ref()
        .ok_or_else(|| ServerError::Config("tls_server_key must be set".into()))?;
    let ca_path = config
        .tls_client_ca
        .as_ref()
        .ok_or_else(|| ServerError::Config("tls_client_ca must be set".into()))?;

    let cert = std::fs::read(cert_path)?;
    let key = std::fs::read(key_path)?;
    let ca = std::fs::read(ca_path)?;

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca));
    info!("mutual TLS enabled: client certificates required");

    Ok(tls)
}
