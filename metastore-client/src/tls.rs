//! TLS setup for backend and peer channels.

use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsOptions;
use crate::error::Error;

/// Build a tonic TLS config from PEM files on disk.
///
/// The CA bundle is required; the client identity is optional and only
/// loaded when both the certificate and key paths are set.
pub fn client_tls_config(options: &TlsOptions) -> Result<ClientTlsConfig, Error> {
    let ca_pem = read_pem(&options.ca_cert_path)?;
    let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_pem));

    if !options.cert_path.is_empty() && !options.key_path.is_empty() {
        let cert = read_pem(&options.cert_path)?;
        let key = read_pem(&options.key_path)?;
        tls = tls.identity(Identity::from_pem(cert, key));
    }

    if let Some(domain) = &options.target_name_override {
        tls = tls.domain_name(domain.clone());
    }
    Ok(tls)
}

fn read_pem(path: &str) -> Result<Vec<u8>, Error> {
    std::fs::read(path)
        .map_err(|err| Error::InvalidParameter(format!("failed to read PEM at {path}: {err}")))
}
