// Client-facing TLS: build the acceptor from the configured PEM pair.

use log::info;

use crate::config::Config;
use crate::errors::Error;

pub fn init_tls(config: &Config) -> Result<Option<tokio_native_tls::TlsAcceptor>, Error> {
    let (Some(cert_path), Some(key_path)) = (
        config.general.tls_certificate.as_ref(),
        config.general.tls_private_key.as_ref(),
    ) else {
        return Ok(None);
    };

    let cert = std::fs::read(cert_path)
        .map_err(|err| Error::BadConfig(format!("Could not read '{cert_path}': {err}")))?;
    let key = std::fs::read(key_path)
        .map_err(|err| Error::BadConfig(format!("Could not read '{key_path}': {err}")))?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|err| Error::BadConfig(format!("tls is incorrectly configured: {err}")))?;

    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|err| Error::TlsError(err.to_string()))?;

    info!("TLS enabled with certificate {cert_path}");

    Ok(Some(tokio_native_tls::TlsAcceptor::from(acceptor)))
}
