//! rustls client configurations for the socket transport.
//!
//! Three trust modes, picked from the request's `TlsOptions`: exactly the
//! certificates of a PEM bundle (`ca_file`), nothing at all (`verify = false`),
//! or the bundled Mozilla root set. The root-set config is built once and
//! shared.

use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ConfigBuilder, DigitallySignedStruct, RootCertStore, SignatureScheme, WantsVerifier};

use crate::error::FetchError;
use crate::request::TlsOptions;

static DEFAULT_CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn builder(provider: Arc<CryptoProvider>) -> Result<ConfigBuilder<ClientConfig, WantsVerifier>, FetchError> {
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::Tls(e.to_string()))
}

/// Client config matching `opts`.
pub(crate) fn client_config(opts: &TlsOptions) -> Result<Arc<ClientConfig>, FetchError> {
    if !opts.verify {
        let provider = provider();
        let config = builder(Arc::clone(&provider))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    if let Some(path) = &opts.ca_file {
        let mut roots = RootCertStore::empty();
        let certs = CertificateDer::pem_file_iter(path)
            .map_err(|e| FetchError::Tls(format!("reading {}: {e}", path.display())))?;
        for cert in certs {
            let cert = cert.map_err(|e| FetchError::Tls(format!("parsing {}: {e}", path.display())))?;
            roots
                .add(cert)
                .map_err(|e| FetchError::Tls(format!("loading {}: {e}", path.display())))?;
        }
        if roots.is_empty() {
            return Err(FetchError::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        let config = builder(provider())?
            .with_root_certificates(roots)
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    if let Some(config) = DEFAULT_CONFIG.get() {
        return Ok(Arc::clone(config));
    }
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = Arc::new(
        builder(provider())?
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    Ok(Arc::clone(DEFAULT_CONFIG.get_or_init(|| config)))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, FetchError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| FetchError::Tls(format!("invalid server name {host:?}")))
}

/// Verifier installed when `verify` is false. Signatures are still checked so
/// the handshake itself stays well-formed.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
