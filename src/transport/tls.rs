//! TLS client configuration for secure connection pools.
//!
//! A [`SecurityOptions`] value describes the protocol and cipher-suite
//! allow-lists and the trust configuration. It is hashable so that pools can be
//! keyed by it, and builds a shared rustls [`ClientConfig`] once per pool.

use crate::error::ConnectionError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

/// Protocol names accepted in [`SecurityOptions::protocols`].
pub const TLS12: &str = "TLSv1.2";
pub const TLS13: &str = "TLSv1.3";

/// TLS settings for a secure content source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecurityOptions {
    /// Enabled protocol versions, e.g. `TLSv1.2`, `TLSv1.3`
    pub protocols: Vec<String>,

    /// Allow-list of cipher suites by IANA name. Empty enables every suite of
    /// the aws-lc-rs provider; [`enabled_cipher_suites`](Self::enabled_cipher_suites)
    /// reports the resolved list.
    pub cipher_suites: Vec<String>,

    /// PEM file with additional trusted CA certificates
    pub ca_file: Option<PathBuf>,

    /// Verify the server certificate chain and host name
    pub validate_certificate: bool,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            protocols: vec![TLS12.to_string(), TLS13.to_string()],
            cipher_suites: Vec::new(),
            ca_file: None,
            validate_certificate: true,
        }
    }
}

impl SecurityOptions {
    /// Restrict the enabled protocol versions.
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the enabled cipher suites.
    pub fn with_cipher_suites<I, S>(mut self, suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cipher_suites = suites.into_iter().map(Into::into).collect();
        self
    }

    /// Trust the CA certificates in `path`.
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Enable or disable certificate validation.
    pub fn with_validate_certificate(mut self, validate: bool) -> Self {
        self.validate_certificate = validate;
        self
    }

    /// Build a rustls client configuration honoring the allow-lists.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::TlsError` for unknown protocol names, cipher
    /// allow-lists that match nothing, or unreadable CA files.
    pub fn build_client_config(&self) -> Result<Arc<ClientConfig>, ConnectionError> {
        let provider = self.crypto_provider()?;
        tracing::debug!(
            cipher_suites = ?provider.cipher_suites.iter().map(|s| s.suite()).collect::<Vec<_>>(),
            "building TLS client configuration"
        );

        let versions = self.protocol_versions()?;
        let provider = Arc::new(provider);
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)?;

        let config = if self.validate_certificate {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth()
        };

        Ok(Arc::new(config))
    }

    /// Names of the cipher suites a client configuration would enable.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::TlsError` if the allow-list matches nothing.
    pub fn enabled_cipher_suites(&self) -> Result<Vec<String>, ConnectionError> {
        Ok(self
            .crypto_provider()?
            .cipher_suites
            .iter()
            .map(|suite| format!("{:?}", suite.suite()))
            .collect())
    }

    fn crypto_provider(&self) -> Result<CryptoProvider, ConnectionError> {
        let mut provider = aws_lc_rs::default_provider();
        if self.cipher_suites.is_empty() {
            return Ok(provider);
        }
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            self.cipher_suites.iter().any(|allowed| allowed.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(ConnectionError::TlsError(format!(
                "none of the configured cipher suites are supported: {}",
                self.cipher_suites.join(", ")
            )));
        }
        Ok(provider)
    }

    fn protocol_versions(
        &self,
    ) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, ConnectionError> {
        let mut versions = Vec::new();
        for name in &self.protocols {
            let version = match name.trim() {
                TLS12 | "TLSv1_2" | "1.2" => &rustls::version::TLS12,
                TLS13 | "TLSv1_3" | "1.3" => &rustls::version::TLS13,
                other => {
                    return Err(ConnectionError::TlsError(format!(
                        "unsupported TLS protocol '{}'",
                        other
                    )))
                }
            };
            versions.push(version);
        }
        if versions.is_empty() {
            return Err(ConnectionError::TlsError(
                "no TLS protocol versions enabled".to_string(),
            ));
        }
        Ok(versions)
    }

    fn root_store(&self) -> Result<RootCertStore, ConnectionError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &self.ca_file {
            let file = File::open(path).map_err(|e| {
                ConnectionError::TlsError(format!(
                    "failed to read CA file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let mut reader = BufReader::new(file);
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| {
                    ConnectionError::TlsError(format!(
                        "failed to parse CA file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                roots.add(cert)?;
                added += 1;
            }
            if added == 0 {
                return Err(ConnectionError::TlsError(format!(
                    "no certificates found in {}",
                    path.display()
                )));
            }
            tracing::debug!(ca_file = %path.display(), added, "loaded trusted CA certificates");
        }

        Ok(roots)
    }
}

/// Verifier used when certificate validation is disabled. Signatures are still
/// checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
