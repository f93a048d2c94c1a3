//! rustls client configuration for `https` clusters.

use std::sync::Arc;

use rustls::RootCertStore;
use tidemark_core::TlsSettings;

use crate::error::{ClientError, ClientResult};

/// Build a client config from a cluster's TLS settings.
///
/// Trusts the Mozilla root store plus any PEM bundle in `ca_cert_pem`.
/// With `verify = false` the server certificate is not checked at all.
pub fn client_config(settings: &TlsSettings) -> ClientResult<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Tls(format!("protocol versions: {e}")))?;

    let config = if settings.verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(pem) = &settings.ca_cert_pem {
            let mut reader = pem.as_bytes();
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| ClientError::Tls(format!("ca bundle: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| ClientError::Tls(format!("ca bundle: {e}")))?;
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerifier(provider)))
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate; signatures are still checked.
    #[derive(Debug)]
    pub struct NoVerifier(pub Arc<CryptoProvider>);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
