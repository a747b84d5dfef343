//! TLS handshake engine for the control channel
//!
//! OpenVPN runs TLS over its own reliable control channel, so the engine
//! never touches a socket: ciphertext is pushed in and pulled out as bytes.

use crate::error::{Result, VpnError};
use crate::proxy::configuration::SessionConfiguration;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use std::io::{self, Read, Write};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Name presented to the server; OpenVPN does not verify hostnames
const SERVER_NAME: &str = "openvpn-server";

/// A TLS client session driven through memory buffers
pub trait TlsEngine: Send {
    /// Begin the handshake
    fn start(&mut self) -> Result<()>;

    /// Whether the handshake has completed
    fn is_connected(&self) -> bool;

    /// Feed ciphertext received from the peer
    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()>;

    /// Take ciphertext to send to the peer; empty if there is none
    fn pull_cipher_text(&mut self) -> Result<Vec<u8>>;

    /// Queue application data for encryption
    fn put_plain_text(&mut self, data: &[u8]) -> Result<()>;

    /// Take decrypted application data; empty if there is none
    fn pull_plain_text(&mut self) -> Result<Vec<u8>>;
}

/// Creates one [`TlsEngine`] per key negotiation
pub trait TlsEngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn TlsEngine>>;
}

/// Verifies the server chain against the profile CA only
#[derive(Debug)]
struct CaVerifier {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
    /// `remote-cert-tls server`: the leaf must carry the serverAuth EKU
    checks_eku: bool,
}

/// Whether the certificate lists TLS Web Server Authentication as extended key usage
fn has_server_auth_eku(
    end_entity: &CertificateDer<'_>,
) -> std::result::Result<bool, rustls::Error> {
    let bad_encoding = || rustls::Error::InvalidCertificate(CertificateError::BadEncoding);
    let (_, certificate) =
        X509Certificate::from_der(end_entity.as_ref()).map_err(|_| bad_encoding())?;
    match certificate.extended_key_usage() {
        Ok(Some(eku)) => Ok(eku.value.server_auth),
        Ok(None) => Ok(false),
        Err(_) => Err(bad_encoding()),
    }
}

impl ServerCertVerifier for CaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let certificate = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &certificate,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        if self.checks_eku && !has_server_auth_eku(end_entity)? {
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::InvalidPurpose,
            ));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
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

fn parse_certificates(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| VpnError::Config(format!("Invalid {what}: {e}")))?;
    if certs.is_empty() {
        return Err(VpnError::Config(format!("No certificate found in {what}")));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| VpnError::Config(format!("Invalid private key: {e}")))?
        .ok_or_else(|| VpnError::Config("No private key found".into()))
}

/// Builds rustls client sessions from a [`SessionConfiguration`]
pub struct RustlsEngineFactory {
    config: Arc<ClientConfig>,
}

impl RustlsEngineFactory {
    pub fn new(configuration: &SessionConfiguration) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in parse_certificates(&configuration.ca, "CA")? {
            roots
                .add(cert)
                .map_err(|e| VpnError::Config(format!("Invalid CA: {e}")))?;
        }
        let verifier = Arc::new(CaVerifier {
            roots,
            provider: provider.clone(),
            checks_eku: configuration.checks_eku,
        });

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut config = match (
            &configuration.client_certificate,
            &configuration.client_key,
        ) {
            (Some(certificate), Some(key)) => builder.with_client_auth_cert(
                parse_certificates(certificate, "client certificate")?,
                parse_private_key(key)?,
            )?,
            _ => builder.with_no_client_auth(),
        };
        config.enable_sni = false;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl TlsEngineFactory for RustlsEngineFactory {
    fn create(&self) -> Result<Box<dyn TlsEngine>> {
        let name = ServerName::try_from(SERVER_NAME)
            .map_err(|e| VpnError::Tls(format!("Invalid server name: {e}")))?;
        let connection = ClientConnection::new(self.config.clone(), name)?;
        Ok(Box::new(RustlsEngine {
            connection,
            started: false,
        }))
    }
}

/// [`TlsEngine`] backed by a rustls [`ClientConnection`]
pub struct RustlsEngine {
    connection: ClientConnection,
    started: bool,
}

impl TlsEngine for RustlsEngine {
    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(VpnError::Tls("TLS handshake already started".into()));
        }
        self.started = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.started && !self.connection.is_handshaking()
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = data;
        while !reader.is_empty() {
            self.connection.read_tls(&mut reader)?;
            self.connection.process_new_packets()?;
        }
        Ok(())
    }

    fn pull_cipher_text(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while self.connection.wants_write() {
            self.connection.write_tls(&mut out)?;
        }
        Ok(out)
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<()> {
        self.connection.writer().write_all(data)?;
        Ok(())
    }

    fn pull_plain_text(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self.connection.reader().read_to_end(&mut out) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        Ok(out)
    }
}
