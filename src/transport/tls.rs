//! # TLS Transport Layer
//!
//! [`TlsProtocol`] decorates another [`Protocol`]: the inner protocol prepares the
//! socket and owns the framing, then a TLS handshake runs on top of the stream it
//! returns. Frames are encoded and reassembled exactly as they would be in the
//! clear.
//!
//! ## Responsibilities
//! - Build rustls client and server configurations from certificates on disk,
//!   in memory or generated on the fly
//! - Verify servers against trust roots, a pinned SHA-256 hash or a caller
//!   predicate
//! - Optional mutual TLS
//!
//! ## Example
//! ```rust,no_run
//! use framelink::transport::{TcpProtocol, TlsClientConfig, TlsProtocol, TlsServerConfig};
//!
//! # fn build() -> framelink::error::Result<()> {
//! let (server_tls, cert) = TlsServerConfig::generate_self_signed(["localhost"])?;
//! let server = TlsProtocol::server(TcpProtocol::prefix_length(), &server_tls)?;
//!
//! let client_tls = TlsClientConfig::new("localhost").with_root_certificate(cert);
//! let client = TlsProtocol::client(TcpProtocol::prefix_length(), &client_tls)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::BytesMut;
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use sha2::{Digest, Sha256};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::core::codec::FrameCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{BoxedStream, Protocol, Role};

/// Caller-supplied acceptance test for a server's end-entity certificate.
pub type CertificatePredicate = Arc<dyn Fn(&Certificate) -> bool + Send + Sync>;

/// TLS server configuration
pub struct TlsServerConfig {
    cert_chain: Vec<Certificate>,
    key: PrivateKey,
    /// CA certificates client certificates must chain to (mTLS)
    client_roots: Option<Vec<Certificate>>,
}

impl TlsServerConfig {
    /// Configuration from DER-encoded certificates and a PKCS#8 or RSA key.
    pub fn new(cert_chain: Vec<Certificate>, key: PrivateKey) -> Self {
        Self {
            cert_chain,
            key,
            client_roots: None,
        }
    }

    /// Load a PEM certificate chain and private key.
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        let cert_chain = load_certificates(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        Ok(Self::new(cert_chain, key))
    }

    /// Generate a self-signed certificate for development/testing purposes.
    ///
    /// Returns the configuration plus the certificate, which a client can add as a
    /// trust root.
    pub fn generate_self_signed<I, S>(subject_alt_names: I) -> Result<(Self, Certificate)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = subject_alt_names.into_iter().map(Into::into).collect();
        let generated = rcgen::generate_simple_self_signed(names)
            .map_err(|e| ProtocolError::TlsError(format!("Certificate generation error: {e}")))?;

        let cert = Certificate(generated.cert.der().as_ref().to_vec());
        let key = PrivateKey(generated.key_pair.serialize_der());
        Ok((Self::new(vec![cert.clone()], key), cert))
    }

    /// Require clients to present a certificate chaining to one of `roots`.
    pub fn with_client_auth(mut self, roots: Vec<Certificate>) -> Self {
        self.client_roots = Some(roots);
        self
    }

    /// Like [`with_client_auth`](Self::with_client_auth), reading the roots from a PEM file.
    pub fn with_client_auth_file<P: AsRef<Path>>(self, ca_path: P) -> Result<Self> {
        let roots = load_certificates(ca_path.as_ref())?;
        Ok(self.with_client_auth(roots))
    }

    /// Build the rustls configuration.
    pub fn build(&self) -> Result<ServerConfig> {
        let builder = ServerConfig::builder().with_safe_defaults();

        let builder = match &self.client_roots {
            Some(roots) => {
                let store = root_store(roots)?;
                debug!("mTLS enabled with client certificate verification required");
                builder.with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(store)))
            }
            None => builder.with_no_client_auth(),
        };

        builder
            .with_single_cert(self.cert_chain.clone(), self.key.clone())
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }
}

impl fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsServerConfig")
            .field("certificates", &self.cert_chain.len())
            .field("mutual_tls", &self.client_roots.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum ServerVerification {
    /// Standard chain and hostname validation
    WebPki,
    /// Accept any certificate whose SHA-256 matches
    Pinned(Vec<u8>),
    /// Accept whatever the predicate accepts
    Predicate(CertificatePredicate),
    /// Accept everything
    Insecure,
}

/// TLS client configuration
#[derive(Clone)]
pub struct TlsClientConfig {
    server_name: String,
    roots: Vec<Certificate>,
    native_roots: bool,
    verification: ServerVerification,
    client_identity: Option<(Vec<Certificate>, PrivateKey)>,
}

impl TlsClientConfig {
    /// Verify the server against `server_name` using explicitly added roots, or the
    /// platform's roots when none are added.
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            roots: Vec::new(),
            native_roots: false,
            verification: ServerVerification::WebPki,
            client_identity: None,
        }
    }

    pub fn with_root_certificate(mut self, cert: Certificate) -> Self {
        self.roots.push(cert);
        self
    }

    /// Add every certificate in a PEM file as a trust root.
    pub fn with_root_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.roots.extend(load_certificates(path.as_ref())?);
        Ok(self)
    }

    /// Trust the platform's roots in addition to any added explicitly.
    pub fn with_native_roots(mut self) -> Self {
        self.native_roots = true;
        self
    }

    /// Replace chain validation with a caller predicate over the server certificate.
    pub fn with_certificate_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Certificate) -> bool + Send + Sync + 'static,
    {
        self.verification = ServerVerification::Predicate(Arc::new(predicate));
        self
    }

    /// Pin a certificate by its SHA-256 hash/fingerprint
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.verification = ServerVerification::Pinned(hash);
        self
    }

    /// Skip certificate verification entirely. Development and testing only.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.verification = ServerVerification::Insecure;
        self
    }

    /// Present a certificate to servers that require client authentication.
    pub fn with_client_certificate(mut self, chain: Vec<Certificate>, key: PrivateKey) -> Self {
        self.client_identity = Some((chain, key));
        self
    }

    /// Like [`with_client_certificate`](Self::with_client_certificate), loading PEM files.
    pub fn with_client_certificate_files<P: AsRef<Path>>(self, cert_path: P, key_path: P) -> Result<Self> {
        let chain = load_certificates(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        Ok(self.with_client_certificate(chain, key))
    }

    /// Calculate SHA-256 hash for a certificate to use with pinning
    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        Sha256::digest(&cert.0).to_vec()
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError(constants::ERR_INVALID_SERVER_NAME.into()))
    }

    /// Build the rustls configuration.
    pub fn build(&self) -> Result<ClientConfig> {
        let verifier: Arc<dyn ServerCertVerifier> = match &self.verification {
            ServerVerification::WebPki => {
                let mut roots = self.roots.clone();
                if self.native_roots || roots.is_empty() {
                    let native = rustls_native_certs::load_native_certs().map_err(|e| {
                        ProtocolError::TlsError(format!("Failed to load native certs: {e}"))
                    })?;
                    roots.extend(native.into_iter().map(|cert| Certificate(cert.0)));
                }
                Arc::new(WebPkiVerifier::new(root_store(&roots)?, None))
            }
            ServerVerification::Pinned(hash) => Arc::new(PinnedCertificate {
                fingerprint: hash.clone(),
            }),
            ServerVerification::Predicate(predicate) => Arc::new(PredicateVerifier {
                predicate: Arc::clone(predicate),
            }),
            ServerVerification::Insecure => Arc::new(AcceptAnyServerCert),
        };

        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(verifier);

        match &self.client_identity {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone())
                .map_err(|e| ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))),
            None => Ok(builder.with_no_client_auth()),
        }
    }
}

impl fmt::Debug for TlsClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verification = match self.verification {
            ServerVerification::WebPki => "webpki",
            ServerVerification::Pinned(_) => "pinned",
            ServerVerification::Predicate(_) => "predicate",
            ServerVerification::Insecure => "insecure",
        };
        f.debug_struct("TlsClientConfig")
            .field("server_name", &self.server_name)
            .field("roots", &self.roots.len())
            .field("verification", &verification)
            .field("mutual_tls", &self.client_identity.is_some())
            .finish()
    }
}

struct PinnedCertificate {
    fingerprint: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertificate {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if Sha256::digest(&end_entity.0).as_slice() == self.fingerprint.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(constants::ERR_PINNED_MISMATCH.into()))
        }
    }
}

struct PredicateVerifier {
    predicate: CertificatePredicate,
}

impl ServerCertVerifier for PredicateVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if (self.predicate)(end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(constants::ERR_CERTIFICATE_REJECTED.into()))
        }
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn root_store(certs: &[Certificate]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add cert to root store: {e}")))?;
    }
    Ok(store)
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let chain = certs(&mut BufReader::new(file))
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

/// PKCS#8 first, then PKCS#1 RSA.
fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let open = || {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))
    };

    let keys = pkcs8_private_keys(&mut open()?)
        .map_err(|_| ProtocolError::TlsError("Failed to parse PKCS8 private key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let keys = rsa_private_keys(&mut open()?)
        .map_err(|_| ProtocolError::TlsError("Failed to parse RSA private key".into()))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ProtocolError::TlsError("No supported private key format found".into()))
}

/// Secure decorator over another protocol.
///
/// A client-side instance needs a [`TlsClientConfig`], a server-side one a
/// [`TlsServerConfig`]; [`TlsProtocol::new`] accepts both for peers that play
/// either role.
pub struct TlsProtocol {
    inner: Box<dyn Protocol>,
    connector: Option<(TlsConnector, ServerName)>,
    acceptor: Option<TlsAcceptor>,
}

impl TlsProtocol {
    pub fn new(
        inner: impl Protocol,
        client: Option<&TlsClientConfig>,
        server: Option<&TlsServerConfig>,
    ) -> Result<Self> {
        let connector = client
            .map(|config| -> Result<_> {
                let connector = TlsConnector::from(Arc::new(config.build()?));
                Ok((connector, config.server_name()?))
            })
            .transpose()?;
        let acceptor = server
            .map(|config| config.build().map(|built| TlsAcceptor::from(Arc::new(built))))
            .transpose()?;

        Ok(Self {
            inner: Box::new(inner),
            connector,
            acceptor,
        })
    }

    /// Connecting side only.
    pub fn client(inner: impl Protocol, config: &TlsClientConfig) -> Result<Self> {
        Self::new(inner, Some(config), None)
    }

    /// Accepting side only.
    pub fn server(inner: impl Protocol, config: &TlsServerConfig) -> Result<Self> {
        Self::new(inner, None, Some(config))
    }

    pub fn inner(&self) -> &dyn Protocol {
        self.inner.as_ref()
    }
}

impl fmt::Debug for TlsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsProtocol")
            .field("inner", &self.inner)
            .field("client", &self.connector.as_ref().map(|(_, name)| name))
            .field("server", &self.acceptor.is_some())
            .finish()
    }
}

#[async_trait]
impl Protocol for TlsProtocol {
    fn codec(&self) -> &dyn FrameCodec {
        self.inner.codec()
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn socket(&self, addr: &std::net::SocketAddr) -> std::io::Result<TcpSocket> {
        self.inner.socket(addr)
    }

    #[instrument(skip(self, tcp), fields(codec = self.inner.name()))]
    async fn get_stream(&self, tcp: TcpStream, role: Role) -> Result<BoxedStream> {
        match role {
            Role::Client => {
                let (connector, name) = self
                    .connector
                    .as_ref()
                    .ok_or_else(|| ProtocolError::TlsError(constants::ERR_NO_CLIENT_TLS.into()))?;
                let stream = self.inner.get_stream(tcp, role).await?;
                let tls = connector
                    .connect(name.clone(), stream)
                    .await
                    .map_err(|e| ProtocolError::HandshakeError(format!("TLS connection failed: {e}")))?;
                debug!("TLS client handshake complete");
                Ok(Box::new(tls))
            }
            Role::Server => {
                let acceptor = self
                    .acceptor
                    .as_ref()
                    .ok_or_else(|| ProtocolError::TlsError(constants::ERR_NO_SERVER_TLS.into()))?;
                let stream = self.inner.get_stream(tcp, role).await?;
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ProtocolError::HandshakeError(format!("TLS handshake failed: {e}")))?;
                debug!("TLS server handshake complete");
                Ok(Box::new(tls))
            }
        }
    }

    fn new_decoder(&self) -> Box<dyn FrameCodec> {
        self.inner.new_decoder()
    }

    fn encode_frame(&self, parts: &[&[u8]], dst: &mut BytesMut) -> Result<usize> {
        self.inner.encode_frame(parts, dst)
    }

    fn box_clone(&self) -> Box<dyn Protocol> {
        Box::new(Self {
            inner: self.inner.box_clone(),
            connector: self.connector.clone(),
            acceptor: self.acceptor.clone(),
        })
    }
}
