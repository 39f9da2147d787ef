use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),
    #[error("no certificate found in {0}")]
    NoCertificate(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("connect to {0} timed out")]
    DialTimeout(String),
}

/// A peer link stream. TLS and plaintext expose the same read/write surface,
/// so everything above this module is transport-agnostic.
pub enum PeerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PeerStream {
    pub fn remote_endpoint(&self) -> io::Result<SocketAddr> {
        match self {
            PeerStream::Plain(s) => s.peer_addr(),
            PeerStream::Tls(s) => s.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)?;
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificate(path.to_string()));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| TransportError::NoPrivateKey(path.to_string()))
}

/// Builds the listener-side acceptor from a PEM cert/key pair. TLS 1.3 only.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Policy for verifying the certificates of peers we dial.
#[derive(Debug, Clone)]
pub enum VerifyPolicy {
    /// Trust anchors loaded from a PEM bundle.
    TrustStore(String),
    /// Accept any certificate. The channel is still encrypted, but the remote
    /// end is unauthenticated beyond the network-key handshake.
    SkipVerify,
}

pub fn build_connector(policy: &VerifyPolicy) -> Result<TlsConnector, TransportError> {
    let config = match policy {
        VerifyPolicy::TrustStore(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert)?;
            }
            rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        VerifyPolicy::SkipVerify => {
            let mut config =
                rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth();
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(SkipServerVerification));
            config
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Splits `host:port` / `[v6]:port` into the host part, for SNI and for the
/// host-level deny list.
pub fn host_of(addr: &str) -> &str {
    if let Some(stripped) = addr.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

/// Dials a peer, optionally wrapping the connection in TLS. Connect and TLS
/// handshake together are bounded by `DIAL_TIMEOUT`.
pub async fn dial(addr: &str, tls: Option<&TlsConnector>) -> Result<PeerStream, TransportError> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::DialTimeout(addr.to_string()))??;

    match tls {
        None => Ok(PeerStream::Plain(stream)),
        Some(connector) => {
            let host = host_of(addr);
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| TransportError::InvalidServerName(host.to_string()))?;
            let tls_stream = tokio::time::timeout(DIAL_TIMEOUT, connector.connect(server_name, stream))
                .await
                .map_err(|_| TransportError::DialTimeout(addr.to_string()))??;
            Ok(PeerStream::Tls(Box::new(TlsStream::Client(tls_stream))))
        }
    }
}

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1:8787"), "10.0.0.1");
        assert_eq!(host_of("relay.example.net:8787"), "relay.example.net");
        assert_eq!(host_of("[2001:db8::1]:8787"), "2001:db8::1");
        assert_eq!(host_of("[2001:db8::1]"), "2001:db8::1");
        // A bare host without a port is returned as-is.
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("relay.example.net"), "relay.example.net");
    }
}
