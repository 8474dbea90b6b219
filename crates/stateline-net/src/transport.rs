//! Transport seam
//!
//! The core reads and writes opaque byte frames through [`FrameTransport`]
//! and does not pick the network stack. A QUIC implementation (quinn) is
//! provided as the default, plus an in-memory pair for tests.

use crate::NetError;
use async_trait::async_trait;
use bytes::Bytes;
use quinn::{congestion, ClientConfig, Endpoint, RecvStream, SendStream, ServerConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// ALPN protocol identifier
const ALPN_STATELINE: &[u8] = b"stln/1";

/// Largest chunk pulled from the transport in one read.
const READ_CHUNK: usize = 64 * 1024;

/// Raw byte-frame transport between one client and the server.
#[async_trait]
pub trait FrameTransport: Send {
    /// Write one batch of framed envelopes.
    async fn send(&mut self, frame: &[u8]) -> Result<(), NetError>;

    /// Read the next chunk of bytes, `None` on orderly close. Chunks carry
    /// no framing guarantees; callers reassemble envelopes from the stream.
    async fn recv(&mut self) -> Result<Option<Bytes>, NetError>;
}

/// Transport tuning shared by client and server endpoints.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub keep_alive_interval: Duration,
    pub max_idle_timeout: Duration,
    pub stream_receive_window: VarInt,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(5),
            max_idle_timeout: Duration::from_secs(30),
            stream_receive_window: VarInt::from_u32(1024 * 1024),
        }
    }
}

/// QUIC transport over one bidirectional stream.
pub struct QuicTransport {
    send: SendStream,
    recv: RecvStream,
}

#[async_trait]
impl FrameTransport for QuicTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), NetError> {
        self.send
            .write_all(frame)
            .await
            .map_err(|e| NetError::Transport(format!("stream write failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, NetError> {
        match self.recv.read_chunk(READ_CHUNK, true).await {
            Ok(Some(chunk)) => Ok(Some(chunk.bytes)),
            Ok(None) => Ok(None),
            Err(e) => Err(NetError::Transport(format!("stream read failed: {e}"))),
        }
    }
}

/// Client-side QUIC endpoint.
pub struct QuicConnector {
    endpoint: Endpoint,
    config: TransportConfig,
}

impl QuicConnector {
    pub fn new(config: TransportConfig) -> Result<Self, NetError> {
        let endpoint = Endpoint::client(
            "[::]:0"
                .parse()
                .expect("wildcard bind address always parses"),
        )
        .map_err(|e| NetError::Transport(format!("failed to create endpoint: {e}")))?;
        Ok(Self { endpoint, config })
    }

    /// Dial the server and open the connection's bidirectional stream.
    pub async fn connect(&self, addr: SocketAddr) -> Result<QuicTransport, NetError> {
        let client_config = build_client_config(&self.config)?;
        let connection = self
            .endpoint
            .connect_with(client_config, addr, "localhost")
            .map_err(|e| NetError::ConnectionFailed(format!("connect failed: {e}")))?
            .await
            .map_err(|e| NetError::ConnectionFailed(format!("connect failed: {e}")))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| NetError::Transport(format!("failed to open stream: {e}")))?;
        Ok(QuicTransport { send, recv })
    }
}

/// Server-side QUIC endpoint.
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    /// Bind with a fresh self-signed certificate.
    pub fn bind(addr: SocketAddr, config: &TransportConfig) -> Result<Self, NetError> {
        let server_config = build_server_config(config)?;
        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| NetError::Transport(format!("failed to bind endpoint: {e}")))?;
        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.endpoint
            .local_addr()
            .map_err(|e| NetError::Transport(format!("no local address: {e}")))
    }

    /// Accept the next connection and its bidirectional stream.
    pub async fn accept(&self) -> Result<(QuicTransport, SocketAddr), NetError> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| NetError::Transport("server endpoint closed".into()))?;
        let connection = connecting
            .await
            .map_err(|e| NetError::ConnectionFailed(format!("accept failed: {e}")))?;
        let remote = connection.remote_address();
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| NetError::Transport(format!("failed to accept stream: {e}")))?;
        Ok((QuicTransport { send, recv }, remote))
    }
}

fn build_transport_config(config: &TransportConfig) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(config.max_idle_timeout.try_into().ok());
    transport.keep_alive_interval(Some(config.keep_alive_interval));
    transport.stream_receive_window(config.stream_receive_window);
    transport.receive_window(config.stream_receive_window);
    transport.congestion_controller_factory(Arc::new(congestion::BbrConfig::default()));
    transport
}

fn build_client_config(config: &TransportConfig) -> Result<ClientConfig, NetError> {
    // Envelope payloads carry their own AEAD layer; TLS here only provides
    // the QUIC channel, so a pinned/self-signed server cert is accepted.
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN_STATELINE.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| NetError::Transport(format!("client tls config failed: {e}")))?,
    ));
    client_config.transport_config(Arc::new(build_transport_config(config)));
    Ok(client_config)
}

fn build_server_config(config: &TransportConfig) -> Result<ServerConfig, NetError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| NetError::Transport(format!("certificate generation failed: {e}")))?;
    let cert_der = CertificateDer::from(cert.cert);
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| NetError::Transport(format!("server tls config failed: {e}")))?;
    crypto.alpn_protocols = vec![ALPN_STATELINE.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| NetError::Transport(format!("server tls config failed: {e}")))?,
    ));
    server_config.transport_config(Arc::new(build_transport_config(config)));
    Ok(server_config)
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// In-memory transport for tests and single-process wiring.
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Create a connected pair of in-memory transports.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), NetError> {
        self.tx
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| NetError::Transport("peer closed".into()))
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, NetError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_passes_frames_both_ways() {
        let (mut client, mut server) = memory_pair(8);

        client.send(b"ping").await.unwrap();
        assert_eq!(server.recv().await.unwrap().unwrap().as_ref(), b"ping");

        server.send(b"pong").await.unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap().as_ref(), b"pong");
    }

    #[tokio::test]
    async fn closed_peer_surfaces_as_end_of_stream() {
        let (client, mut server) = memory_pair(8);
        drop(client);
        assert!(server.recv().await.unwrap().is_none());
    }
}
