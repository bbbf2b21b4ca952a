//! TCP and TLS transport streams.
//!
//! [`IoStream`] unifies plain and TLS sockets. [`FrameReader`] and
//! [`FrameWriter`] turn the two halves of a socket into a sequence of decoded
//! frames and a frame sink. Both only touch the socket when asked to, so a
//! consumer that stops reading stops the socket from being read and a writer
//! suspends while the send buffer is full.

use crate::error::{Result, SessionError};
use bytes::BytesMut;
use scp_wire::{Frame, FrameDecoder, HEARTBEAT};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;
#[cfg(feature = "tls")]
use tracing::{debug, info};

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Read side of a transport stream: yields decoded frames in wire order
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap the read half of a socket
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            buffer: BytesMut::with_capacity(64 * 1024),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream. A stream that ends in the
    /// middle of a frame is reported as [`SessionError::ConnectionClosed`].
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let bytes_read = self.reader.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::ConnectionClosed);
            }

            trace!(
                "Read {} bytes, buffer now has {} bytes",
                bytes_read,
                self.buffer.len()
            );
        }
    }

    /// Number of heartbeat frames received so far
    pub fn heartbeats(&self) -> u64 {
        self.decoder.heartbeats()
    }
}

/// Write side of a transport stream
pub struct FrameWriter<W> {
    writer: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap the write half of a socket
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(scp_wire::MAX_FRAME_SIZE),
        }
    }

    /// Write one frame; completes once the socket accepted every byte
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<usize> {
        self.buffer.clear();
        frame.encode_into(&mut self.buffer);
        self.writer.write_all(&self.buffer).await?;
        trace!("Wrote {:?} frame ({} bytes)", frame.typ(), self.buffer.len());
        Ok(self.buffer.len())
    }

    /// Write a zero-length keepalive frame
    pub async fn write_heartbeat(&mut self) -> Result<()> {
        self.writer.write_all(&HEARTBEAT).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush buffered bytes to the socket
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write side down
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// TLS client configuration for outbound connections
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Rustls client configuration
    pub client_config: rustls::ClientConfig,
    /// Server name for SNI
    pub server_name: String,
}

#[cfg(not(feature = "tls"))]
#[derive(Clone)]
/// TLS client configuration for outbound connections
pub struct TlsClientConfig;

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS transport layer for SCP connections
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    /// ALPN protocol identifier
    pub const ALPN_SCP: &[u8] = b"scp/1";

    /// TLS server acceptor wrapper
    #[derive(Clone)]
    pub struct TlsServer {
        acceptor: TlsAcceptor,
    }

    fn load_certs(cert_chain_pem: &str) -> Result<Vec<CertificateDer<'static>>> {
        let cert_results: std::result::Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
        let certs = cert_results.context("Failed to parse certificate chain")?;
        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }
        Ok(certs)
    }

    fn load_private_key(private_key_pem: &str) -> Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow::anyhow!("No private key found"))
    }

    fn load_roots(ca_pem: &str) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for ca_cert in load_certs(ca_pem).context("Failed to parse CA certificates")? {
            roots
                .add(ca_cert)
                .context("Failed to add CA certificate to root store")?;
        }
        Ok(roots)
    }

    /// Create a TLS server configuration.
    ///
    /// With a CA bundle, client certificates are required (mTLS).
    pub fn make_server_config(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: Option<&str>,
    ) -> Result<ServerConfig> {
        info!("Creating TLS server configuration (mTLS: {})", ca_pem.is_some());

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certs = load_certs(cert_chain_pem)?;
        let key = load_private_key(private_key_pem)?;

        let builder = ServerConfig::builder();
        let mut config = match ca_pem {
            Some(ca_pem) => {
                let client_verifier =
                    rustls::server::WebPkiClientVerifier::builder(Arc::new(load_roots(ca_pem)?))
                        .build()
                        .context("Failed to build client certificate verifier")?;
                builder
                    .with_client_cert_verifier(client_verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .context("Failed to configure server certificate")?;

        config.alpn_protocols = vec![ALPN_SCP.to_vec()];
        Ok(config)
    }

    /// Create a TLS client configuration, optionally presenting a client certificate
    pub fn make_client_config(
        ca_pem: &str,
        client_identity: Option<(&str, &str)>,
    ) -> Result<ClientConfig> {
        info!("Creating TLS client configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let builder = ClientConfig::builder().with_root_certificates(load_roots(ca_pem)?);
        let mut config = match client_identity {
            Some((cert_chain_pem, private_key_pem)) => builder
                .with_client_auth_cert(
                    load_certs(cert_chain_pem)?,
                    load_private_key(private_key_pem)?,
                )
                .context("Failed to configure client certificate")?,
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![ALPN_SCP.to_vec()];
        Ok(config)
    }

    /// Create TLS acceptor from server configuration
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Accept a TLS connection
    pub async fn accept_tls(acceptor: &TlsServer, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        debug!("Accepting TLS connection from {}", peer_addr);

        let tls_stream = acceptor
            .acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;

        debug!("TLS connection accepted from {}", peer_addr);
        Ok(IoStream::Tls(tls_stream))
    }

    /// Connect via TLS over an established TCP stream
    pub async fn connect_tls(config: &TlsClientConfig, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        debug!(
            "Connecting via TLS to {} (SNI: {})",
            peer_addr, config.server_name
        );

        let connector = TlsConnector::from(Arc::new(config.client_config.clone()));
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", config.server_name))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| {
                format!(
                    "TLS handshake failed with {} (SNI: {})",
                    peer_addr, config.server_name
                )
            })?;

        debug!("TLS connection established to {}", peer_addr);
        Ok(IoStream::TlsClient(tls_stream))
    }
}
