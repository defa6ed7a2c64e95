/*
 * net.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an HTTP client library.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Transport plumbing: the unified plain/TLS duplex stream, the pluggable
//! TLS transport seam, and TCP connect with deadline. The default transport
//! uses rustls with platform native roots and webpki-roots as fallback.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Unified stream: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub enum HttpStream {
    Plain(TcpStream),
    Tls(TokioTlsStream<TcpStream>),
}

impl HttpStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, HttpStream::Tls(_))
    }

    pub fn tcp_ref(&self) -> &TcpStream {
        match self {
            HttpStream::Plain(s) => s,
            HttpStream::Tls(s) => s.get_ref().0,
        }
    }

    /// ALPN protocol negotiated during the TLS handshake, if any.
    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        match self {
            HttpStream::Plain(_) => None,
            HttpStream::Tls(s) => s.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
        }
    }

    /// Probe an idle pooled connection. A readable plain socket means the
    /// peer sent a FIN or stray bytes, either of which makes the connection
    /// unusable; the probe may consume one byte, so callers must evict when
    /// it returns true. TLS sessions can legitimately carry readable
    /// post-handshake records while idle, so they are not probed.
    pub fn probe_unusable_when_idle(&self) -> bool {
        match self {
            HttpStream::Plain(tcp) => {
                let mut buf = [0u8; 1];
                match tcp.try_read(&mut buf) {
                    Ok(_) => true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                    Err(_) => true,
                }
            }
            HttpStream::Tls(_) => false,
        }
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Result of a TLS handshake: the stream plus what ALPN selected.
pub struct TlsHandshake {
    pub stream: HttpStream,
    pub alpn: Option<Vec<u8>>,
}

/// Pluggable TLS seam. The engine hands over a connected TCP stream, the
/// server name and the ALPN preference list; the transport returns the
/// encrypted duplex stream and the negotiated protocol.
pub trait TlsTransport: Send + Sync {
    fn handshake<'a>(
        &'a self,
        tcp: TcpStream,
        server_name: &'a str,
        alpn: &'a [Vec<u8>],
    ) -> BoxFuture<'a, io::Result<TlsHandshake>>;
}

/// Build a root certificate store: platform native certs first, then
/// webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = root_store.add(cert);
        }
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// Default transport: rustls client with no client auth.
pub struct RustlsTransport {
    roots: RootCertStore,
}

impl RustlsTransport {
    pub fn new() -> Self {
        Self {
            roots: build_root_store(),
        }
    }
}

impl Default for RustlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsTransport for RustlsTransport {
    fn handshake<'a>(
        &'a self,
        tcp: TcpStream,
        server_name: &'a str,
        alpn: &'a [Vec<u8>],
    ) -> BoxFuture<'a, io::Result<TlsHandshake>> {
        Box::pin(async move {
            let mut config = ClientConfig::builder()
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth();
            config.alpn_protocols = alpn.to_vec();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name: ServerName<'static> = ServerName::try_from(server_name.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e))?;
            let negotiated = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
            Ok(TlsHandshake {
                stream: HttpStream::Tls(tls),
                alpn: negotiated,
            })
        })
    }
}

/// TCP connect with an optional deadline (zero disables).
pub async fn connect_tcp(addr: SocketAddr, deadline: Duration) -> io::Result<TcpStream> {
    let tcp = if deadline.is_zero() {
        TcpStream::connect(addr).await?
    } else {
        timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TCP connect timed out"))??
    };
    tcp.set_nodelay(true)?;
    Ok(tcp)
}
