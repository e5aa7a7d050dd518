//! Transport dialing and the uniform byte-stream surface.
//!
//! The endpoint itself is generic over any `AsyncRead + AsyncWrite` stream;
//! [`Transport`] is the batteries-included enum covering plain TCP, TLS,
//! WebSocket, and WebSocket-over-TLS, selected by URL scheme.

#[cfg(feature = "tls")]
pub mod tls;
#[cfg(feature = "websocket")]
pub mod ws;

use std::io;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::info;

use crate::core::config::{TransportConfig, TransportScheme};

/// An established broker connection.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    #[cfg(feature = "websocket")]
    Ws(Box<ws::WsStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>>),
}

impl Transport {
    /// Dial the broker described by the config.
    pub async fn connect(cfg: &TransportConfig) -> Result<Self> {
        let transport = match cfg.scheme {
            TransportScheme::Tcp => {
                let tcp = TcpStream::connect((cfg.host.as_str(), cfg.port()))
                    .await
                    .with_context(|| format!("connecting to {}:{}", cfg.host, cfg.port()))?;
                let _ = tcp.set_nodelay(true);
                Self::Tcp(tcp)
            }
            TransportScheme::Tls => connect_tls(cfg).await?,
            TransportScheme::Ws | TransportScheme::Wss => connect_ws(cfg).await?,
        };
        info!(host = %cfg.host, port = cfg.port(), "transport established");
        Ok(transport)
    }

    /// Dial from a `scheme://host[:port][/path]` URL.
    pub async fn connect_url(url: &str) -> Result<Self> {
        let cfg: TransportConfig = url.parse()?;
        Self::connect(&cfg).await
    }
}

#[cfg(feature = "tls")]
async fn connect_tls(cfg: &TransportConfig) -> Result<Transport> {
    Ok(Transport::Tls(Box::new(tls::connect(cfg).await?)))
}

#[cfg(not(feature = "tls"))]
async fn connect_tls(_cfg: &TransportConfig) -> Result<Transport> {
    anyhow::bail!("TLS transport requested but the `tls` feature is not enabled")
}

#[cfg(feature = "websocket")]
async fn connect_ws(cfg: &TransportConfig) -> Result<Transport> {
    let scheme = if cfg.scheme == TransportScheme::Wss {
        "wss"
    } else {
        "ws"
    };
    let url = format!("{scheme}://{}:{}{}", cfg.host, cfg.port(), cfg.path);
    let connector = ws_connector(cfg)?;
    let (stream, _response) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .with_context(|| format!("websocket handshake with {url}"))?;
    Ok(Transport::Ws(Box::new(ws::WsStream::new(stream))))
}

#[cfg(not(feature = "websocket"))]
async fn connect_ws(_cfg: &TransportConfig) -> Result<Transport> {
    anyhow::bail!("WebSocket transport requested but the `websocket` feature is not enabled")
}

#[cfg(all(feature = "websocket", feature = "tls"))]
fn ws_connector(cfg: &TransportConfig) -> Result<Option<tokio_tungstenite::Connector>> {
    if cfg.scheme == TransportScheme::Wss && cfg.tls.is_some() {
        let config = tls::client_config(cfg.tls.as_ref())?;
        return Ok(Some(tokio_tungstenite::Connector::Rustls(config)));
    }
    Ok(None)
}

#[cfg(all(feature = "websocket", not(feature = "tls")))]
fn ws_connector(_cfg: &TransportConfig) -> Result<Option<tokio_tungstenite::Connector>> {
    Ok(None)
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(feature = "websocket")]
            Self::Ws(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            #[cfg(feature = "websocket")]
            Self::Ws(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(feature = "websocket")]
            Self::Ws(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(feature = "websocket")]
            Self::Ws(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
