//! Outbound transports
//!
//! Establishes the byte channel to the remote relay: plain TCP, TLS-wrapped
//! TCP, or WebSocket over either. All variants come back as one boxed
//! stream; the whole establishment runs under the configured deadline.

mod tls;
pub mod websocket;

pub use websocket::WebSocketStream;

use crate::common::net::configure_tcp_stream;
use crate::config::{Network, ProxyConfig};
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A connected outbound byte channel
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// Connect to the configured remote, completing the TCP connect, the TLS
/// handshake and the WebSocket upgrade as applicable.
pub async fn connect(config: &ProxyConfig) -> Result<Box<dyn ProxyStream>> {
    timeout(config.connect_timeout(), establish(config))
        .await
        .map_err(|_| {
            Error::timeout(format!(
                "outbound to {}:{} timed out",
                config.server, config.port
            ))
        })?
}

async fn establish(config: &ProxyConfig) -> Result<Box<dyn ProxyStream>> {
    debug!(
        "[{}] connecting to {}:{} ({:?}{})",
        config.name,
        config.server,
        config.port,
        config.network,
        if config.tls { "+tls" } else { "" }
    );

    let stream = TcpStream::connect((config.server.as_str(), config.port)).await?;
    configure_tcp_stream(&stream);

    match (config.network, config.tls) {
        (Network::Tcp, false) => Ok(Box::new(stream)),
        (Network::Tcp, true) => {
            let tls_stream = tls::wrap(stream, config).await?;
            debug!("[{}] TLS handshake done", config.name);
            Ok(Box::new(tls_stream))
        }
        (Network::Ws, false) => {
            let mut stream = stream;
            websocket::handshake(
                &mut stream,
                config.server_name(),
                config.ws_path(),
                &config.ws_headers(),
            )
            .await?;
            debug!("[{}] WebSocket upgrade done", config.name);
            Ok(Box::new(WebSocketStream::new(stream)))
        }
        (Network::Ws, true) => {
            let mut tls_stream = tls::wrap(stream, config).await?;
            websocket::handshake(
                &mut tls_stream,
                config.server_name(),
                config.ws_path(),
                &config.ws_headers(),
            )
            .await?;
            debug!("[{}] WebSocket upgrade done (TLS)", config.name);
            Ok(Box::new(WebSocketStream::new(tls_stream)))
        }
    }
}
