//! vlproxy - client-side SOCKS5 proxy daemon over a VLESS outbound
//!
//! Accepts SOCKS5 (TCP CONNECT and UDP ASSOCIATE) from local applications
//! and tunnels every flow through a remote VLESS relay, over raw TCP, TLS,
//! or WebSocket.
//!
//! # Architecture
//!
//! ```text
//! +-------------+     +-------------+     +--------------+
//! |  inbound/   | --> |   tunnel/   | --> |  transport/  |
//! |  (SOCKS5)   |     |  (context)  |     | (tcp/tls/ws) |
//! +-------------+     +------+------+     +--------------+
//!                            |
//!                     +------v------+
//!                     |  adapter/   |
//!                     |   (VLESS)   |
//!                     +-------------+
//! ```

pub mod adapter;
pub mod common;
pub mod config;
pub mod inbound;
pub mod transport;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::ProxyConfig;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

/// The supervisor: owns the listener and spawns one SOCKS5 handler task per
/// accepted connection.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    listener: TcpListener,
}

impl Proxy {
    /// Bind the local SOCKS5 listener. A bind failure here is fatal.
    pub async fn listen(config: ProxyConfig, bind: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        info!(
            "[{}] SOCKS5 proxy listening on {}",
            config.name,
            listener.local_addr()?
        );
        Ok(Proxy {
            config: Arc::new(config),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until a shutdown signal arrives, then drain live connections
    /// for a short grace period and force-close the rest.
    pub async fn run(self) -> Result<()> {
        let mut tasks = JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut backoff = ACCEPT_BACKOFF_MIN;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
                res = self.listener.accept() => match res {
                    Ok((stream, peer_addr)) => {
                        backoff = ACCEPT_BACKOFF_MIN;
                        debug!("new SOCKS5 connection from {}", peer_addr);
                        tasks.spawn(inbound::socks5::handle(
                            stream,
                            peer_addr,
                            self.config.clone(),
                        ));
                        // reap whatever already finished
                        while tasks.try_join_next().is_some() {}
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                }
            }
        }

        drop(self.listener);
        info!("draining {} live connections", tasks.len());
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
