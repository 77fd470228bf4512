//! Per-flow proxy context
//!
//! Ties one inbound endpoint to one outbound transport. The context owns
//! both endpoints and the adapter between them; the endpoints never refer
//! to each other. One task drives the whole flow, so no locking is needed
//! inside a context.

use crate::adapter::{Adapter, VlessCommand};
use crate::common::net::Destination;
use crate::config::ProxyConfig;
use crate::transport::ProxyStream;
use crate::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Per-flow state for a TCP CONNECT tunnel.
pub struct ProxyContext<I> {
    config: Arc<ProxyConfig>,
    destination: Destination,
    adapter: Adapter,
    inbound: I,
    outbound: Box<dyn ProxyStream>,
    closed: bool,
}

impl<I: AsyncRead + AsyncWrite + Unpin> ProxyContext<I> {
    pub fn new(
        config: Arc<ProxyConfig>,
        destination: Destination,
        inbound: I,
        outbound: Box<dyn ProxyStream>,
    ) -> Self {
        let adapter = Adapter::vless(config.uuid, VlessCommand::Tcp);
        ProxyContext {
            config,
            destination,
            adapter,
            inbound,
            outbound,
            closed: false,
        }
    }

    /// Splice bytes between the endpoints until either side ends, then tear
    /// both down.
    pub async fn relay(&mut self) -> Result<()> {
        let result = self.splice().await;
        self.close().await;
        result
    }

    async fn splice(&mut self) -> Result<()> {
        let mut inbound_buf = vec![0u8; RELAY_BUF_SIZE];
        let mut outbound_buf = vec![0u8; RELAY_BUF_SIZE];
        let mut sent: u64 = 0;
        let mut received: u64 = 0;

        loop {
            tokio::select! {
                res = self.inbound.read(&mut inbound_buf) => {
                    let n = res?;
                    if n == 0 {
                        break;
                    }
                    let data = self
                        .adapter
                        .transform_outbound(&inbound_buf[..n], &self.destination)?;
                    self.outbound.write_all(&data).await?;
                    self.outbound.flush().await?;
                    sent += n as u64;
                }
                res = self.outbound.read(&mut outbound_buf) => {
                    let n = res?;
                    if n == 0 {
                        break;
                    }
                    let data = self.adapter.transform_inbound(&outbound_buf[..n])?;
                    if !data.is_empty() {
                        self.inbound.write_all(&data).await?;
                        received += data.len() as u64;
                    }
                }
            }
        }

        debug!(
            "[{}] tunnel to {} done (sent: {}, received: {})",
            self.config.name, self.destination, sent, received
        );
        Ok(())
    }

    /// Shut down both endpoints. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.inbound.shutdown().await;
        let _ = self.outbound.shutdown().await;
        debug!("[{}] context for {} closed", self.config.name, self.destination);
    }
}
