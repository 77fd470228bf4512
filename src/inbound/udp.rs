//! UDP associator
//!
//! One ephemeral UDP socket per association. Datagrams are demultiplexed by
//! client source address: each source gets its own VLESS UDP outbound, and
//! replies are re-encapsulated and sent back to the source that opened the
//! flow. The associator task owns the source map, so flow creation is
//! naturally serialized.

use crate::adapter::{Adapter, DatagramDecoder, VlessCommand};
use crate::common::net::Destination;
use crate::common::socks::UdpHeader;
use crate::config::ProxyConfig;
use crate::transport;
use crate::Result;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

/// Datagrams queued per flow while its outbound is connecting; the oldest
/// is dropped beyond this.
const FLOW_QUEUE_LIMIT: usize = 16;

struct OutboundDatagram {
    destination: Destination,
    payload: Bytes,
}

struct FlowHandle {
    tx: mpsc::Sender<OutboundDatagram>,
}

/// UDP relay endpoint for one SOCKS5 association.
pub struct UdpAssociator {
    config: Arc<ProxyConfig>,
    socket: Arc<UdpSocket>,
}

impl UdpAssociator {
    pub async fn bind(config: Arc<ProxyConfig>) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        Ok(UdpAssociator {
            config,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Accept encapsulated datagrams until the socket fails or the task is
    /// torn down with the control channel.
    pub async fn run(self) {
        let mut flows: HashMap<SocketAddr, FlowHandle> = HashMap::new();
        let mut buf = vec![0u8; 65535];

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    debug!("UDP relay recv error: {}", e);
                    break;
                }
            };

            let (header, header_len) = match UdpHeader::from_bytes(&buf[..len]) {
                Ok(v) => v,
                Err(e) => {
                    debug!("dropping malformed UDP datagram from {}: {}", src, e);
                    continue;
                }
            };
            if header.frag != 0 {
                debug!("dropping fragmented UDP datagram from {}", src);
                continue;
            }

            let datagram = OutboundDatagram {
                destination: Destination::new(header.address, header.port),
                payload: Bytes::copy_from_slice(&buf[header_len..len]),
            };

            let unsent = match flows.get(&src) {
                None => Some(datagram),
                Some(flow) => match flow.tx.try_send(datagram) {
                    Ok(()) => None,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("UDP flow queue full for {}, dropping datagram", src);
                        None
                    }
                    // flow died (connect failure or remote close);
                    // start over for this source
                    Err(mpsc::error::TrySendError::Closed(datagram)) => Some(datagram),
                },
            };

            if let Some(datagram) = unsent {
                let flow = spawn_flow(self.config.clone(), self.socket.clone(), src, datagram);
                flows.insert(src, flow);
            }
        }
    }
}

fn spawn_flow(
    config: Arc<ProxyConfig>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    first: OutboundDatagram,
) -> FlowHandle {
    let (tx, rx) = mpsc::channel(FLOW_QUEUE_LIMIT);
    // capacity is at least one, this cannot fail
    let _ = tx.try_send(first);

    tokio::spawn(async move {
        if let Err(e) = run_flow(config, socket, client, rx).await {
            debug!("UDP flow for {} ended: {}", client, e);
        }
    });

    FlowHandle { tx }
}

async fn run_flow(
    config: Arc<ProxyConfig>,
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    mut rx: mpsc::Receiver<OutboundDatagram>,
) -> Result<()> {
    // Establish the outbound while queuing datagrams that keep arriving for
    // this source.
    let mut queue: VecDeque<OutboundDatagram> = VecDeque::new();
    let connect = transport::connect(&config);
    tokio::pin!(connect);

    let mut outbound = loop {
        tokio::select! {
            res = &mut connect => break res?,
            recv = rx.recv() => match recv {
                Some(datagram) => {
                    if queue.len() == FLOW_QUEUE_LIMIT {
                        queue.pop_front();
                    }
                    queue.push_back(datagram);
                }
                None => return Ok(()), // association torn down mid-connect
            }
        }
    };

    debug!("UDP flow for {} connected", client);

    let mut adapter = Adapter::vless(config.uuid, VlessCommand::Udp);
    let mut reply_destination: Option<Destination> = None;

    for datagram in queue.drain(..) {
        let framed = adapter.transform_outbound(&datagram.payload, &datagram.destination)?;
        outbound.write_all(&framed).await?;
        reply_destination = Some(datagram.destination);
    }
    outbound.flush().await?;

    let mut decoder = DatagramDecoder::new();
    let mut read_buf = vec![0u8; 32 * 1024];

    loop {
        tokio::select! {
            recv = rx.recv() => match recv {
                Some(datagram) => {
                    let framed =
                        adapter.transform_outbound(&datagram.payload, &datagram.destination)?;
                    outbound.write_all(&framed).await?;
                    outbound.flush().await?;
                    reply_destination = Some(datagram.destination);
                }
                None => break,
            },
            res = outbound.read(&mut read_buf) => {
                let n = res?;
                if n == 0 {
                    break;
                }
                let data = adapter.transform_inbound(&read_buf[..n])?;
                for payload in decoder.feed(&data) {
                    let Some(destination) = reply_destination.as_ref() else {
                        continue;
                    };
                    let header = UdpHeader {
                        frag: 0,
                        address: destination.address.clone(),
                        port: destination.port,
                    };
                    let mut packet = header.to_bytes()?;
                    packet.extend_from_slice(&payload);
                    socket.send_to(&packet, client).await?;
                }
            }
        }
    }

    let _ = outbound.shutdown().await;
    debug!("UDP flow for {} closed", client);
    Ok(())
}
