//! SOCKS5 inbound
//!
//! Drives the control channel through handshake, request and reply, then
//! hands off to the CONNECT relay or the UDP associator. Only the no-auth
//! method is offered; BIND is refused with reply code 7.

use super::udp::UdpAssociator;
use crate::common::net::{Address, Destination};
use crate::common::socks::{
    AuthRequest, AuthResponse, Command, Request, Response, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    REP_COMMAND_NOT_SUPPORTED, REP_CONNECTION_REFUSED, REP_GENERAL_FAILURE,
    REP_HOST_UNREACHABLE, REP_NETWORK_UNREACHABLE, REP_ADDRESS_TYPE_NOT_SUPPORTED,
};
use crate::config::ProxyConfig;
use crate::transport;
use crate::tunnel::ProxyContext;
use crate::{Error, Result};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Handle one accepted SOCKS5 connection to completion.
pub async fn handle(stream: TcpStream, peer_addr: SocketAddr, config: Arc<ProxyConfig>) {
    if let Err(e) = process(stream, peer_addr, config).await {
        debug!("SOCKS5 connection error from {}: {}", peer_addr, e);
    }
}

async fn process(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
) -> Result<()> {
    // Step 1: authentication negotiation
    let auth_req = AuthRequest::read_from(&mut stream).await?;
    if !auth_req.supports(AUTH_NO_AUTH) {
        AuthResponse::new(AUTH_NO_ACCEPTABLE)
            .write_to(&mut stream)
            .await?;
        return Err(Error::protocol("No acceptable authentication method"));
    }
    AuthResponse::new(AUTH_NO_AUTH).write_to(&mut stream).await?;

    // Step 2: read request
    let request = match Request::read_from(&mut stream).await {
        Ok(r) => r,
        Err(e) => {
            if let Some(code) = request_error_reply(&e) {
                Response::failure(code).write_to(&mut stream).await.ok();
            }
            return Err(e);
        }
    };

    match request.command {
        Command::Connect => {
            let destination = Destination::new(request.address, request.port);
            handle_connect(stream, peer_addr, config, destination).await
        }
        Command::UdpAssociate => handle_udp_associate(stream, peer_addr, config).await,
        Command::Bind => {
            Response::failure(REP_COMMAND_NOT_SUPPORTED)
                .write_to(&mut stream)
                .await?;
            Err(Error::unsupported("BIND command"))
        }
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    destination: Destination,
) -> Result<()> {
    debug!("SOCKS5 CONNECT {} -> {}", peer_addr, destination);

    // Dial the relay, not the destination. The destination travels inside
    // the VLESS request header.
    let outbound = match transport::connect(&config).await {
        Ok(s) => s,
        Err(e) => {
            Response::failure(dial_error_reply(&e))
                .write_to(&mut stream)
                .await
                .ok();
            return Err(e);
        }
    };

    Response::success(bound_address(&config), config.port)
        .write_to(&mut stream)
        .await?;

    let mut ctx = ProxyContext::new(config, destination, stream, outbound);
    ctx.relay().await
}

async fn handle_udp_associate(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
) -> Result<()> {
    debug!("SOCKS5 UDP ASSOCIATE from {}", peer_addr);

    let associator = match UdpAssociator::bind(config).await {
        Ok(a) => a,
        Err(e) => {
            Response::failure(REP_GENERAL_FAILURE)
                .write_to(&mut stream)
                .await
                .ok();
            return Err(e);
        }
    };
    let relay_port = associator.local_addr()?.port();
    debug!("SOCKS5 UDP relay for {} bound on port {}", peer_addr, relay_port);

    Response::success(Address::Ipv4(Ipv4Addr::UNSPECIFIED), relay_port)
        .write_to(&mut stream)
        .await?;

    let relay = tokio::spawn(associator.run());

    // The control channel stays open for the lifetime of the association;
    // its closure tears down the relay and every outbound flow.
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    relay.abort();
    debug!("SOCKS5 UDP ASSOCIATE from {} closed", peer_addr);
    Ok(())
}

/// Bound address advertised in the CONNECT reply: the configured server
/// address when it is a literal IP, unspecified otherwise.
fn bound_address(config: &ProxyConfig) -> Address {
    config
        .server
        .parse::<IpAddr>()
        .map(Address::from)
        .unwrap_or(Address::Ipv4(Ipv4Addr::UNSPECIFIED))
}

/// Reply code for a request that failed to parse, when the control channel
/// is still in a state to carry one.
fn request_error_reply(e: &Error) -> Option<u8> {
    match e {
        Error::Address(_) => Some(REP_ADDRESS_TYPE_NOT_SUPPORTED),
        Error::Unsupported(_) => Some(REP_COMMAND_NOT_SUPPORTED),
        _ => None,
    }
}

fn dial_error_reply(e: &Error) -> u8 {
    match e {
        Error::Io(io_err) => match io_err.kind() {
            ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
            ErrorKind::HostUnreachable => REP_HOST_UNREACHABLE,
            ErrorKind::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
            _ => REP_GENERAL_FAILURE,
        },
        _ => REP_GENERAL_FAILURE,
    }
}
