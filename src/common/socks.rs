//! SOCKS5 protocol implementation

use super::net::Address;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::unsupported(format!(
                "Unknown SOCKS5 command: {}",
                value
            ))),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::Connect => CMD_CONNECT,
            Command::Bind => CMD_BIND,
            Command::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// SOCKS5 authentication request
#[derive(Debug)]
pub struct AuthRequest {
    pub methods: Vec<u8>,
}

impl AuthRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(AuthRequest { methods })
    }

    pub fn supports(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// SOCKS5 authentication response
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        Ok(())
    }
}

/// SOCKS5 request
#[derive(Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl Request {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 3];
        reader.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                header[0]
            )));
        }

        let command = Command::try_from(header[1])?;

        // Reserved byte (header[2]) is ignored
        let (address, port) = Address::read_from(reader).await?;

        Ok(Request {
            command,
            address,
            port,
        })
    }
}

/// SOCKS5 response
pub struct Response {
    pub reply: u8,
    pub address: Address,
    pub port: u16,
}

impl Response {
    pub fn success(address: Address, port: u16) -> Self {
        Response {
            reply: REP_SUCCEEDED,
            address,
            port,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response {
            reply,
            address: Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.address.len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply, 0x00]);
        self.address.encode(&mut buf)?;
        buf.extend_from_slice(&self.port.to_be_bytes());
        writer.write_all(&buf).await?;
        Ok(())
    }
}

/// SOCKS5 UDP relay encapsulation header
#[derive(Debug, Clone)]
pub struct UdpHeader {
    pub frag: u8,
    pub address: Address,
    pub port: u16,
}

impl UdpHeader {
    /// Parse from the front of a relayed datagram, returning the header and
    /// its encoded length.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 10 {
            return Err(Error::protocol("UDP header too short"));
        }

        // Reserved (2 bytes) + frag (1 byte)
        let frag = data[2];

        let atyp = data[3];
        let (address, addr_len) = match atyp {
            ATYP_IPV4 => {
                let ip = std::net::Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                (Address::Ipv4(ip), 4)
            }
            ATYP_DOMAIN => {
                let len = data[4] as usize;
                if len == 0 {
                    return Err(Error::address("Empty domain name"));
                }
                if data.len() < 7 + len {
                    return Err(Error::protocol("UDP header too short for domain"));
                }
                let domain = String::from_utf8(data[5..5 + len].to_vec())
                    .map_err(|e| Error::address(format!("Invalid domain: {}", e)))?;
                (Address::Domain(domain), 1 + len)
            }
            ATYP_IPV6 => {
                if data.len() < 22 {
                    return Err(Error::protocol("UDP header too short for IPv6"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[4..20]);
                (Address::Ipv6(std::net::Ipv6Addr::from(octets)), 16)
            }
            _ => return Err(Error::address(format!("Unknown address type: {}", atyp))),
        };

        let port_offset = 4 + addr_len;
        if data.len() < port_offset + 2 {
            return Err(Error::protocol("UDP header missing port"));
        }
        let port = u16::from_be_bytes([data[port_offset], data[port_offset + 1]]);

        let header_len = port_offset + 2;
        Ok((
            UdpHeader {
                frag,
                address,
                port,
            },
            header_len,
        ))
    }

    /// Convert to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.address.len() + 4);
        buf.extend_from_slice(&[0x00, 0x00, self.frag]); // RSV + FRAG
        self.address.encode(&mut buf)?;
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }
}
