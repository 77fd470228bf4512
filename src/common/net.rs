//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::socks::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Typed address as carried by SOCKS5, the UDP encapsulation and the VLESS
/// request header. Domain names are forwarded as-is, never resolved locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Parse from SOCKS5 format (atyp + address + port)
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((addr, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                if len == 0 {
                    return Err(Error::address("Empty domain name"));
                }
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::address(format!("Invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain), port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((addr, port))
            }
            t => Err(Error::address(format!("Unknown address type: {}", t))),
        }
    }

    /// Write in SOCKS5 format (atyp + address + port)
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, port: u16) -> Result<()> {
        let mut buf = Vec::with_capacity(self.len());
        self.encode(&mut buf)?;
        buf.extend_from_slice(&port.to_be_bytes());
        writer.write_all(&buf).await?;
        Ok(())
    }

    /// Append atyp + address bytes (no port)
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.is_empty() {
                    return Err(Error::address("Empty domain name"));
                }
                if bytes.len() > 255 {
                    return Err(Error::address("Domain name too long"));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    /// Get encoded length (atyp + address + port)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,
            Address::Ipv6(_) => 1 + 16 + 2,
            Address::Domain(d) => 1 + 1 + d.len() + 2,
        }
    }

    /// Get as IP if not a domain
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Ipv6(ip) => write!(f, "[{}]", ip),
            Address::Domain(d) => write!(f, "{}", d),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ipv6(ip)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

/// A tunnel destination: typed address plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(address: Address, port: u16) -> Self {
        Destination { address, port }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_len() {
        let ipv4 = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(ipv4.len(), 7);

        let domain = Address::Domain("example.com".to_string());
        assert_eq!(domain.len(), 1 + 1 + 11 + 2);
    }

    #[tokio::test]
    async fn test_address_round_trip() {
        let addr = Address::Domain("example.com".to_string());
        let mut buf = Vec::new();
        addr.write_to(&mut buf, 443).await.unwrap();

        let (parsed, port) = Address::read_from(&mut buf.as_slice()).await.unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        // atyp=domain, length byte 0
        let bytes = [0x03u8, 0x00, 0x00, 0x50];
        let err = Address::read_from(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, Error::Address(_)));
    }

    #[tokio::test]
    async fn test_unknown_atyp_rejected() {
        let bytes = [0x05u8, 0x00, 0x00];
        let err = Address::read_from(&mut bytes.as_slice()).await.unwrap_err();
        assert!(matches!(err, Error::Address(_)));
    }

    #[test]
    fn test_destination_display() {
        let dest = Destination::new(Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 80);
        assert_eq!(dest.to_string(), "1.2.3.4:80");
    }
}
