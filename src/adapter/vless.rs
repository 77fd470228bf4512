//! VLESS protocol framing
//!
//! VLESS is a minimal stateless tunneling protocol: a request header
//! identifies the client by UUID and names the destination, a response
//! header acknowledges it, and everything after is raw tunneled data.
//! Encryption is left entirely to the transport.

use crate::common::net::{Address, Destination};
use crate::common::socks::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// VLESS protocol version
pub const VLESS_VERSION: u8 = 0x00;

/// VLESS command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VlessCommand {
    Tcp = 0x01,
    Udp = 0x02,
    // 0x03 is MUX, unsupported
}

/// Stateful VLESS framing for one flow.
///
/// The request header goes out exactly once, immediately before the first
/// payload byte; the response header is stripped exactly once from the
/// front of the inbound stream. In UDP mode every payload is additionally
/// framed with a 2-byte big-endian length prefix.
pub struct VlessCodec {
    uuid: Uuid,
    command: VlessCommand,
    head_sent: bool,
    head_received: bool,
    pending: BytesMut,
}

impl VlessCodec {
    pub fn new(uuid: Uuid, command: VlessCommand) -> Self {
        VlessCodec {
            uuid,
            command,
            head_sent: false,
            head_received: false,
            pending: BytesMut::new(),
        }
    }

    /// Frame a payload for the remote.
    ///
    /// In UDP mode `destination` is the per-datagram destination; the first
    /// call bakes it into the request header.
    pub fn seal(&mut self, payload: &[u8], destination: &Destination) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(payload.len() + 64);

        if !self.head_sent {
            self.encode_request_header(&mut out, destination)?;
            self.head_sent = true;
        }

        if self.command == VlessCommand::Udp {
            let len = u16::try_from(payload.len())
                .map_err(|_| Error::protocol("UDP payload exceeds 65535 bytes"))?;
            out.put_u16(len);
        }
        out.put_slice(payload);

        Ok(out.freeze())
    }

    /// Strip the response header from the inbound stream.
    ///
    /// The header may arrive split across chunks; bytes are held back until
    /// `2 + ext_len` are available, then everything flows through untouched.
    /// Returns an empty buffer while the header is still incomplete.
    pub fn open(&mut self, chunk: &[u8]) -> Result<Bytes> {
        if self.head_received {
            return Ok(Bytes::copy_from_slice(chunk));
        }

        self.pending.extend_from_slice(chunk);
        if self.pending.len() < 2 {
            return Ok(Bytes::new());
        }

        let version = self.pending[0];
        if version != VLESS_VERSION {
            return Err(Error::protocol(format!(
                "Unexpected VLESS response version: {}",
                version
            )));
        }

        let ext_len = self.pending[1] as usize;
        if self.pending.len() < 2 + ext_len {
            return Ok(Bytes::new());
        }

        self.head_received = true;
        let payload = self.pending.split_off(2 + ext_len).freeze();
        self.pending = BytesMut::new();
        Ok(payload)
    }

    fn encode_request_header(&self, buf: &mut BytesMut, destination: &Destination) -> Result<()> {
        buf.put_u8(VLESS_VERSION);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u8(0); // no addons
        buf.put_u8(self.command as u8);
        buf.put_u16(destination.port);

        match &destination.address {
            Address::Ipv4(ip) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.is_empty() {
                    return Err(Error::address("Empty domain name"));
                }
                if bytes.len() > 255 {
                    return Err(Error::address("Domain name too long"));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(bytes.len() as u8);
                buf.put_slice(bytes);
            }
        }
        Ok(())
    }
}

/// Re-splits the concatenated `len || payload` frames of a VLESS UDP stream
/// back into datagrams.
#[derive(Default)]
pub struct DatagramDecoder {
    buf: BytesMut,
}

impl DatagramDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);

        let mut out = Vec::new();
        while self.buf.len() >= 2 {
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if self.buf.len() < 2 + len {
                break;
            }
            self.buf.advance(2);
            out.push(self.buf.split_to(len).freeze());
        }
        out
    }
}
