//! WebSocket transport
//!
//! Client side of RFC 6455 over an already-established stream: the HTTP/1.1
//! upgrade handshake, and a stream wrapper that frames writes as masked
//! BINARY frames and unframes reads. PING is answered with PONG, CLOSE
//! surfaces as EOF, TEXT and fragmented data frames are protocol errors.

use crate::{Error, Result};
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use sha1::{Digest, Sha1};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Largest accepted single-frame payload (2^31 bytes).
const MAX_FRAME_PAYLOAD: u64 = 1 << 31;

/// Outgoing bytes buffered beyond this apply backpressure to writers.
const WRITE_BACKLOG_LIMIT: usize = 256 * 1024;

const WS_ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::protocol(format!("Unknown WebSocket opcode: {}", value))),
        }
    }
}

/// WebSocket frame header
#[derive(Debug)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: bool,
    pub payload_len: u64,
    pub masking_key: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Parse a header from the front of `buf`. Returns the header and its
    /// encoded length, or `None` if more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let fin = buf[0] & 0x80 != 0;
        let opcode = OpCode::try_from(buf[0] & 0x0F)?;
        let mask = buf[1] & 0x80 != 0;
        let len = buf[1] & 0x7F;

        let mut offset = 2usize;
        let payload_len = match len {
            126 => {
                if buf.len() < offset + 2 {
                    return Ok(None);
                }
                let v = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as u64;
                offset += 2;
                v
            }
            127 => {
                if buf.len() < offset + 8 {
                    return Ok(None);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[offset..offset + 8]);
                offset += 8;
                u64::from_be_bytes(bytes)
            }
            _ => len as u64,
        };

        let masking_key = if mask {
            if buf.len() < offset + 4 {
                return Ok(None);
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin,
                opcode,
                mask,
                payload_len,
                masking_key,
            },
            offset,
        )))
    }

    /// Encode the header, selecting the smallest sufficient length form.
    pub fn write_to(&self, buf: &mut BytesMut) {
        let mut first_byte = if self.fin { 0x80 } else { 0 };
        first_byte |= self.opcode as u8;
        buf.put_u8(first_byte);

        let mut second_byte = if self.mask { 0x80 } else { 0 };
        if self.payload_len < 126 {
            second_byte |= self.payload_len as u8;
            buf.put_u8(second_byte);
        } else if self.payload_len <= u16::MAX as u64 {
            second_byte |= 126;
            buf.put_u8(second_byte);
            buf.put_u16(self.payload_len as u16);
        } else {
            second_byte |= 127;
            buf.put_u8(second_byte);
            buf.put_u64(self.payload_len);
        }

        if let Some(key) = self.masking_key {
            buf.put_slice(&key);
        }
    }
}

/// Apply WebSocket masking
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    apply_mask_offset(data, key, 0);
}

fn apply_mask_offset(data: &mut [u8], key: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[(offset + i) % 4];
    }
}

/// Generate a fresh random masking key
pub fn generate_mask_key() -> [u8; 4] {
    rand::random()
}

fn write_frame_into(buf: &mut BytesMut, opcode: OpCode, payload: &[u8]) {
    let masking_key = generate_mask_key();
    let header = FrameHeader {
        fin: true,
        opcode,
        mask: true,
        payload_len: payload.len() as u64,
        masking_key: Some(masking_key),
    };
    header.write_to(buf);

    let start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[start..], masking_key);
}

fn protocol_io_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

enum ReadState {
    Header,
    Data {
        remaining: u64,
        mask: Option<[u8; 4]>,
        mask_offset: usize,
    },
    Control {
        opcode: OpCode,
        len: usize,
        mask: Option<[u8; 4]>,
    },
}

/// Stream wrapper speaking client-side WebSocket framing.
pub struct WebSocketStream<S> {
    inner: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    state: ReadState,
    peer_closed: bool,
    close_sent: bool,
}

impl<S> WebSocketStream<S> {
    pub fn new(inner: S) -> Self {
        WebSocketStream {
            inner,
            read_buf: BytesMut::with_capacity(8 * 1024),
            write_buf: BytesMut::new(),
            state: ReadState::Header,
            peer_closed: false,
            close_sent: false,
        }
    }
}

impl<S: AsyncWrite + Unpin> WebSocketStream<S> {
    fn poll_flush_backlog(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "WebSocket transport closed",
                    )))
                }
                Poll::Ready(Ok(n)) => self.write_buf.advance(n),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WebSocketStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.peer_closed || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let ReadState::Data { remaining: 0, .. } = this.state {
                this.state = ReadState::Header;
            }

            match this.state {
                ReadState::Data {
                    ref mut remaining,
                    mask,
                    ref mut mask_offset,
                } => {
                    if !this.read_buf.is_empty() {
                        let n = buf
                            .remaining()
                            .min(this.read_buf.len())
                            .min(*remaining as usize);
                        let mut chunk = this.read_buf.split_to(n);
                        if let Some(key) = mask {
                            apply_mask_offset(&mut chunk, key, *mask_offset);
                        }
                        *mask_offset += n;
                        *remaining -= n as u64;
                        buf.put_slice(&chunk);
                        return Poll::Ready(Ok(()));
                    }
                }
                ReadState::Control { opcode, len, mask } => {
                    if this.read_buf.len() >= len {
                        let mut payload = this.read_buf.split_to(len);
                        if let Some(key) = mask {
                            apply_mask(&mut payload, key);
                        }
                        this.state = ReadState::Header;
                        match opcode {
                            OpCode::Ping => {
                                write_frame_into(&mut this.write_buf, OpCode::Pong, &payload);
                                // best effort; remaining bytes go out with the
                                // next write or flush
                                if let Poll::Ready(Err(e)) = this.poll_flush_backlog(cx) {
                                    return Poll::Ready(Err(e));
                                }
                            }
                            OpCode::Pong => {}
                            _ => {
                                this.peer_closed = true;
                                return Poll::Ready(Ok(()));
                            }
                        }
                        continue;
                    }
                }
                ReadState::Header => {
                    match FrameHeader::parse(&this.read_buf) {
                        Err(e) => return Poll::Ready(Err(protocol_io_error(e.to_string()))),
                        Ok(Some((header, consumed))) => {
                            this.read_buf.advance(consumed);
                            match header.opcode {
                                OpCode::Binary => {
                                    if !header.fin {
                                        return Poll::Ready(Err(protocol_io_error(
                                            "fragmented WebSocket frame".to_string(),
                                        )));
                                    }
                                    if header.payload_len > MAX_FRAME_PAYLOAD {
                                        return Poll::Ready(Err(protocol_io_error(format!(
                                            "WebSocket frame too large: {}",
                                            header.payload_len
                                        ))));
                                    }
                                    this.state = ReadState::Data {
                                        remaining: header.payload_len,
                                        mask: header.masking_key,
                                        mask_offset: 0,
                                    };
                                }
                                OpCode::Continuation => {
                                    return Poll::Ready(Err(protocol_io_error(
                                        "fragmented WebSocket frame".to_string(),
                                    )))
                                }
                                OpCode::Text => {
                                    return Poll::Ready(Err(protocol_io_error(
                                        "WebSocket text frame not supported".to_string(),
                                    )))
                                }
                                opcode => {
                                    if !header.fin || header.payload_len > 125 {
                                        return Poll::Ready(Err(protocol_io_error(
                                            "invalid WebSocket control frame".to_string(),
                                        )));
                                    }
                                    this.state = ReadState::Control {
                                        opcode,
                                        len: header.payload_len as usize,
                                        mask: header.masking_key,
                                    };
                                }
                            }
                            continue;
                        }
                        Ok(None) => {}
                    }
                }
            }

            // Need more bytes from the transport
            let mut tmp = [0u8; 8 * 1024];
            let mut read_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        return if matches!(this.state, ReadState::Header)
                            && this.read_buf.is_empty()
                        {
                            // clean EOF between frames
                            Poll::Ready(Ok(()))
                        } else {
                            Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "WebSocket stream ended mid-frame",
                            )))
                        };
                    }
                    this.read_buf.extend_from_slice(filled);
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WebSocketStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if this.write_buf.len() >= WRITE_BACKLOG_LIMIT {
            match this.poll_flush_backlog(cx) {
                Poll::Pending => {
                    if this.write_buf.len() >= WRITE_BACKLOG_LIMIT {
                        return Poll::Pending;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {}
            }
        }

        write_frame_into(&mut this.write_buf, OpCode::Binary, buf);

        // opportunistic flush; leftovers go out on poll_flush
        if let Poll::Ready(Err(e)) = this.poll_flush_backlog(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_backlog(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.close_sent {
            write_frame_into(&mut this.write_buf, OpCode::Close, &[]);
            this.close_sent = true;
        }
        match this.poll_flush_backlog(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Perform the WebSocket client handshake over an established stream.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    path: &str,
    extra_headers: &[(String, String)],
) -> Result<()> {
    let ws_key: [u8; 16] = rand::thread_rng().gen();
    let ws_key_b64 = base64::engine::general_purpose::STANDARD.encode(ws_key);

    let has_host_override = extra_headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("host"));

    let mut request = format!("GET {} HTTP/1.1\r\n", path);
    if !has_host_override {
        request.push_str(&format!("Host: {}\r\n", host));
    }
    request.push_str(&format!(
        "Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        ws_key_b64
    ));
    for (key, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", key, value));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;

    // Read the response head
    let mut response = String::new();
    let mut buf = [0u8; 1];
    loop {
        stream.read_exact(&mut buf).await?;
        response.push(buf[0] as char);
        if response.ends_with("\r\n\r\n") {
            break;
        }
        if response.len() > 4096 {
            return Err(Error::protocol("WebSocket upgrade response too long"));
        }
    }

    if !response.starts_with("HTTP/1.1 101") {
        return Err(Error::protocol(format!(
            "WebSocket upgrade failed: {}",
            response.lines().next().unwrap_or("unknown")
        )));
    }

    if !response.to_lowercase().contains("connection: upgrade") {
        return Err(Error::protocol("WebSocket upgrade response missing Connection: Upgrade"));
    }

    // Verify Sec-WebSocket-Accept
    let expected_accept = {
        let mut hasher = Sha1::new();
        hasher.update(ws_key_b64.as_bytes());
        hasher.update(WS_ACCEPT_GUID);
        base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
    };

    let accept_header = response
        .lines()
        .find(|line| line.to_lowercase().starts_with("sec-websocket-accept:"))
        .and_then(|line| line.split(':').nth(1))
        .map(|v| v.trim());

    if accept_header != Some(&expected_accept) {
        return Err(Error::protocol("Invalid Sec-WebSocket-Accept"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_client_frame<S: AsyncRead + Unpin>(stream: &mut S) -> (OpCode, Vec<u8>) {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        let opcode = OpCode::try_from(head[0] & 0x0F).unwrap();
        assert!(head[1] & 0x80 != 0, "client frames must be masked");

        let len = match head[1] & 0x7F {
            126 => {
                let mut b = [0u8; 2];
                stream.read_exact(&mut b).await.unwrap();
                u16::from_be_bytes(b) as usize
            }
            127 => {
                let mut b = [0u8; 8];
                stream.read_exact(&mut b).await.unwrap();
                u64::from_be_bytes(b) as usize
            }
            n => n as usize,
        };

        let mut key = [0u8; 4];
        stream.read_exact(&mut key).await.unwrap();
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        apply_mask(&mut payload, key);
        (opcode, payload)
    }

    fn server_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        FrameHeader {
            fin: true,
            opcode,
            mask: false,
            payload_len: payload.len() as u64,
            masking_key: None,
        }
        .write_to(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn test_opcode() {
        assert_eq!(OpCode::try_from(0x1).unwrap(), OpCode::Text);
        assert_eq!(OpCode::try_from(0x2).unwrap(), OpCode::Binary);
        assert!(OpCode::try_from(0xF).is_err());
    }

    #[test]
    fn test_masking() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let mut data = vec![0x00, 0x00, 0x00, 0x00, 0x00];
        apply_mask(&mut data, key);
        assert_eq!(data, vec![0x12, 0x34, 0x56, 0x78, 0x12]);
    }

    #[test]
    fn test_length_form_selection() {
        let mut buf = BytesMut::new();
        FrameHeader {
            fin: true,
            opcode: OpCode::Binary,
            mask: false,
            payload_len: 100,
            masking_key: None,
        }
        .write_to(&mut buf);
        assert_eq!(buf[0], 0x82); // FIN + Binary
        assert_eq!(buf[1], 100);
        assert_eq!(buf.len(), 2);

        let mut buf = BytesMut::new();
        FrameHeader {
            fin: true,
            opcode: OpCode::Binary,
            mask: false,
            payload_len: 200,
            masking_key: None,
        }
        .write_to(&mut buf);
        assert_eq!(buf[1], 126);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 200);

        let mut buf = BytesMut::new();
        FrameHeader {
            fin: true,
            opcode: OpCode::Binary,
            mask: false,
            payload_len: 70_000,
            masking_key: None,
        }
        .write_to(&mut buf);
        assert_eq!(buf[1], 127);
        assert_eq!(
            u64::from_be_bytes([buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9]]),
            70_000
        );
    }

    #[test]
    fn test_header_parse_incomplete() {
        assert!(FrameHeader::parse(&[0x82]).unwrap().is_none());
        assert!(FrameHeader::parse(&[0x82, 126, 0x01]).unwrap().is_none());

        let (header, consumed) = FrameHeader::parse(&[0x82, 126, 0x00, 0xC8, 0xFF])
            .unwrap()
            .unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(header.payload_len, 200);
        assert!(header.fin);
    }

    #[tokio::test]
    async fn test_write_produces_masked_binary_frame() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut ws = WebSocketStream::new(client);

        let payload = vec![0xABu8; 200];
        ws.write_all(&payload).await.unwrap();
        ws.flush().await.unwrap();

        let (opcode, received) = read_client_frame(&mut server).await;
        assert_eq!(opcode, OpCode::Binary);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_read_unframes_binary() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut ws = WebSocketStream::new(client);

        server
            .write_all(&server_frame(OpCode::Binary, b"hello"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut ws = WebSocketStream::new(client);

        let mut bytes = server_frame(OpCode::Ping, b"probe");
        bytes.extend_from_slice(&server_frame(OpCode::Binary, b"data"));
        server.write_all(&bytes).await.unwrap();

        let mut buf = [0u8; 16];
        let n = ws.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
        ws.flush().await.unwrap();

        let (opcode, payload) = read_client_frame(&mut server).await;
        assert_eq!(opcode, OpCode::Pong);
        assert_eq!(payload, b"probe");
    }

    #[tokio::test]
    async fn test_close_surfaces_as_eof() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut ws = WebSocketStream::new(client);

        server
            .write_all(&server_frame(OpCode::Close, &[]))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(ws.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_text_frame_rejected() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut ws = WebSocketStream::new(client);

        server
            .write_all(&server_frame(OpCode::Text, b"nope"))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let err = ws.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_handshake_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let server_task = tokio::spawn(async move {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                server.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
                if head.ends_with(b"\r\n\r\n") {
                    break;
                }
            }
            let request = String::from_utf8(head).unwrap();
            assert!(request.starts_with("GET /tunnel HTTP/1.1\r\n"));
            assert!(request.contains("Upgrade: websocket"));

            let key = request
                .lines()
                .find(|l| l.starts_with("Sec-WebSocket-Key:"))
                .unwrap()
                .split(':')
                .nth(1)
                .unwrap()
                .trim()
                .to_string();
            let mut hasher = Sha1::new();
            hasher.update(key.as_bytes());
            hasher.update(WS_ACCEPT_GUID);
            let accept = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());

            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                accept
            );
            server.write_all(response.as_bytes()).await.unwrap();
        });

        handshake(&mut client, "example.com", "/tunnel", &[])
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_upgrade() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let mut sink = vec![0u8; 4096];
            let _ = server.read(&mut sink).await;
            let _ = server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let err = handshake(&mut client, "example.com", "/", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
