//! End-to-end tests driving the proxy through real sockets
//!
//! Each test runs the supervisor on an ephemeral port against an in-process
//! fixture standing in for the remote VLESS relay.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use vlproxy::{Proxy, ProxyConfig};

const TEST_UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

fn uuid_bytes() -> [u8; 16] {
    *uuid::Uuid::parse_str(TEST_UUID).unwrap().as_bytes()
}

fn tcp_config(server_port: u16) -> ProxyConfig {
    ProxyConfig::from_str(&format!(
        r#"
name: test-relay
type: vless
server: 127.0.0.1
port: {}
uuid: {}
udp: true
"#,
        server_port, TEST_UUID
    ))
    .unwrap()
}

fn ws_config(server_port: u16, path: &str) -> ProxyConfig {
    ProxyConfig::from_str(&format!(
        r#"
name: test-relay-ws
type: vless
server: 127.0.0.1
port: {}
uuid: {}
network: ws
ws-opts:
  path: {}
"#,
        server_port, TEST_UUID, path
    ))
    .unwrap()
}

async fn spawn_proxy(config: ProxyConfig) -> (SocketAddr, JoinHandle<()>) {
    let proxy = Proxy::listen(config, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = proxy.run().await;
    });
    (addr, handle)
}

async fn socks5_handshake(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

/// Read a VLESS request header with an IPv4 destination off a fixture
/// connection, returning (cmd, dst_ip, dst_port).
async fn read_vless_request(stream: &mut TcpStream) -> (u8, [u8; 4], u16) {
    let mut head = [0u8; 26];
    stream.read_exact(&mut head).await.unwrap();

    assert_eq!(head[0], 0x00, "VLESS version");
    assert_eq!(&head[1..17], &uuid_bytes(), "client uuid");
    assert_eq!(head[17], 0x00, "extension length");
    let cmd = head[18];
    let port = u16::from_be_bytes([head[19], head[20]]);
    assert_eq!(head[21], 0x01, "atyp IPv4");
    let ip = [head[22], head[23], head[24], head[25]];
    (cmd, ip, port)
}

#[tokio::test]
async fn socks5_handshake_accepts_no_auth() {
    let (proxy_addr, proxy) = spawn_proxy(tcp_config(1)).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut stream).await;

    proxy.abort();
}

#[tokio::test]
async fn socks5_handshake_rejects_other_methods() {
    let (proxy_addr, proxy) = spawn_proxy(tcp_config(1)).await;

    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    // offer only username/password
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    // nothing further: the proxy closes the channel
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).await.unwrap(), 0);

    proxy.abort();
}

#[tokio::test]
async fn connect_prepends_vless_header_and_tunnels() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    let fixture = tokio::spawn(async move {
        let (mut stream, _) = relay.accept().await.unwrap();

        let (cmd, ip, port) = read_vless_request(&mut stream).await;
        assert_eq!(cmd, 0x01, "TCP command");
        assert_eq!(ip, [1, 2, 3, 4]);
        assert_eq!(port, 80);

        let mut payload = [0u8; 4];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");

        // response header, then echo
        stream.write_all(&[0x00, 0x00]).await.unwrap();
        stream.write_all(b"pong").await.unwrap();
    });

    let (proxy_addr, proxy) = spawn_proxy(tcp_config(relay_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;

    // CONNECT 1.2.3.4:80
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1], "bound address is the relay");
    assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), relay_port);

    client.write_all(b"ping").await.unwrap();

    let mut back = [0u8; 4];
    client.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"pong");

    fixture.await.unwrap();
    proxy.abort();
}

#[tokio::test]
async fn connect_to_dead_relay_replies_refused() {
    // grab a port that refuses connections
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let (proxy_addr, proxy) = spawn_proxy(tcp_config(dead_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x05, "connection refused");

    proxy.abort();
}

#[tokio::test]
async fn bind_command_replies_unsupported() {
    let (proxy_addr, proxy) = spawn_proxy(tcp_config(1)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x07);

    proxy.abort();
}

#[tokio::test]
async fn unknown_atyp_replies_unsupported() {
    let (proxy_addr, proxy) = spawn_proxy(tcp_config(1)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;
    client
        .write_all(&[0x05, 0x01, 0x00, 0x05, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x08);

    proxy.abort();
}

async fn udp_associate(client: &mut TcpStream) -> u16 {
    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[0, 0, 0, 0]);
    u16::from_be_bytes([reply[8], reply[9]])
}

fn socks5_udp_packet(frag: u8, payload: &[u8]) -> Vec<u8> {
    // dst 8.8.8.8:53
    let mut packet = vec![0x00, 0x00, frag, 0x01, 8, 8, 8, 8, 0x00, 0x35];
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test]
async fn udp_associate_round_trip() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    let fixture = tokio::spawn(async move {
        let (mut stream, _) = relay.accept().await.unwrap();

        let (cmd, ip, port) = read_vless_request(&mut stream).await;
        assert_eq!(cmd, 0x02, "UDP command");
        assert_eq!(ip, [8, 8, 8, 8]);
        assert_eq!(port, 53);

        // length-prefixed datagram
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"dns-query");

        // response header plus one length-prefixed reply
        stream.write_all(&[0x00, 0x00]).await.unwrap();
        stream.write_all(&[0x00, 0x09]).await.unwrap();
        stream.write_all(b"dns-reply").await.unwrap();

        // hold the stream open until the test is done
        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let (proxy_addr, proxy) = spawn_proxy(tcp_config(relay_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;
    let relay_udp_port = udp_associate(&mut client).await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(
        &socks5_udp_packet(0x00, b"dns-query"),
        (proxy_addr.ip(), relay_udp_port),
    )
    .await
    .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = udp.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..10], &[0x00, 0x00, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35]);
    assert_eq!(&buf[10..n], b"dns-reply");

    drop(client); // control channel closure tears the association down
    proxy.abort();
    fixture.abort();
}

#[tokio::test]
async fn udp_fragmented_datagram_is_dropped() {
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    let fixture = tokio::spawn(async move {
        let (mut stream, _) = relay.accept().await.unwrap();
        let (cmd, _, _) = read_vless_request(&mut stream).await;
        assert_eq!(cmd, 0x02);

        // the first framed datagram must be the unfragmented one
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.unwrap();
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");

        stream.write_all(&[0x00, 0x00, 0x00, 0x02, b'o', b'k']).await.unwrap();

        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let (proxy_addr, proxy) = spawn_proxy(tcp_config(relay_port)).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;
    let relay_udp_port = udp_associate(&mut client).await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = (proxy_addr.ip(), relay_udp_port);

    // fragment byte set: must be discarded without poisoning the flow
    udp.send_to(&socks5_udp_packet(0x01, b"fragmented"), target)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    udp.send_to(&socks5_udp_packet(0x00, b"hello"), target)
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = udp.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[10..n], b"ok");

    drop(client);
    proxy.abort();
    fixture.abort();
}

/// Unmask and return the payload of a single client frame, asserting its
/// shape on the way.
async fn read_ws_binary_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x82, "FIN + BINARY");
    assert_ne!(head[1] & 0x80, 0, "client frames are masked");

    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).await.unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).await.unwrap();
            u64::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };

    let mut key = [0u8; 4];
    stream.read_exact(&mut key).await.unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
    payload
}

fn ws_server_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x82u8];
    match payload.len() {
        n if n < 126 => frame.push(n as u8),
        n if n <= 65535 => {
            frame.push(126);
            frame.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            frame.push(127);
            frame.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    frame
}

#[tokio::test]
async fn websocket_upgrade_and_binary_tunnel() {
    use base64::Engine;
    use sha1::{Digest, Sha1};

    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();

    let fixture = tokio::spawn(async move {
        let (mut stream, _) = relay.accept().await.unwrap();

        // upgrade request
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
            if head.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        let request = String::from_utf8(head).unwrap();
        assert!(request.starts_with("GET /p HTTP/1.1\r\n"));
        assert!(request.contains("Upgrade: websocket"));
        assert!(request.contains("Connection: Upgrade"));
        assert!(request.contains("Sec-WebSocket-Version: 13"));

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
        hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
        let accept = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());

        stream
            .write_all(
                format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {}\r\n\r\n",
                    accept
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        // first binary frame carries the VLESS header plus the payload
        let payload = read_ws_binary_frame(&mut stream).await;
        assert_eq!(payload.len(), 26 + 200);
        assert_eq!(payload[0], 0x00);
        assert_eq!(&payload[1..17], &uuid_bytes());
        assert_eq!(payload[18], 0x01);
        assert_eq!(&payload[26..], &[0x42u8; 200][..]);

        // tunnel a reply back
        let mut response = vec![0x00, 0x00];
        response.extend_from_slice(b"ws-pong");
        stream.write_all(&ws_server_frame(&response)).await.unwrap();

        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let (proxy_addr, proxy) = spawn_proxy(ws_config(relay_port, "/p")).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    socks5_handshake(&mut client).await;
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(&[0x42u8; 200]).await.unwrap();

    let mut back = [0u8; 7];
    client.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"ws-pong");

    drop(client);
    fixture.await.unwrap();
    proxy.abort();
}
