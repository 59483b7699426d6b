//! Disguise chain integration tests
//!
//! Each test builds a chain from a `TunnelConfig` exactly as the controller
//! does and connects it to a loopback mock of the front end the variant
//! expects: an HTTP proxy, a WebSocket endpoint, a TLS front or a SOCKS5
//! proxy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use disguise_tunnel::protect::default_protector;
use disguise_tunnel::transport::{build_chain, SharedConnector};
use disguise_tunnel::{ConnectionType, TransportError, TunnelConfig, TunnelTunables};

const BANNER: &[u8] = b"SSH-2.0-MockServer\r\n";

fn chain(config: &TunnelConfig) -> SharedConnector {
    build_chain(
        config,
        &TunnelTunables::default(),
        default_protector(),
        Duration::from_secs(2),
    )
    .unwrap()
}

/// Read until the blank line ending an HTTP head
async fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if socket.read_exact(&mut byte).await.is_err() {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

// ============================================================================
// Payload injection
// ============================================================================

async fn spawn_http_proxy(status_line: &'static str) -> (u16, Arc<Mutex<Option<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await;
        *record.lock().unwrap() = Some(head);

        socket
            .write_all(format!("{status_line}\r\nServer: mock\r\n\r\n").as_bytes())
            .await
            .unwrap();
        socket.write_all(BANNER).await.unwrap();
        let mut sink = [0u8; 256];
        while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
    });

    (port, seen)
}

fn payload_profile(proxy_port: u16) -> TunnelConfig {
    TunnelConfig::new("payload", "Payload", "ssh.internal", 22)
        .with_connection_type(ConnectionType::Payload)
        .with_proxy("127.0.0.1", proxy_port)
        .with_payload("CONNECT [host_port] HTTP/1.1[crlf]Host: [host_port][crlf]X-Online-Host: cdn.example.com[crlf][crlf]")
}

#[tokio::test]
async fn test_payload_chain_reaches_server_after_200() {
    let (port, seen) = spawn_http_proxy("HTTP/1.1 200 Connection established").await;

    let mut stream = chain(&payload_profile(port)).connect().await.unwrap();
    let mut banner = vec![0u8; BANNER.len()];
    stream.read_exact(&mut banner).await.unwrap();
    assert_eq!(banner, BANNER);

    let head = seen.lock().unwrap().clone().unwrap();
    assert_eq!(
        head,
        "CONNECT ssh.internal:22 HTTP/1.1\r\nHost: ssh.internal:22\r\nX-Online-Host: cdn.example.com\r\n\r\n"
    );
}

#[tokio::test]
async fn test_payload_chain_rejected_without_200() {
    let (port, _seen) = spawn_http_proxy("HTTP/1.1 403 Forbidden").await;

    let err = chain(&payload_profile(port)).connect().await.unwrap_err();
    match err {
        TransportError::HandshakeRejected { response } => {
            assert!(response.contains("403"), "response: {response}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Upstream SOCKS5
// ============================================================================

#[tokio::test]
async fn test_socks5_chain_connects_to_ssh_host() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        socket.read_exact(&mut greeting).await.unwrap();
        socket.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 5];
        socket.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
        let mut rest = vec![0u8; usize::from(head[4]) + 2];
        socket.read_exact(&mut rest).await.unwrap();

        socket
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        socket.write_all(BANNER).await.unwrap();

        let name_len = rest.len() - 2;
        let host = String::from_utf8(rest[..name_len].to_vec()).unwrap();
        let port = u16::from_be_bytes([rest[name_len], rest[name_len + 1]]);
        (host, port, socket)
    });

    let config = TunnelConfig::new("socks", "Socks", "ssh.internal", 2222)
        .with_connection_type(ConnectionType::Socks5)
        .with_proxy("127.0.0.1", port);

    let mut stream = chain(&config).connect().await.unwrap();
    let mut banner = vec![0u8; BANNER.len()];
    stream.read_exact(&mut banner).await.unwrap();
    assert_eq!(banner, BANNER);

    let (host, target_port, _socket) = server.await.unwrap();
    assert_eq!(host, "ssh.internal");
    assert_eq!(target_port, 2222);
}

// ============================================================================
// TLS with SNI override
// ============================================================================

/// Server name from a TLS ClientHello record
#[cfg(feature = "transport-tls")]
fn client_hello_sni(record: &[u8]) -> Option<String> {
    let u16_at = |at: usize| -> Option<usize> {
        Some(usize::from(u16::from_be_bytes([*record.get(at)?, *record.get(at + 1)?])))
    };

    if *record.first()? != 0x16 || *record.get(5)? != 0x01 {
        return None;
    }

    // record header 5, handshake header 4, version 2, random 32
    let mut at = 5 + 4 + 2 + 32;
    at += 1 + usize::from(*record.get(at)?);
    at += 2 + u16_at(at)?;
    at += 1 + usize::from(*record.get(at)?);

    let extensions_end = at + 2 + u16_at(at)?;
    at += 2;
    while at + 4 <= extensions_end {
        let kind = u16_at(at)?;
        let len = u16_at(at + 2)?;
        let data = at + 4;
        if kind == 0 {
            // list length 2, name type 1, name length 2
            let name_len = u16_at(data + 3)?;
            let name = record.get(data + 5..data + 5 + name_len)?;
            return String::from_utf8(name.to_vec()).ok();
        }
        at = data + len;
    }
    None
}

#[cfg(feature = "transport-tls")]
#[tokio::test]
async fn test_tls_chain_sends_sni_override() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 5];
        socket.read_exact(&mut header).await.unwrap();
        let len = usize::from(u16::from_be_bytes([header[3], header[4]]));
        let mut body = vec![0u8; len];
        socket.read_exact(&mut body).await.unwrap();

        let mut record = header.to_vec();
        record.extend_from_slice(&body);
        client_hello_sni(&record)
    });

    let config = TunnelConfig::new("tls", "TLS", "127.0.0.1", port)
        .with_connection_type(ConnectionType::Ssl)
        .with_sni("free.example.com");

    // The mock never completes the handshake
    let result = chain(&config).connect().await;
    assert!(result.is_err());

    let sni = server.await.unwrap();
    assert_eq!(sni.as_deref(), Some("free.example.com"));
}

// ============================================================================
// WebSocket framing
// ============================================================================

#[cfg(feature = "transport-ws")]
#[tokio::test]
async fn test_websocket_chain_carries_bytes() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let host = request
                .headers()
                .get("host")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let token = request
                .headers()
                .get("x-token")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            *record.lock().unwrap() = Some((request.uri().path().to_string(), host, token));
            Ok(response)
        };

        let mut ws = tokio_tungstenite::accept_hdr_async(socket, callback)
            .await
            .unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if message.is_binary() {
                ws.send(message).await.unwrap();
            } else if message.is_close() {
                break;
            }
        }
    });

    let config = TunnelConfig::new("ws", "WS", "127.0.0.1", port)
        .with_connection_type(ConnectionType::Payload)
        .with_payload(
            "GET /tunnel HTTP/1.1[crlf]Host: [host_port][crlf]Upgrade: websocket[crlf]X-Token: abc[crlf][crlf]",
        );
    assert_eq!(config.effective_connection_type(), ConnectionType::Websocket);

    let mut stream = chain(&config).connect().await.unwrap();
    stream.write_all(b"tunnel bytes").await.unwrap();
    stream.flush().await.unwrap();

    let mut echoed = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"tunnel bytes");

    let (path, host, token) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(path, "/tunnel");
    assert_eq!(host, format!("127.0.0.1:{port}"));
    assert_eq!(token, "abc");
}
