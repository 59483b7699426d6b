//! Shared fixtures: mock SOCKS5 forwarder, mock secure channel, event
//! helpers and frame builders

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use disguise_tunnel::channel::{ConnectRequest, SecureChannel, SecureChannelFactory};
use disguise_tunnel::packet::fill_ipv4_checksum;
use disguise_tunnel::transport::BoxedStream;
use disguise_tunnel::{ChannelError, ConnectionState, TunnelEvent};

// ============================================================================
// SOCKS5 Protocol Constants
// ============================================================================

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const REPLY_SUCCEEDED: u8 = 0x00;

// ============================================================================
// Mock SOCKS5 forwarder
// ============================================================================

/// Loopback SOCKS5 server that echoes every CONNECTed stream
#[derive(Debug)]
pub struct EchoForwarder {
    /// Bound port
    pub port: u16,
    /// Accepted connections
    pub connections: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl EchoForwarder {
    /// Bind on 127.0.0.1:`port` (0 for ephemeral) and start accepting
    pub async fn spawn(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let connections = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&connections);
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { break };
                        counter.fetch_add(1, Ordering::SeqCst);
                        let token = token.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                () = token.cancelled() => {}
                                _ = serve_echo(socket) => {}
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            port,
            connections,
            cancel,
        })
    }

    /// Stop accepting and drop every connection
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EchoForwarder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_echo(mut socket: TcpStream) -> io::Result<()> {
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    let mut methods = vec![0u8; usize::from(header[1])];
    socket.read_exact(&mut methods).await?;
    socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await?;

    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    match request[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            socket.read_exact(&mut rest).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut rest = vec![0u8; usize::from(len[0]) + 2];
            socket.read_exact(&mut rest).await?;
        }
        _ => return Ok(()),
    }

    socket
        .write_all(&[SOCKS5_VERSION, REPLY_SUCCEEDED, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 0])
        .await?;

    let (mut reader, mut writer) = socket.split();
    tokio::io::copy(&mut reader, &mut writer).await?;
    Ok(())
}

// ============================================================================
// Mock secure-channel server
// ============================================================================

/// Accepts connections, sends an SSH-style banner and holds them open
pub async fn spawn_banner_server() -> io::Result<(SocketAddr, Arc<AtomicU32>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if socket.write_all(b"SSH-2.0-MockServer\r\n").await.is_err() {
                    return;
                }
                let mut sink = [0u8; 1024];
                while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });

    Ok((addr, accepted))
}

/// Port nobody listens on
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Mock secure channel
// ============================================================================

/// How mock channels behave after the transport connects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBehavior {
    /// Read the banner, then accept
    Accept,
    /// Reject the credentials
    RejectAuth,
}

/// Channel that connects through the real transport chain and serves
/// dynamic forwarding with an [`EchoForwarder`]
pub struct MockChannel {
    behavior: ChannelBehavior,
    connected: AtomicBool,
    stream: Mutex<Option<BoxedStream>>,
    forwarder: Mutex<Option<EchoForwarder>>,
    closed: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl MockChannel {
    fn new(behavior: ChannelBehavior) -> Self {
        Self {
            behavior,
            connected: AtomicBool::new(false),
            stream: Mutex::new(None),
            forwarder: Mutex::new(None),
            closed: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// Simulate the server ending the session
    pub fn drop_session(&self, reason: &str) {
        self.reason.lock().unwrap().get_or_insert_with(|| reason.to_string());
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
    }
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel")
            .field("behavior", &self.behavior)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecureChannel for MockChannel {
    async fn connect(&self, request: ConnectRequest) -> Result<(), ChannelError> {
        let mut stream = request.transport.connect().await?;

        let mut banner = [0u8; 4];
        stream
            .read_exact(&mut banner)
            .await
            .map_err(|e| ChannelError::disconnected(e.to_string()))?;
        if &banner != b"SSH-" {
            return Err(ChannelError::library("unexpected server banner"));
        }

        if self.behavior == ChannelBehavior::RejectAuth {
            return Err(ChannelError::authentication(format!(
                "user {} rejected",
                request.credentials.username
            )));
        }

        *self.stream.lock().unwrap() = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_dynamic_forwarding(&self, port: u16) -> Result<u16, ChannelError> {
        let forwarder = EchoForwarder::spawn(port)
            .await
            .map_err(|e| ChannelError::forwarding(port, e.to_string()))?;
        let bound = forwarder.port;
        *self.forwarder.lock().unwrap() = Some(forwarder);
        Ok(bound)
    }

    async fn disconnect(&self) {
        self.drop_session("disconnected");
        if let Some(forwarder) = self.forwarder.lock().unwrap().take() {
            forwarder.close();
        }
        self.stream.lock().unwrap().take();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn closed(&self) -> String {
        self.closed.cancelled().await;
        self.reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "closed".to_string())
    }
}

/// Factory remembering every channel it hands out
#[derive(Debug)]
pub struct MockFactory {
    behavior: ChannelBehavior,
    created: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockFactory {
    pub fn new(behavior: ChannelBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            created: Mutex::new(Vec::new()),
        })
    }

    /// Channels created so far
    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recently created channel
    pub fn last(&self) -> Option<Arc<MockChannel>> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl SecureChannelFactory for MockFactory {
    fn create(&self) -> Arc<dyn SecureChannel> {
        let channel = Arc::new(MockChannel::new(self.behavior));
        self.created.lock().unwrap().push(Arc::clone(&channel));
        channel
    }
}

// ============================================================================
// Event helpers
// ============================================================================

/// Collect state events until `last` arrives or `wait` passes
pub async fn collect_states(
    events: &mut broadcast::Receiver<TunnelEvent>,
    last: ConnectionState,
    wait: Duration,
) -> Vec<(ConnectionState, Option<String>)> {
    let mut states = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;

    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let TunnelEvent::State { state, reason } = event {
            let done = state == last;
            states.push((state, reason));
            if done {
                break;
            }
        }
    }
    states
}

/// Poll `condition` until it holds or `wait` passes
pub async fn wait_until<F>(mut condition: F, wait: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// ============================================================================
// Frame builders
// ============================================================================

/// IPv4/TCP frame with ACK|PSH set
pub fn tcp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut segment = vec![0u8; 20];
    segment[0..2].copy_from_slice(&src.port().to_be_bytes());
    segment[2..4].copy_from_slice(&dst.port().to_be_bytes());
    segment[4..8].copy_from_slice(&1u32.to_be_bytes());
    segment[12] = 0x50;
    segment[13] = 0x18;
    segment[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes());
    segment.extend_from_slice(payload);
    ipv4_frame(6, src, dst, &segment)
}

/// IPv4/UDP frame
pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut datagram = vec![0u8; 8];
    datagram[0..2].copy_from_slice(&src.port().to_be_bytes());
    datagram[2..4].copy_from_slice(&dst.port().to_be_bytes());
    let len = u16::try_from(8 + payload.len()).unwrap();
    datagram[4..6].copy_from_slice(&len.to_be_bytes());
    datagram.extend_from_slice(payload);
    ipv4_frame(17, src, dst, &datagram)
}

fn ipv4_frame(protocol: u8, src: SocketAddrV4, dst: SocketAddrV4, transport: &[u8]) -> Vec<u8> {
    let total = u16::try_from(20 + transport.len()).unwrap();
    let mut frame = vec![0u8; 20];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&total.to_be_bytes());
    frame[8] = 64;
    frame[9] = protocol;
    frame[12..16].copy_from_slice(&src.ip().octets());
    frame[16..20].copy_from_slice(&dst.ip().octets());
    fill_ipv4_checksum(&mut frame);
    frame.extend_from_slice(transport);
    frame
}
