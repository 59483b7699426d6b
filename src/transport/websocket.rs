//! WebSocket layer using tokio-tungstenite
//!
//! Performs the upgrade over the inner stream, then exposes the session as a
//! plain byte stream. A pump task per session moves bytes between an
//! in-memory duplex pipe and the WebSocket:
//!
//! ```text
//!   caller <-> WebSocketPipe <-duplex-> pump task <-> WebSocketStream <-> inner
//! ```
//!
//! Outbound bytes become binary messages. Inbound binary and text messages
//! are written to the pipe in arrival order. Ping and pong are answered by
//! tungstenite itself.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use super::{BoxedStream, Connector, SharedConnector, TransportError, WebSocketConfig};

/// Capacity of the in-memory pipe in each direction
const PIPE_CAPACITY: usize = 64 * 1024;

/// Largest chunk the pump reads from the caller per message
const PUMP_CHUNK: usize = 16 * 1024;

/// Upper bound on the close frame exchange once the pump stops
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket layer over an inner connector
#[derive(Debug)]
pub struct WebSocketLayer {
    inner: SharedConnector,
    config: WebSocketConfig,
    secure: bool,
    handshake_timeout: Duration,
}

impl WebSocketLayer {
    /// Create a WebSocket layer
    ///
    /// `secure` only selects the `wss` scheme in the request URI; encryption
    /// is the inner TLS layer's job.
    #[must_use]
    pub fn new(
        inner: SharedConnector,
        config: WebSocketConfig,
        secure: bool,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            config,
            secure,
            handshake_timeout,
        }
    }

    /// Upgrade request parameters
    #[must_use]
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Build the upgrade request with custom headers
    fn build_request(&self) -> Result<Request<()>, TransportError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let url = format!("{scheme}://{}{}", self.config.host, self.config.path);

        let mut builder = Request::builder()
            .uri(&url)
            .header("Host", self.config.host.as_str())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());

        for (name, value) in &self.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder
            .body(())
            .map_err(|e| TransportError::invalid_websocket_url(e.to_string()))
    }

    /// Connect and upgrade, keeping the concrete pipe type
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the inner connect, the request build or the
    /// upgrade handshake fails, or the handshake exceeds its timeout.
    pub async fn open(&self) -> Result<WebSocketPipe, TransportError> {
        let request = self.build_request()?;
        let stream = self.inner.connect().await?;

        let (ws, response) = timeout(
            self.handshake_timeout,
            tokio_tungstenite::client_async(request, stream),
        )
        .await
        .map_err(|_| {
            TransportError::timeout(
                format!("WebSocket handshake with {}", self.config.host),
                u64::try_from(self.handshake_timeout.as_millis()).unwrap_or(u64::MAX),
            )
        })?
        .map_err(|e| TransportError::websocket_handshake(e.to_string()))?;

        tracing::debug!(
            host = %self.config.host,
            path = %self.config.path,
            secure = self.secure,
            status = %response.status(),
            "WebSocket connection established"
        );

        Ok(WebSocketPipe::spawn(ws))
    }
}

#[async_trait]
impl Connector for WebSocketLayer {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let pipe = self.open().await?;
        Ok(Box::new(pipe))
    }

    fn describe(&self) -> String {
        format!(
            "websocket(host={}, path={}) -> {}",
            self.config.host,
            self.config.path,
            self.inner.describe()
        )
    }
}

/// Caller side of a WebSocket session
///
/// Reads yield inbound message payloads as a byte stream; writes are sent as
/// binary messages. Dropping the pipe or calling [`close`](Self::close) stops
/// the pump, which sends a normal close frame.
#[derive(Debug)]
pub struct WebSocketPipe {
    stream: DuplexStream,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl WebSocketPipe {
    fn spawn(ws: WebSocketStream<BoxedStream>) -> Self {
        let (local, remote) = duplex(PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump(ws, remote, cancel.clone(), Arc::clone(&closed)));

        Self {
            stream: local,
            cancel,
            closed,
        }
    }

    /// Stop the pump and close the WebSocket
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the pump has shut the session down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for WebSocketPipe {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl AsyncRead for WebSocketPipe {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for WebSocketPipe {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Move bytes between the pipe and the WebSocket until either side ends
///
/// Every send and pipe write races `cancel`, so a stalled peer cannot keep
/// the pump alive after [`WebSocketPipe::close`]. The inner stream is
/// dropped when this returns.
async fn pump(
    ws: WebSocketStream<BoxedStream>,
    pipe: DuplexStream,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
) {
    let (mut sink, mut source) = ws.split();
    let (mut reader, mut writer) = tokio::io::split(pipe);
    let mut buf = vec![0u8; PUMP_CHUNK];

    let reason = 'pump: loop {
        tokio::select! {
            () = cancel.cancelled() => break 'pump "closed locally".to_string(),

            read = reader.read(&mut buf) => match read {
                Ok(0) => break 'pump "caller shut down".to_string(),
                Ok(n) => {
                    let message = Message::Binary(buf[..n].to_vec());
                    tokio::select! {
                        () = cancel.cancelled() => break 'pump "closed locally".to_string(),
                        sent = sink.send(message) => if let Err(e) = sent {
                            break 'pump format!("send failed: {e}");
                        },
                    }
                }
                Err(e) => break 'pump format!("pipe read failed: {e}"),
            },

            frame = source.next() => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Close(_))) | None => break 'pump "remote closed".to_string(),
                    Some(Ok(_)) => continue 'pump,
                    Some(Err(e)) => break 'pump format!("receive failed: {e}"),
                };
                tokio::select! {
                    () = cancel.cancelled() => break 'pump "closed locally".to_string(),
                    written = writer.write_all(&data) => if let Err(e) = written {
                        break 'pump format!("pipe write failed: {e}");
                    },
                }
            }
        }
    };

    if closed.swap(true, Ordering::AcqRel) {
        return;
    }

    tracing::debug!(reason = %reason, "WebSocket pipe closing");

    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Borrowed(""),
    };
    let close = async {
        // Fails harmlessly when the remote already closed
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    };
    if timeout(CLOSE_TIMEOUT, close).await.is_err() {
        tracing::debug!("WebSocket close handshake timed out, dropping stream");
    }
    let _ = writer.shutdown().await;
}
