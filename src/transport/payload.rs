//! HTTP payload injection layer
//!
//! Sends a user-supplied request template over the inner stream before the
//! secure channel starts, then requires the proxy to answer with a status
//! line containing ` 200 `. Templates use these placeholders:
//!
//! | Token | Replaced with |
//! |-------|---------------|
//! | `[host_port]` | `ssh_host:ssh_port` |
//! | `[ssh_host]` | secure-channel host |
//! | `[ssh_port]` | secure-channel port |
//! | `[crlf]` | CR LF |
//! | `\r\n` (literal backslashes) | CR LF |

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use super::{BoxedStream, Connector, SharedConnector, TransportError};

/// Upper bound on the proxy's response head
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Substitute placeholders in `template`
///
/// # Example
///
/// ```
/// use disguise_tunnel::transport::render_payload;
///
/// let rendered = render_payload("CONNECT [host_port] HTTP/1.1[crlf][crlf]", "10.0.0.1", 22);
/// assert_eq!(rendered, "CONNECT 10.0.0.1:22 HTTP/1.1\r\n\r\n");
/// ```
#[must_use]
pub fn render_payload(template: &str, ssh_host: &str, ssh_port: u16) -> String {
    let port = ssh_port.to_string();
    template
        .replace("[host_port]", &format!("{ssh_host}:{port}"))
        .replace("[ssh_host]", ssh_host)
        .replace("[ssh_port]", &port)
        .replace("[crlf]", "\r\n")
        .replace("\\r\\n", "\r\n")
}

/// Payload injection over an inner connector
#[derive(Debug)]
pub struct PayloadLayer {
    inner: SharedConnector,
    rendered: String,
    response_timeout: Duration,
}

impl PayloadLayer {
    /// Create the layer, rendering `template` for the secure-channel endpoint
    #[must_use]
    pub fn new(
        inner: SharedConnector,
        template: &str,
        ssh_host: &str,
        ssh_port: u16,
        response_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            rendered: render_payload(template, ssh_host, ssh_port),
            response_timeout,
        }
    }

    /// The request written to the proxy
    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    /// Read the response head one byte at a time so nothing after the blank
    /// line is consumed
    async fn read_response_head(stream: &mut BoxedStream) -> Result<Vec<u8>, TransportError> {
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];

        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                if head.is_empty() {
                    return Err(TransportError::rejected("proxy closed without responding"));
                }
                // Response truncated by EOF; judge what arrived
                return Ok(head);
            }
            head.push(byte[0]);

            if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
                return Ok(head);
            }
            if head.len() >= MAX_RESPONSE_HEAD {
                return Err(TransportError::rejected(format!(
                    "response head exceeds {MAX_RESPONSE_HEAD} bytes"
                )));
            }
        }
    }
}

#[async_trait]
impl Connector for PayloadLayer {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let mut stream = self.inner.connect().await?;

        tracing::debug!(bytes = self.rendered.len(), "Sending payload");
        stream.write_all(self.rendered.as_bytes()).await?;
        stream.flush().await?;

        let head = timeout(self.response_timeout, Self::read_response_head(&mut stream))
            .await
            .map_err(|_| {
                TransportError::timeout(
                    "payload response",
                    u64::try_from(self.response_timeout.as_millis()).unwrap_or(u64::MAX),
                )
            })??;

        let text = String::from_utf8_lossy(&head);
        let status_line = text.lines().next().unwrap_or_default().trim().to_string();
        if !status_line.contains(" 200 ") && !status_line.ends_with(" 200") {
            return Err(TransportError::rejected(status_line));
        }

        tracing::debug!(status = %status_line, "Proxy accepted payload");
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("payload -> {}", self.inner.describe())
    }
}
