//! Serialized writes to the virtual interface

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared write half of the virtual interface
///
/// Every reply reader writes through one mutex, so each frame reaches the
/// interface whole. Frames from different flows have no relative order.
#[derive(Clone)]
pub struct InterfaceWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl InterfaceWriter {
    /// Wrap the interface's write half
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write one complete frame
    ///
    /// # Errors
    ///
    /// Returns the interface's I/O error.
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    /// Shut the interface's write half down
    ///
    /// # Errors
    ///
    /// Returns the interface's I/O error.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}

impl fmt::Debug for InterfaceWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceWriter")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}
