//! Virtual interface pump
//!
//! Reads one frame per read from the interface, parses it and hands it to
//! the [`FlowTable`]. Frames that fail to parse, and packets the table
//! refuses, are dropped. A read error or end-of-stream on the interface is
//! fatal and ends the loop with [`TunnelError::Interface`].

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::TunnelError;
use crate::flow::{FlowTable, InterfaceWriter};
use crate::packet::parse;

/// Interface read buffer; one IPv4 frame never exceeds it
pub const READ_BUFFER_SIZE: usize = 65535;

/// Pump counters
#[derive(Debug, Default)]
pub struct EngineStats {
    frames: AtomicU64,
    bytes: AtomicU64,
    parse_errors: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// Frames read from the interface
    pub frames: u64,
    /// Bytes read from the interface
    pub bytes: u64,
    /// Frames that did not parse
    pub parse_errors: u64,
    /// Parsed packets the flow table refused
    pub rejected: u64,
}

impl EngineStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Pump frames from `reader` into `table` until cancelled
///
/// Returns `Ok(())` when `cancel` fires.
///
/// # Errors
///
/// Returns `TunnelError::Interface` when the interface read fails or the
/// interface reaches end-of-stream.
pub async fn run<R>(
    mut reader: R,
    table: Arc<FlowTable>,
    writer: InterfaceWriter,
    stats: Arc<EngineStats>,
    cancel: CancellationToken,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    info!("Interface pump started");
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("Interface pump cancelled");
                return Ok(());
            }

            result = reader.read(&mut buffer) => result,
        };

        let len = match read {
            Ok(0) => {
                return Err(TunnelError::interface(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "virtual interface closed",
                )));
            }
            Ok(len) => len,
            Err(e) => return Err(TunnelError::interface(e)),
        };

        stats.frames.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(len as u64, Ordering::Relaxed);

        let packet = match parse(&buffer, len) {
            Ok(packet) => packet,
            Err(e) => {
                stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                trace!(len, error = %e, "Dropping unparseable frame");
                continue;
            }
        };

        if let Err(e) = table.handle(packet, &writer) {
            stats.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(error = %e, "Packet dropped by flow table");
        }
    }
}
