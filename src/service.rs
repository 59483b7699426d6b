//! Service surface
//!
//! Wires the [`TunnelController`] and the interface pump together behind an
//! idempotent `start`/`stop` pair. The flow table dials whatever forwarding
//! port the controller currently publishes, so flows opened while the
//! tunnel is down fail fast and are retried by the device's own stack.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::SecureChannelFactory;
use crate::config::{TunnelConfig, TunnelTunables};
use crate::controller::{ControllerSettings, StateContext, TunnelController};
use crate::engine::{self, EngineStats, EngineStatsSnapshot};
use crate::flow::{FlowTable, InterfaceWriter, Socks5Dialer};
use crate::protect::SharedProtector;

/// Stop reason used when the virtual interface fails
pub const INTERFACE_CLOSED_REASON: &str = "virtual interface closed";

/// Engine half of a running tunnel
#[derive(Debug)]
struct ActiveSession {
    cancel: CancellationToken,
    table: Arc<FlowTable>,
    stats: Arc<EngineStats>,
    pump: JoinHandle<()>,
}

impl ActiveSession {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.table.shutdown();
        if let Err(e) = self.pump.await {
            warn!(error = %e, "Interface pump ended abnormally");
        }
    }
}

/// Tunnel service: one controller plus one interface pump
#[derive(Debug)]
pub struct TunnelService {
    controller: Arc<TunnelController>,
    protector: SharedProtector,
    dial_timeout: Duration,
    active: Mutex<Option<ActiveSession>>,
}

impl TunnelService {
    /// Create a stopped service
    #[must_use]
    pub fn new(
        factory: Arc<dyn SecureChannelFactory>,
        protector: SharedProtector,
        settings: ControllerSettings,
    ) -> Self {
        let dial_timeout = settings.connect_timeout;
        let context = Arc::new(StateContext::new());
        let controller = Arc::new(TunnelController::new(
            factory,
            Arc::clone(&protector),
            context,
            settings,
        ));

        Self {
            controller,
            protector,
            dial_timeout,
            active: Mutex::new(None),
        }
    }

    /// State and event context
    #[must_use]
    pub fn context(&self) -> &Arc<StateContext> {
        self.controller.context()
    }

    /// The session controller
    #[must_use]
    pub fn controller(&self) -> &Arc<TunnelController> {
        &self.controller
    }

    /// Pump counters of the running session
    #[must_use]
    pub fn stats(&self) -> Option<EngineStatsSnapshot> {
        self.active.lock().as_ref().map(|active| active.stats.snapshot())
    }

    /// Number of live flow sessions
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.active.lock().as_ref().map_or(0, |active| active.table.len())
    }

    /// Start the tunnel over `device`
    ///
    /// Returns false, dropping `device`, when the controller is already
    /// running. Must be called within a Tokio runtime.
    pub fn start<D>(&self, config: TunnelConfig, tunables: TunnelTunables, device: D) -> bool
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let profile = config.id.clone();
        let chunk_size = tunables.reply_chunk_size();
        if !self.controller.start(config, tunables) {
            return false;
        }

        let dialer = Socks5Dialer::new(
            self.context().subscribe_port(),
            Arc::clone(&self.protector),
            self.dial_timeout,
        );
        let table = Arc::new(FlowTable::with_events(
            Arc::new(dialer),
            chunk_size,
            Some(Arc::clone(self.context())),
        ));

        let (reader, writer) = tokio::io::split(device);
        let writer = InterfaceWriter::new(writer);
        let stats = Arc::new(EngineStats::new());
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump_task(
            reader,
            writer,
            Arc::clone(&table),
            Arc::clone(&stats),
            cancel.clone(),
            Arc::clone(&self.controller),
        ));

        let previous = self.active.lock().replace(ActiveSession {
            cancel,
            table,
            stats,
            pump,
        });
        if let Some(previous) = previous {
            // Left behind by a session whose controller stopped on its own
            tokio::spawn(previous.shutdown());
        }

        info!(profile = %profile, chunk_size, "Tunnel service started");
        true
    }

    /// Stop the tunnel
    ///
    /// Idempotent; returns false when the controller had nothing to stop.
    /// An engine left behind by a controller that ended on its own is still
    /// shut down.
    pub async fn stop(&self, reason: impl Into<String>) -> bool {
        let active = self.active.lock().take();
        let had_engine = active.is_some();
        if let Some(active) = active {
            active.shutdown().await;
        }

        let stopped = self.controller.stop(reason).await;
        if stopped || had_engine {
            info!(stopped, "Tunnel service stopped");
        }
        stopped
    }
}

async fn pump_task<R>(
    reader: R,
    writer: InterfaceWriter,
    table: Arc<FlowTable>,
    stats: Arc<EngineStats>,
    cancel: CancellationToken,
    controller: Arc<TunnelController>,
) where
    R: AsyncRead + Unpin,
{
    let result = engine::run(reader, Arc::clone(&table), writer.clone(), stats, cancel).await;
    table.shutdown();

    if let Err(e) = result {
        error!(error = %e, "Virtual interface failed, stopping tunnel");
        controller.stop(INTERFACE_CLOSED_REASON).await;
    }

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Interface writer shutdown failed");
    }
}
