//! Tunnel session controller
//!
//! Owns the secure channel for one profile. A single worker task builds the
//! disguise chain, connects the channel through it, starts dynamic
//! forwarding, then waits until the session ends or `stop` is called.
//!
//! # State machine
//!
//! ```text
//! start -> Connecting -> Connected -> Disconnected(reason) -> Idle
//!              |                          |
//!              +-> Disconnected(reason)   +-> Reconnecting -> Connecting
//!                                             (auto reconnect after a
//!                                              successful connection)
//! ```

mod state;

pub use state::{ConnectionState, StateContext};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::LogLevel;
use crate::channel::{ChannelOptions, ConnectRequest, Credentials, SecureChannel, SecureChannelFactory};
use crate::classify::{classify, ErrorCategory};
use crate::config::{AppConfig, TunnelConfig, TunnelTunables, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_FORWARDING_PORT};
use crate::error::TunnelError;
use crate::protect::SharedProtector;
use crate::transport::build_chain;

/// First reconnect delay
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(2);

/// Reconnect delay ceiling
pub const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Reason recorded when `stop` is called without one
pub const DEFAULT_STOP_REASON: &str = "stopped by user";

/// Controller timing and port settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Loopback port requested for dynamic forwarding
    pub forwarding_port: u16,
    /// Bound on the chain handshake and on the channel connect
    pub connect_timeout: Duration,
    /// First reconnect delay
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling
    pub backoff_max: Duration,
}

impl ControllerSettings {
    /// Settings from the application config
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            forwarding_port: config.forwarding_port,
            connect_timeout: config.connect_timeout(),
            ..Self::default()
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            forwarding_port: DEFAULT_FORWARDING_PORT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            backoff_initial: BACKOFF_INITIAL,
            backoff_max: BACKOFF_MAX,
        }
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay for this retry; doubles the next one up to the ceiling
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Handle on the running worker
#[derive(Debug)]
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives one secure channel through its lifecycle
#[derive(Debug)]
pub struct TunnelController {
    factory: Arc<dyn SecureChannelFactory>,
    protector: SharedProtector,
    context: Arc<StateContext>,
    settings: ControllerSettings,
    running: Arc<AtomicBool>,
    stop_reason: Arc<Mutex<Option<String>>>,
    worker: Mutex<Option<Worker>>,
}

impl TunnelController {
    /// Create an idle controller
    #[must_use]
    pub fn new(
        factory: Arc<dyn SecureChannelFactory>,
        protector: SharedProtector,
        context: Arc<StateContext>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            factory,
            protector,
            context,
            settings,
            running: Arc::new(AtomicBool::new(false)),
            stop_reason: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    /// State and event context
    #[must_use]
    pub fn context(&self) -> &Arc<StateContext> {
        &self.context
    }

    /// Timing and port settings
    #[must_use]
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Whether a worker is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start connecting `config`
    ///
    /// Returns false, doing nothing, while a previous start is still active.
    /// Must be called within a Tokio runtime.
    pub fn start(&self, config: TunnelConfig, tunables: TunnelTunables) -> bool {
        let mut slot = self.worker.lock();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(profile = %config.id, "Start ignored, controller already running");
            return false;
        }

        *self.stop_reason.lock() = None;
        let cancel = CancellationToken::new();
        let job = Job {
            config,
            tunables,
            factory: Arc::clone(&self.factory),
            protector: Arc::clone(&self.protector),
            context: Arc::clone(&self.context),
            settings: self.settings.clone(),
            cancel: cancel.clone(),
            running: Arc::clone(&self.running),
            stop_reason: Arc::clone(&self.stop_reason),
        };

        let handle = tokio::spawn(job.run());
        *slot = Some(Worker { cancel, handle });
        true
    }

    /// Stop the active attempt and wait for the worker to finish
    ///
    /// The first reason recorded wins. Returns false when there was nothing
    /// to stop, including a worker that already ended on its own.
    pub async fn stop(&self, reason: impl Into<String>) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            return false;
        };

        if !self.is_running() || worker.handle.is_finished() {
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Controller worker ended abnormally");
            }
            return false;
        }

        {
            let mut slot = self.stop_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!(error = %e, "Controller worker ended abnormally");
        }
        true
    }
}

/// Outcome of one connection attempt
#[derive(Debug)]
enum Outcome {
    /// `stop` was called
    Stopped,
    /// Failed before reaching Connected
    Failed(TunnelError),
    /// Was connected, then the session ended
    Lost(String),
}

/// Everything the worker owns
struct Job {
    config: TunnelConfig,
    tunables: TunnelTunables,
    factory: Arc<dyn SecureChannelFactory>,
    protector: SharedProtector,
    context: Arc<StateContext>,
    settings: ControllerSettings,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    stop_reason: Arc<Mutex<Option<String>>>,
}

impl Job {
    async fn run(self) {
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut connected_once = false;

        loop {
            self.context.transition(ConnectionState::Connecting, None);

            let (reason, retry) = match self.attempt().await {
                Outcome::Stopped => (self.stop_reason(), false),
                Outcome::Failed(err) => {
                    let category = classify(&err);
                    warn!(
                        profile = %self.config.id,
                        category = %category,
                        error = %err,
                        "Connection attempt failed"
                    );
                    self.context.log(LogLevel::Error, category.user_message());
                    (
                        format!("{category}: {err}"),
                        self.tunables.use_auto_reconnect && connected_once,
                    )
                }
                Outcome::Lost(detail) => {
                    connected_once = true;
                    backoff.reset();
                    info!(profile = %self.config.id, reason = %detail, "Session ended");
                    (
                        format!("{}: {detail}", ErrorCategory::SessionTerminated),
                        self.tunables.use_auto_reconnect,
                    )
                }
            };

            self.context
                .transition(ConnectionState::Disconnected, Some(reason));
            if !retry {
                break;
            }

            let delay = backoff.next_delay();
            self.context.transition(
                ConnectionState::Reconnecting,
                Some(format!("retrying in {}s", delay.as_secs())),
            );
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.context
                        .transition(ConnectionState::Disconnected, Some(self.stop_reason()));
                    break;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.context.transition(ConnectionState::Idle, None);
        self.running.store(false, Ordering::Release);
    }

    fn stop_reason(&self) -> String {
        self.stop_reason
            .lock()
            .clone()
            .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string())
    }

    async fn attempt(&self) -> Outcome {
        if let Err(e) = self.config.validate().and_then(|()| self.tunables.validate()) {
            return Outcome::Failed(e.into());
        }

        let chain = match build_chain(
            &self.config,
            &self.tunables,
            Arc::clone(&self.protector),
            self.settings.connect_timeout,
        ) {
            Ok(chain) => chain,
            Err(e) => return Outcome::Failed(e.into()),
        };

        info!(
            profile = %self.config.id,
            chain = %chain.describe(),
            "Connecting secure channel"
        );

        let request = ConnectRequest {
            host: self.config.ssh_host.clone(),
            port: self.config.ssh_port,
            credentials: Credentials::new(&self.config.ssh_user, &self.config.ssh_password),
            transport: chain,
            options: ChannelOptions::from_tunables(&self.tunables),
        };

        let channel = self.factory.create();
        let outcome = self.drive(channel.as_ref(), request).await;

        channel.disconnect().await;
        self.context.clear_port();
        outcome
    }

    async fn drive(&self, channel: &dyn SecureChannel, request: ConnectRequest) -> Outcome {
        let connect_timeout = self.settings.connect_timeout;

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Outcome::Stopped,
            result = timeout(connect_timeout, channel.connect(request)) => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Outcome::Failed(e.into()),
                Err(_) => {
                    return Outcome::Failed(TunnelError::timeout(
                        "secure channel connect",
                        u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
                    ));
                }
            },
        }

        let port = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Outcome::Stopped,
            result = channel.start_dynamic_forwarding(self.settings.forwarding_port) => match result {
                Ok(port) => port,
                Err(e) => return Outcome::Failed(e.into()),
            },
        };

        self.context.set_ready(port);
        self.context.transition(ConnectionState::Connected, None);
        info!(profile = %self.config.id, port, "Tunnel connected");

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Outcome::Stopped,
            reason = channel.closed() => Outcome::Lost(reason),
        }
    }
}
