//! Concurrent flow registry and per-session workers

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{FlowKey, InterfaceWriter, SharedDialer};
use crate::bridge::LogLevel;
use crate::controller::StateContext;
use crate::error::SessionError;
use crate::packet::{build_reply, Packet};
use crate::transport::BoxedStream;

/// Payloads a session buffers while its proxy connection is pending;
/// further payloads are dropped
pub const SESSION_QUEUE_CAPACITY: usize = 256;

/// One live flow
///
/// Holds the packet that opened the flow as the template for reply frames,
/// and the queue of payloads waiting for the proxy connection.
#[derive(Debug)]
pub struct FlowSession {
    id: u64,
    key: FlowKey,
    template: Packet,
    queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl FlowSession {
    /// Table-unique session id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flow key
    #[must_use]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Packet replies are templated from
    #[must_use]
    pub fn template(&self) -> &Packet {
        &self.template
    }

    /// Whether the session has been torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and cancel the workers; true only for the first call
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }
}

/// State shared between the table and its session workers
#[derive(Debug)]
struct Shared {
    sessions: DashMap<FlowKey, Arc<FlowSession>>,
    dialer: SharedDialer,
    chunk_size: usize,
    events: Option<Arc<StateContext>>,
}

impl Shared {
    /// Close `session` and drop it from the table if it is still the entry
    /// for its key; safe to call any number of times
    fn teardown(&self, session: &FlowSession, reason: &str) {
        if !session.close() {
            return;
        }
        let removed = self
            .sessions
            .remove_if(&session.key, |_, current| current.id == session.id)
            .is_some();
        tracing::debug!(
            flow = %session.key,
            session = session.id,
            removed,
            reason,
            "Flow session closed"
        );
    }

    fn publish(&self, level: LogLevel, message: String) {
        if let Some(events) = &self.events {
            events.log(level, message);
        }
    }
}

/// Registry of live flow sessions
///
/// At most one session exists per [`FlowKey`]: lookup and creation happen
/// inside one `DashMap` entry lock.
#[derive(Debug)]
pub struct FlowTable {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl FlowTable {
    /// Create a table dialing through `dialer`
    ///
    /// Proxy replies are read in chunks of at most `chunk_size` bytes, each
    /// becoming one reply frame.
    #[must_use]
    pub fn new(dialer: SharedDialer, chunk_size: usize) -> Self {
        Self::with_events(dialer, chunk_size, None)
    }

    /// Create a table that publishes dial failures to `events`
    #[must_use]
    pub fn with_events(
        dialer: SharedDialer,
        chunk_size: usize,
        events: Option<Arc<StateContext>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sessions: DashMap::new(),
                dialer,
                chunk_size: chunk_size.max(1),
                events,
            }),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Route `packet` to its flow session, opening one if needed
    ///
    /// Never waits on I/O: the payload is queued for the session worker.
    /// Empty payloads (SYN, bare ACK) only open the session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Unsupported` when the dialer cannot carry the
    /// packet's protocol; the packet should be dropped.
    pub fn handle(&self, packet: Packet, writer: &InterfaceWriter) -> Result<(), SessionError> {
        let protocol = packet.protocol();
        if !self.shared.dialer.supports(protocol) {
            return Err(SessionError::Unsupported(protocol));
        }

        let key = FlowKey::of(&packet);
        let payload = packet.payload().clone();

        let session = match self.shared.sessions.entry(key) {
            Entry::Occupied(mut entry) if entry.get().is_closed() => {
                let session = self.open(key, packet, writer);
                entry.insert(Arc::clone(&session));
                session
            }
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let session = self.open(key, packet, writer);
                entry.insert(Arc::clone(&session));
                session
            }
        };

        if !payload.is_empty() {
            match session.queue.try_send(payload) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(flow = %key, "Session queue full, payload dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!(flow = %key, "Session closing, payload dropped");
                }
            }
        }

        Ok(())
    }

    fn open(&self, key: FlowKey, template: Packet, writer: &InterfaceWriter) -> Arc<FlowSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        let session = Arc::new(FlowSession {
            id,
            key,
            template,
            queue,
            cancel: self.cancel.child_token(),
            closed: AtomicBool::new(false),
        });

        tracing::debug!(flow = %key, session = id, "Opening flow session");
        tokio::spawn(run_session(
            Arc::clone(&self.shared),
            Arc::clone(&session),
            rx,
            writer.clone(),
        ));

        session
    }

    /// Tear down the session for `key`
    ///
    /// Returns false when no session exists, so repeated calls are harmless.
    pub fn remove(&self, key: &FlowKey) -> bool {
        match self.shared.sessions.remove(key) {
            Some((_, session)) => {
                session.close();
                tracing::debug!(flow = %key, session = session.id, "Flow session removed");
                true
            }
            None => false,
        }
    }

    /// Live session for `key`
    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<Arc<FlowSession>> {
        self.shared.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of sessions in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.sessions.is_empty()
    }

    /// Cancel every session and empty the table
    ///
    /// Sessions opened afterwards are cancelled immediately.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<FlowSession>> = self
            .shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shared.sessions.clear();
        for session in &sessions {
            session.close();
        }
        tracing::debug!(closed = sessions.len(), "Flow table shut down");
    }
}

impl Drop for FlowTable {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Session worker: dial, start the reply reader, forward queued payloads
async fn run_session(
    shared: Arc<Shared>,
    session: Arc<FlowSession>,
    mut queue: mpsc::Receiver<Bytes>,
    writer: InterfaceWriter,
) {
    let destination = session.key.destination;

    let stream = tokio::select! {
        () = session.cancel.cancelled() => {
            shared.teardown(&session, "cancelled before dial");
            return;
        }
        result = shared.dialer.dial(destination) => match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(flow = %session.key, error = %e, "Flow dial failed");
                shared.publish(LogLevel::Warn, format!("Flow {} failed: {e}", session.key));
                shared.teardown(&session, "dial failed");
                return;
            }
        }
    };

    let (reader, mut proxy) = tokio::io::split(stream);
    tokio::spawn(read_replies(
        Arc::clone(&shared),
        Arc::clone(&session),
        reader,
        writer,
    ));

    let forward = async {
        while let Some(payload) = queue.recv().await {
            proxy.write_all(&payload).await?;
        }
        Ok::<_, io::Error>(())
    };

    let reason = tokio::select! {
        () = session.cancel.cancelled() => "cancelled".to_string(),
        result = forward => match result {
            Ok(()) => "queue closed".to_string(),
            Err(e) => format!("proxy write failed: {e}"),
        },
    };

    shared.teardown(&session, &reason);
}

/// Reply reader: proxy bytes -> reply frames -> interface
async fn read_replies(
    shared: Arc<Shared>,
    session: Arc<FlowSession>,
    mut reader: ReadHalf<BoxedStream>,
    writer: InterfaceWriter,
) {
    let relay = async {
        let mut buf = vec![0u8; shared.chunk_size];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, SessionError>("proxy closed".to_string());
            }
            let frame = build_reply(&session.template, &buf[..n])?;
            writer.write_frame(&frame).await?;
        }
    };

    let reason = tokio::select! {
        () = session.cancel.cancelled() => "cancelled".to_string(),
        result = relay => match result {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        },
    };

    shared.teardown(&session, &reason);
}
