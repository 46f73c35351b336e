// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Request/response link to the sorter over a line-framed byte stream.
//
// # Correlation
//
// The firmware answers every command with exactly one line and carries no
// request id, so replies are matched to commands purely by position: each
// send enqueues a waiter, and each received line resolves the oldest waiter.
// Lines that arrive while no waiter is pending are broadcast as unsolicited
// `LinkEvent`s (jam notifications, boot banners).
//
// An unsolicited line that arrives while a command is pending cannot be told
// apart from that command's reply and is handed to the waiter.  This is a
// limitation of the firmware protocol; the link logs a warning when a reply
// looks like a jam so the misattribution is at least visible.
//
// # Timeouts
//
// Each waiter has its own deadline (3000ms by default).  A waiter that
// expires is removed from its position in the queue; waiters behind it keep
// their order.  If the reply is delivered in the same instant the deadline
// fires, the reply wins.  A command whose caller stops waiting (a dropped
// future, an outer timeout, a losing `select!` arm) gives up its place the
// same way.
//
// # Reattach
//
// Each attached transport gets a generation number.  A read task only tears
// the link down if its generation is still the current one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use sortwerk_core::error::{Result, SortwerkError};
use sortwerk_core::SorterConfig;

use crate::framing::LineBuffer;
use crate::protocol::{Command, DeviceMessage};

/// Default reply deadline per command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Bytes requested per read from the transport.
const READ_CHUNK: usize = 1024;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Connection-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A transport was attached.
    Connected,
    /// A line arrived with no command waiting for it.
    Unsolicited(String),
    /// The transport closed, failed, or was detached.
    Disconnected { reason: String },
}

/// A command waiting for its reply line.
struct Waiter {
    id: u64,
    reply: oneshot::Sender<String>,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the link handle and its read task.
struct Shared {
    /// Write half of the transport; the lock is the exclusive write section.
    writer: tokio::sync::Mutex<Option<Writer>>,
    /// Pending waiters, oldest first.
    waiters: Mutex<VecDeque<Waiter>>,
    /// Handle to the task reading the transport.
    reader: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<LinkEvent>,
    connected: watch::Sender<bool>,
    next_id: AtomicU64,
    /// Bumped on every attach, under the writer lock.
    generation: AtomicU64,
    timeout: Duration,
}

/// A written command's place in the reply queue.
///
/// Dropping it removes the waiter if it is still queued, so a caller that
/// stops waiting cannot leave a dead entry that would swallow the next reply.
struct PendingReply {
    shared: Arc<Shared>,
    id: u64,
    deadline: Instant,
    reply: oneshot::Receiver<String>,
}

impl PendingReply {
    async fn wait(mut self) -> Option<String> {
        match tokio::time::timeout_at(self.deadline, &mut self.reply).await {
            Ok(Ok(line)) => Some(line),
            // Sender dropped: the link was torn down.
            Ok(Err(_)) => None,
            Err(_) => self.expire(),
        }
    }

    /// Resolve after the deadline: drop the waiter, unless the read task
    /// already took it, in which case its reply is in the channel.
    fn expire(&mut self) -> Option<String> {
        if self.shared.remove_waiter(self.id) {
            warn!(
                id = self.id,
                timeout_ms = self.shared.timeout.as_millis() as u64,
                "sorter did not reply in time"
            );
            None
        } else {
            self.reply.try_recv().ok()
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.shared.remove_waiter(self.id) {
            debug!(id = self.id, "command abandoned before its reply");
        }
    }
}

/// Handle to the sorter connection.  Cheap to clone; clones share the link.
#[derive(Clone)]
pub struct HardwareLink {
    shared: Arc<Shared>,
}

impl Default for HardwareLink {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl HardwareLink {
    /// Create a detached link.  Call [`attach`](Self::attach) or
    /// [`connect_serial`](Self::connect_serial) before sending.
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connected, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(None),
                waiters: Mutex::new(VecDeque::new()),
                reader: Mutex::new(None),
                events,
                connected,
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    pub fn from_config(config: &SorterConfig) -> Self {
        Self::new(config.hardware_timeout())
    }

    // -- Connection lifecycle -------------------------------------------------

    /// Attach a transport and start reading from it.
    ///
    /// Any previously attached transport is disconnected first.
    pub async fn attach<T>(&self, transport: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.disconnect().await;

        let (read_half, write_half) = tokio::io::split(transport);
        let mut writer = self.shared.writer.lock().await;
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *writer = Some(Box::new(write_half));

        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let reason = read_loop(&shared, read_half).await;
            shared.teardown(Some(generation), &reason).await;
        });
        if let Some(previous) = self.shared.lock_reader().replace(handle) {
            previous.abort();
        }

        self.shared.connected.send_replace(true);
        let _ = self.shared.events.send(LinkEvent::Connected);
        drop(writer);
        info!(generation, "sorter link attached");
    }

    /// Open a serial port and attach it.
    #[instrument(skip(self))]
    pub async fn connect_serial(&self, path: &str, baud_rate: u32) -> Result<()> {
        let port = crate::serial::open_serial(path, baud_rate)?;
        self.attach(port).await;
        Ok(())
    }

    /// Stop reading, close the transport, and fail every pending command.
    ///
    /// Pending commands resolve to "no response" in the order they were sent.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.shared.lock_reader().take() {
            handle.abort();
        }
        self.shared.teardown(None, "disconnected by host").await;
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Observe connection state changes.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Receive unsolicited lines and connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Number of commands still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.lock_waiters().len()
    }

    // -- Commands -------------------------------------------------------------

    /// Send a command and wait for its reply.
    ///
    /// Returns `Ok(None)` if the sorter does not answer within the timeout or
    /// the link drops first.  Write failures and malformed replies are
    /// errors.
    #[instrument(skip(self))]
    pub async fn send(&self, command: &Command) -> Result<Option<DeviceMessage>> {
        let line = command.to_line()?;
        match self.send_line(&line).await? {
            Some(raw) => {
                let message = DeviceMessage::parse(&raw)?;
                debug!(?message, "sorter replied");
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Send a raw line (a terminator is added if missing) and return the raw
    /// reply line.
    pub async fn send_line(&self, line: &str) -> Result<Option<String>> {
        let pending = self.write_line(line).await?;
        Ok(pending.wait().await)
    }

    /// Enqueue a waiter and write `line` inside the exclusive write section.
    ///
    /// The waiter is queued before the bytes leave so that queue order always
    /// equals wire order, and a fast reply can never find the queue empty.
    /// The deadline starts once the line is flushed.
    async fn write_line(&self, line: &str) -> Result<PendingReply> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(SortwerkError::NotConnected)?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.lock_waiters().push_back(Waiter { id, reply: tx });
        let mut pending = PendingReply {
            shared: Arc::clone(&self.shared),
            id,
            deadline: Instant::now() + self.shared.timeout,
            reply: rx,
        };

        let result = async {
            writer.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                writer.write_all(b"\n").await?;
            }
            writer.flush().await
        }
        .await;

        if let Err(err) = result {
            // Dropping `pending` dequeues the waiter.
            warn!(error = %err, "sorter write failed");
            return Err(SortwerkError::Io(err));
        }

        pending.deadline = Instant::now() + self.shared.timeout;
        debug!(id, line = line.trim_end(), "command written");
        Ok(pending)
    }
}

impl Shared {
    fn lock_waiters(&self) -> MutexGuard<'_, VecDeque<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reader(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the waiter with `id` wherever it sits.  Returns whether it was
    /// still queued.
    fn remove_waiter(&self, id: u64) -> bool {
        let mut waiters = self.lock_waiters();
        match waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Hand a received line to the oldest waiter, or broadcast it.
    fn dispatch_line(&self, line: String) {
        let mut waiters = self.lock_waiters();
        match waiters.pop_front() {
            Some(waiter) => {
                if DeviceMessage::parse(&line).is_ok_and(|m| m.is_jam()) {
                    warn!(
                        id = waiter.id,
                        "jam notification arrived while a command was pending; delivering it as the reply"
                    );
                }
                // Delivered under the lock so a concurrent timeout sees either
                // a queued waiter or a filled channel.
                if waiter.reply.send(line).is_err() {
                    debug!(id = waiter.id, "reply for an abandoned command discarded");
                }
            }
            None => {
                drop(waiters);
                warn!(line = %line, "unsolicited sorter message");
                let _ = self.events.send(LinkEvent::Unsolicited(line));
            }
        }
    }

    /// Close the writer and fail all waiters.  Safe to call more than once.
    ///
    /// With `Some(generation)` nothing happens unless that attach is still
    /// the current one.  Holding the writer lock throughout keeps a
    /// concurrent attach from landing halfway through.
    async fn teardown(&self, generation: Option<u64>, reason: &str) {
        let mut writer = self.writer.lock().await;
        if generation.is_some_and(|g| g != self.generation.load(Ordering::Acquire)) {
            debug!(?generation, reason, "stale read task ended, link already replaced");
            return;
        }
        if let Some(mut old) = writer.take() {
            let _ = old.shutdown().await;
        }

        let drained: Vec<Waiter> = self.lock_waiters().drain(..).collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "failing pending sorter commands");
        }
        // Dropping each sender resolves its command to "no response".
        for waiter in drained {
            drop(waiter.reply);
        }

        let was_connected = self.connected.send_replace(false);
        if was_connected {
            info!(reason, "sorter link closed");
            let _ = self.events.send(LinkEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        drop(writer);
    }
}

/// Read until the transport ends or fails.  Returns the reason it stopped.
async fn read_loop<R>(shared: &Shared, mut reader: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return "end of stream".to_string(),
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    shared.dispatch_line(line);
                }
            }
            Err(err) => {
                warn!(error = %err, "sorter read failed");
                return err.to_string();
            }
        }
    }
}
