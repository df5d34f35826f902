//! Transport duplex pump: one reader task and one writer task per stream.
//!
//! The pump owns both halves of a raw byte stream. The reader feeds every
//! byte into a [`PacketStateMachine`] and hands finished packets to the
//! router through an event channel; the writer drains a FIFO of
//! [`PendingWrite`] entries with one write per packet. The mpsc channel
//! feeding the writer task is the only path to the stream's write half, so
//! single-writer discipline is structural rather than lock-based.
//!
//! ```text
//! stream read half ─► reader task ─► PSM ─► mpsc::Sender<PumpEvent> ─► router
//! router ─► WriteQueue ─► mpsc ─► writer task ─► stream write half
//! ```
//!
//! End-of-stream or an I/O failure on either half raises exactly one
//! [`PumpEvent::Disconnected`]. A caller-initiated [`TransportPump::stop`]
//! suppresses the event; both loops exit silently instead.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{LinkError, Result};
use crate::protocol::{Packet, PacketStateMachine, PsmState};

/// Default read buffer size for the reader loop.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default write queue capacity.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;

/// Default maximum pending writes before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default inbound event channel capacity.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Interval between backpressure re-checks.
const BACKPRESSURE_CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// Configuration for the duplex pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Read buffer size for the reader loop.
    pub read_buffer_size: usize,
    /// Channel capacity of the write FIFO.
    pub write_queue_capacity: usize,
    /// Maximum pending writes before backpressure kicks in.
    pub max_pending_writes: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
    /// Channel capacity of the inbound event queue.
    pub event_queue_capacity: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

/// What the pump reports upward to the router.
#[derive(Debug)]
pub enum PumpEvent {
    /// A complete packet came off the wire.
    Packet(Packet),
    /// The physical connection is gone (EOF or I/O failure).
    Disconnected,
}

/// An outbound packet queued for transmission.
///
/// `seq` is assigned by the router and strictly increases across all
/// submissions, so per-session wire order always equals submission order.
#[derive(Debug)]
pub struct PendingWrite {
    /// Session the packet belongs to (0 for link control).
    pub session_id: u8,
    /// Router-assigned enqueue sequence number.
    pub seq: u64,
    /// The fully encoded packet bytes.
    pub bytes: Bytes,
}

/// Handle for enqueuing writes onto the pump's writer task.
///
/// Cheaply cloneable; the router is the only intended holder.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<PendingWrite>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriteQueue {
    fn new(
        tx: mpsc::Sender<PendingWrite>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Enqueue a write, waiting out backpressure up to the configured timeout.
    pub async fn submit(&self, write: PendingWrite) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(write).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            LinkError::ConnectionClosed
        })
    }

    /// Enqueue a write without waiting; rejects immediately at capacity.
    pub fn try_submit(&self, write: PendingWrite) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(LinkError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(write).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => LinkError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => LinkError::ConnectionClosed,
            }
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(LinkError::BackpressureTimeout);
            }
            tokio::time::sleep(BACKPRESSURE_CHECK_INTERVAL).await;
        }
    }

    /// Number of writes accepted but not yet on the wire.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the queue is at its backpressure limit.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }
}

/// Owns the reader and writer tasks bound to one physical stream.
pub struct TransportPump {
    shutdown: watch::Sender<bool>,
    reader_task: Option<JoinHandle<Result<()>>>,
    writer_task: Option<JoinHandle<Result<()>>>,
    framing_errors: Arc<AtomicU64>,
    stopped: AtomicBool,
}

impl TransportPump {
    /// Split `stream` and spawn the reader and writer tasks.
    ///
    /// Returns the pump, the write queue (hand it to the router and nothing
    /// else), and the inbound event receiver.
    pub fn spawn<S>(stream: S, config: PumpConfig) -> (Self, WriteQueue, mpsc::Receiver<PumpEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);
        let (write_tx, write_rx) = mpsc::channel(config.write_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pending = Arc::new(AtomicUsize::new(0));
        let framing_errors = Arc::new(AtomicU64::new(0));

        let queue = WriteQueue::new(
            write_tx,
            pending.clone(),
            config.max_pending_writes,
            config.backpressure_timeout,
        );

        let reader_task = tokio::spawn(reader_loop(
            read_half,
            event_tx.clone(),
            shutdown_rx.clone(),
            config.read_buffer_size,
            framing_errors.clone(),
        ));
        let writer_task = tokio::spawn(writer_loop(
            write_half,
            write_rx,
            pending,
            event_tx,
            shutdown_rx,
        ));

        let pump = Self {
            shutdown: shutdown_tx,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
            framing_errors,
            stopped: AtomicBool::new(false),
        };
        (pump, queue, event_rx)
    }

    /// Signal both loops to stop and wait for them to exit. Idempotent: a
    /// second call (or a stop after connection loss) is a no-op.
    pub async fn stop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
        }
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
    }

    /// Bytes that failed to progress the parser since the pump started.
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors.load(Ordering::Relaxed)
    }
}

/// Reader loop: block on `read`, feed bytes to the PSM, forward packets.
async fn reader_loop<R>(
    mut reader: R,
    events: mpsc::Sender<PumpEvent>,
    mut shutdown: watch::Receiver<bool>,
    read_buffer_size: usize,
    framing_errors: Arc<AtomicU64>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut psm = PacketStateMachine::new();
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    if !*shutdown.borrow() {
                        tracing::debug!("EOF on transport read, disconnecting");
                        let _ = events.send(PumpEvent::Disconnected).await;
                    }
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) => {
                    if !*shutdown.borrow() {
                        tracing::error!("Transport read failed, disconnecting: {}", e);
                        let _ = events.send(PumpEvent::Disconnected).await;
                    }
                    return Err(LinkError::Io(e));
                }
            },
        };

        for &byte in &buf[..n] {
            if !psm.handle_byte(byte) {
                // Discard this candidate start and keep scanning.
                framing_errors.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Parser did not progress in {:?}, resetting", psm.state());
                psm.reset();
                continue;
            }
            if psm.state() == PsmState::Finished {
                if let Some(packet) = psm.take_packet() {
                    if events.send(PumpEvent::Packet(packet)).await.is_err() {
                        // Router gone; nothing left to parse for.
                        return Ok(());
                    }
                }
                psm.reset();
            }
        }
    }
}

/// Writer loop: drain the FIFO, one write per packet.
async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingWrite>,
    pending: Arc<AtomicUsize>,
    events: mpsc::Sender<PumpEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let write = tokio::select! {
            _ = shutdown.changed() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            item = rx.recv() => match item {
                Some(write) => write,
                None => {
                    // Queue dropped, clean shutdown.
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },
        };

        let result = async {
            writer.write_all(&write.bytes).await?;
            writer.flush().await
        }
        .await;
        pending.fetch_sub(1, Ordering::Release);

        if let Err(e) = result {
            if !*shutdown.borrow() {
                tracing::error!(
                    "Transport write failed for session {} (seq {}), disconnecting: {}",
                    write.session_id,
                    write.seq,
                    e
                );
                let _ = events.send(PumpEvent::Disconnected).await;
            }
            return Err(LinkError::Io(e));
        }
        tracing::trace!(
            "Wrote packet for session {} (seq {}, {} bytes)",
            write.session_id,
            write.seq,
            write.bytes.len()
        );
    }
}
