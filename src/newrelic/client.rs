//! Buffered client for recording New Relic records directly.
//!
//! Callers hand records to a bounded queue. A single worker task owns the
//! [`BatchBuffer`], seals batches by size and on the flush interval, and sends
//! them through the shared [`Transport`]. A full queue is reported to the
//! caller instead of blocking it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ExportError;
use crate::newrelic::batch::{BatchBuffer, BatchConfig};
use crate::newrelic::model::{CommonBlock, WireBatch, WireRecord};
use crate::newrelic::transport::Transport;

pub const DEFAULT_QUEUE_CAPACITY: usize = 2_048;

/// Counters shared between the sender handle and its worker.
#[derive(Debug, Default)]
pub struct SenderMetrics {
    pub records_accepted: AtomicU64,
    /// Rejected because the queue was full
    pub records_rejected: AtomicU64,
    pub records_sent: AtomicU64,
    /// Lost to a failed delivery
    pub records_dropped: AtomicU64,
    pub batches_sent: AtomicU64,
    pub send_failures: AtomicU64,
}

impl SenderMetrics {
    pub fn records_accepted(&self) -> u64 {
        self.records_accepted.load(Ordering::Relaxed)
    }

    pub fn records_rejected(&self) -> u64 {
        self.records_rejected.load(Ordering::Relaxed)
    }

    pub fn records_sent(&self) -> u64 {
        self.records_sent.load(Ordering::Relaxed)
    }

    pub fn records_dropped(&self) -> u64 {
        self.records_dropped.load(Ordering::Relaxed)
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    fn record_success(&self, records: u64) {
        self.records_sent.fetch_add(records, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, records: u64) {
        self.records_dropped.fetch_add(records, Ordering::Relaxed);
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }
}

type Reply = oneshot::Sender<Result<(), ExportError>>;

enum Command<T> {
    Record(T),
    Flush(Reply),
    Shutdown(Reply),
}

/// Handle to a background batching worker for one record type.
pub struct BufferedSender<T: WireRecord> {
    tx: mpsc::Sender<Command<T>>,
    metrics: Arc<SenderMetrics>,
    closed: AtomicBool,
}

impl<T: WireRecord> BufferedSender<T> {
    /// Starts the worker on the current Tokio runtime.
    ///
    /// Fails with [`ExportError::Runtime`] when called outside a runtime.
    pub fn spawn(
        transport: Arc<Transport>,
        common: CommonBlock,
        config: BatchConfig,
        queue_capacity: usize,
    ) -> Result<Self, ExportError> {
        let runtime = Handle::try_current()
            .map_err(|e| ExportError::Runtime(format!("buffered sender needs a Tokio runtime: {e}")))?;
        Ok(Self::spawn_on(&runtime, transport, common, config, queue_capacity))
    }

    /// Starts the worker on `runtime`.
    pub fn spawn_on(
        runtime: &Handle,
        transport: Arc<Transport>,
        common: CommonBlock,
        config: BatchConfig,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let metrics = Arc::new(SenderMetrics::default());

        let worker = Worker {
            buffer: BatchBuffer::new(config, &common),
            transport,
            common,
            metrics: Arc::clone(&metrics),
        };
        runtime.spawn(worker.run(rx));

        Self {
            tx,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    /// Queues a record without waiting.
    ///
    /// Fails with [`ExportError::QueueFull`] under backpressure and with
    /// [`ExportError::Closed`] once the sender has been shut down.
    pub fn record(&self, record: T) -> Result<(), ExportError> {
        if self.is_closed() {
            return Err(ExportError::Closed);
        }
        match self.tx.try_send(Command::Record(record)) {
            Ok(()) => {
                self.metrics.records_accepted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.records_rejected.fetch_add(1, Ordering::Relaxed);
                Err(ExportError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ExportError::Closed),
        }
    }

    /// Queues a record, waiting for room in the queue.
    pub async fn record_async(&self, record: T) -> Result<(), ExportError> {
        if self.is_closed() {
            return Err(ExportError::Closed);
        }
        self.tx
            .send(Command::Record(record))
            .await
            .map_err(|_| ExportError::Closed)?;
        self.metrics.records_accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sends everything queued so far and waits for the result.
    pub async fn flush(&self) -> Result<(), ExportError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| ExportError::Closed)?;
        done.await.map_err(|_| ExportError::Closed)?
    }

    /// Drains the queue, sends what is left and stops the worker.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), ExportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply)).await.is_err() {
            return Ok(());
        }
        done.await.unwrap_or(Ok(()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &SenderMetrics {
        &self.metrics
    }
}

struct Worker<T: WireRecord> {
    transport: Arc<Transport>,
    common: CommonBlock,
    buffer: BatchBuffer<T>,
    metrics: Arc<SenderMetrics>,
}

impl<T: WireRecord> Worker<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command<T>>) {
        let mut ticker = tokio::time::interval(self.buffer.config().flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Record(record)) => {
                        if let Some(records) = self.buffer.add(record) {
                            let _ = self.deliver(records).await;
                        }
                    }
                    Some(Command::Flush(reply)) => {
                        let _ = reply.send(self.flush().await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        rx.close();
                        let mut waiting = vec![reply];
                        while let Some(command) = rx.recv().await {
                            match command {
                                Command::Record(record) => {
                                    if let Some(records) = self.buffer.add(record) {
                                        let _ = self.deliver(records).await;
                                    }
                                }
                                Command::Flush(reply) | Command::Shutdown(reply) => waiting.push(reply),
                            }
                        }
                        let result = self.flush().await;
                        for reply in waiting {
                            let _ = reply.send(result.clone());
                        }
                        break;
                    }
                    None => {
                        let _ = self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if self.buffer.should_flush() {
                        let _ = self.flush().await;
                    }
                }
            }
        }

        info!(
            kind = T::KIND.as_str(),
            sent = self.metrics.records_sent(),
            dropped = self.metrics.records_dropped(),
            "buffered sender stopped"
        );
    }

    async fn flush(&mut self) -> Result<(), ExportError> {
        match self.buffer.take_batch() {
            Some(records) => self.deliver(records).await,
            None => Ok(()),
        }
    }

    async fn deliver(&self, records: Vec<T>) -> Result<(), ExportError> {
        let count = records.len() as u64;
        let batch = WireBatch::new(self.common.clone(), records);
        match self.transport.send(batch).await {
            Ok(()) => {
                self.metrics.record_success(count);
                debug!(kind = T::KIND.as_str(), records = count, "buffered batch sent");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure(count);
                warn!(
                    kind = T::KIND.as_str(),
                    records = count,
                    retryable = e.is_retryable(),
                    error = %e,
                    "dropping batch"
                );
                Err(e)
            }
        }
    }
}
