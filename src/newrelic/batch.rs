//! Batching buffer for converted records.
//!
//! A batch is sealed when it reaches `max_records`, or when adding another
//! record would push the serialized request body past `max_payload_bytes`. The
//! body size counts the envelope and common block as well as the records and
//! the commas between them. A record that does not fit even in an otherwise
//! empty body travels in a batch by itself.
//! Time-based flushing is left to the owner via [`BatchBuffer::should_flush`].

use std::time::Duration;

use tokio::time::Instant;

use crate::newrelic::model::{CommonBlock, WireBatch, WireRecord};

/// Thresholds for sealing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_records: usize,
    /// Upper bound on the uncompressed JSON size of one batch
    pub max_payload_bytes: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: 1_000,
            max_payload_bytes: 1_000_000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Counters for a single buffer (plain u64, owned by one task).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchMetrics {
    pub records_buffered: u64,
    pub batches_sealed: u64,
}

/// Estimated wire size of a record. Falls back to zero if it cannot serialize,
/// in which case the transport reports the error.
pub fn record_size<T: WireRecord>(record: &T) -> usize {
    serde_json::to_vec(record).map(|v| v.len()).unwrap_or(0)
}

/// Size of a request body carrying `common` and no records.
pub fn envelope_size<T: WireRecord>(common: &CommonBlock) -> usize {
    WireBatch::<T>::new(common.clone(), Vec::new())
        .to_json()
        .map(|v| v.len())
        .unwrap_or(0)
}

pub struct BatchBuffer<T: WireRecord> {
    pending: Vec<T>,
    /// Records plus separators, without the envelope
    pending_bytes: usize,
    envelope_bytes: usize,
    config: BatchConfig,
    metrics: BatchMetrics,
    last_flush: Instant,
}

impl<T: WireRecord> BatchBuffer<T> {
    /// Creates a buffer whose batches will be sent under `common`.
    pub fn new(config: BatchConfig, common: &CommonBlock) -> Self {
        Self {
            pending: Vec::new(),
            pending_bytes: 0,
            envelope_bytes: envelope_size::<T>(common),
            config,
            metrics: BatchMetrics::default(),
            last_flush: Instant::now(),
        }
    }

    /// Adds a record. Returns the sealed batch if this record did not fit into it.
    pub fn add(&mut self, record: T) -> Option<Vec<T>> {
        let size = record_size(&record);
        let sealed = if self.would_overflow(size) {
            self.seal()
        } else {
            None
        };

        if !self.pending.is_empty() {
            self.pending_bytes += 1;
        }
        self.pending.push(record);
        self.pending_bytes += size;
        self.metrics.records_buffered += 1;
        sealed
    }

    fn would_overflow(&self, size: usize) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= self.config.max_records
                || self.payload_bytes() + 1 + size > self.config.max_payload_bytes)
    }

    fn seal(&mut self) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending_bytes = 0;
        self.metrics.batches_sealed += 1;
        Some(std::mem::take(&mut self.pending))
    }

    pub fn total_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Serialized size of the pending records as one request body.
    pub fn payload_bytes(&self) -> usize {
        self.envelope_bytes + self.pending_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= self.config.max_records
                || self.last_flush.elapsed() >= self.config.flush_interval)
    }

    /// Takes everything pending and restarts the flush timer.
    pub fn take_batch(&mut self) -> Option<Vec<T>> {
        self.last_flush = Instant::now();
        self.seal()
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

/// Partitions `records` into batches that respect the count and byte limits
/// once wrapped with `common`.
pub fn split_into_batches<T: WireRecord>(
    records: Vec<T>,
    common: &CommonBlock,
    config: &BatchConfig,
) -> Vec<Vec<T>> {
    let mut buffer = BatchBuffer::new(config.clone(), common);
    let mut batches = Vec::new();
    for record in records {
        if let Some(batch) = buffer.add(record) {
            batches.push(batch);
        }
    }
    if let Some(batch) = buffer.take_batch() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newrelic::model::{Attributes, Metric};

    fn metric(i: usize) -> Metric {
        Metric::gauge(format!("m{i}"), i as f64, 1_000)
    }

    fn buffer(config: BatchConfig) -> BatchBuffer<Metric> {
        BatchBuffer::new(config, &CommonBlock::default())
    }

    fn config(max_records: usize, max_payload_bytes: usize) -> BatchConfig {
        BatchConfig {
            max_records,
            max_payload_bytes,
            flush_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn seals_when_count_limit_reached() {
        let mut buffer = buffer(config(3, usize::MAX));

        assert!(buffer.add(metric(0)).is_none());
        assert!(buffer.add(metric(1)).is_none());
        assert!(buffer.add(metric(2)).is_none());
        assert!(buffer.should_flush());

        let sealed = buffer.add(metric(3)).unwrap();

        assert_eq!(sealed.len(), 3);
        assert_eq!(buffer.total_pending(), 1);
        assert_eq!(buffer.metrics().batches_sealed, 1);
        assert_eq!(buffer.metrics().records_buffered, 4);
    }

    #[test]
    fn seals_when_byte_limit_would_be_exceeded() {
        let size = record_size(&metric(1));
        let envelope = envelope_size::<Metric>(&CommonBlock::default());
        let mut buffer = buffer(config(100, envelope + size * 2 + 1));

        assert!(buffer.add(metric(1)).is_none());
        assert!(buffer.add(metric(2)).is_none());
        assert_eq!(buffer.pending_bytes(), size * 2 + 1);
        assert_eq!(buffer.payload_bytes(), envelope + size * 2 + 1);

        let sealed = buffer.add(metric(3)).unwrap();
        assert_eq!(sealed.len(), 2);
        assert_eq!(buffer.pending_bytes(), size);
    }

    #[test]
    fn envelope_and_separators_count_against_byte_limit() {
        let size = record_size(&metric(1));
        let mut buffer = buffer(config(100, size * 2 + 1));

        assert!(buffer.add(metric(1)).is_none());
        let sealed = buffer.add(metric(2)).unwrap();

        assert_eq!(sealed.len(), 1);
    }

    #[test]
    fn oversized_record_travels_alone() {
        let mut buffer = buffer(config(100, 1));

        assert!(buffer.add(metric(1)).is_none());
        let sealed = buffer.add(metric(2)).unwrap();

        assert_eq!(sealed.len(), 1);
        assert_eq!(buffer.total_pending(), 1);
    }

    #[test]
    fn take_batch_empties_buffer() {
        let mut buffer = buffer(config(10, usize::MAX));
        assert!(buffer.take_batch().is_none());

        buffer.add(metric(0));
        buffer.add(metric(1));

        assert_eq!(buffer.take_batch().unwrap().len(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.pending_bytes(), 0);
        assert!(!buffer.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn should_flush_after_interval() {
        let mut buffer = buffer(BatchConfig {
            flush_interval: Duration::from_secs(5),
            ..config(10, usize::MAX)
        });
        buffer.add(metric(0));
        assert!(!buffer.should_flush());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(buffer.should_flush());
    }

    #[test]
    fn split_partitions_without_loss_or_duplication() {
        let records: Vec<Metric> = (0..10).map(metric).collect();

        let batches = split_into_batches(records, &CommonBlock::default(), &config(4, usize::MAX));

        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        let names: Vec<String> = batches.into_iter().flatten().map(|m| m.name).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn split_of_empty_input_is_empty() {
        let batches = split_into_batches(
            Vec::<Metric>::new(),
            &CommonBlock::default(),
            &BatchConfig::default(),
        );
        assert!(batches.is_empty());
    }

    #[test]
    fn split_batches_fit_the_payload_limit_when_serialized() {
        let common = CommonBlock {
            interval_ms: Some(60_000),
            ..CommonBlock::new(Attributes::new().with("service.name", "billing"))
        };
        let records: Vec<Metric> = (0..40).map(metric).collect();
        let limit = envelope_size::<Metric>(&common) + 3 * record_size(&metric(10));

        let batches = split_into_batches(records, &common, &config(100, limit));

        assert!(batches.len() > 1);
        for records in batches {
            let body = WireBatch::new(common.clone(), records).to_json().unwrap();
            assert!(body.len() <= limit, "{} > {limit}", body.len());
        }
    }
}
