//! Pipeline transforms
//!
//! Small bounded-memory helpers shared by the import and export pipelines:
//! fixed-size batching, byte counting on a reader, and a throughput meter
//! that reports periodically to a callback.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, ReadBuf};

/// Groups upstream items into fixed-size batches.
pub struct Batcher<T> {
    capacity: usize,
    items: Vec<T>,
}

impl<T> Batcher<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Vec::with_capacity(capacity.max(1)),
        }
    }

    /// Push one item; returns a full batch when the capacity is reached.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.items,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    /// Flush the final partial batch, if any.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.items))
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Pass-through reader that counts the bytes flowing by.
pub struct CountingReader<R> {
    inner: R,
    total: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle on the running byte total; stays valid after the reader is
    /// consumed by a decoder.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.total.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = (buf.filled().len() - before) as u64;
            this.total.fetch_add(read, Ordering::Relaxed);
        }
        poll
    }
}

/// Periodic throughput report.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputReport {
    pub total_rows: u64,
    pub rows_per_second: f64,
    pub elapsed_ms: u64,
}

/// Counts rows and reports throughput on a fixed interval.
///
/// Interval reports carry the rate since the previous report; the final
/// report carries the whole-run average.
pub struct ThroughputMeter<F: FnMut(ThroughputReport)> {
    started_at: Instant,
    last_report_at: Instant,
    rows_at_last_report: u64,
    total_rows: u64,
    interval: Duration,
    report: F,
}

/// Default reporting interval.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

impl<F: FnMut(ThroughputReport)> ThroughputMeter<F> {
    pub fn new(interval: Duration, report: F) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            last_report_at: now,
            rows_at_last_report: 0,
            total_rows: 0,
            interval,
            report,
        }
    }

    /// Record `rows` processed rows; emits an interval report when due.
    pub fn add(&mut self, rows: u64) {
        self.total_rows += rows;
        let since_last = self.last_report_at.elapsed();
        if since_last >= self.interval {
            let delta = self.total_rows - self.rows_at_last_report;
            (self.report)(ThroughputReport {
                total_rows: self.total_rows,
                rows_per_second: delta as f64 / since_last.as_secs_f64(),
                elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            });
            self.last_report_at = Instant::now();
            self.rows_at_last_report = self.total_rows;
        }
    }

    /// Emit the final whole-run report and return it.
    pub fn finish(mut self) -> ThroughputReport {
        let elapsed = self.started_at.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            self.total_rows as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let report = ThroughputReport {
            total_rows: self.total_rows,
            rows_per_second: rate,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        (self.report)(report.clone());
        report
    }

    pub fn total_rows(&self) -> u64 {
        self.total_rows
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_batcher_emits_full_batches() {
        let mut batcher = Batcher::new(3);
        assert!(batcher.push(1).is_none());
        assert!(batcher.push(2).is_none());
        assert_eq!(batcher.push(3), Some(vec![1, 2, 3]));
        assert!(batcher.push(4).is_none());
        assert_eq!(batcher.flush(), Some(vec![4]));
        assert_eq!(batcher.flush(), None);
    }

    #[test]
    fn test_batcher_flush_empty() {
        let mut batcher: Batcher<i32> = Batcher::new(10);
        assert_eq!(batcher.flush(), None);
    }

    #[tokio::test]
    async fn test_counting_reader() {
        let data = vec![7u8; 10_000];
        let reader = CountingReader::new(data.as_slice());
        let counter = reader.counter();
        let mut reader = reader;
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 10_000);
    }

    #[test]
    fn test_throughput_meter_final_report() {
        let mut reports = Vec::new();
        let meter = {
            let mut meter =
                ThroughputMeter::new(Duration::from_secs(3600), |r| reports.push(r));
            meter.add(500);
            meter.add(500);
            meter
        };
        let last = meter.finish();
        assert_eq!(last.total_rows, 1000);
        assert_eq!(reports.len(), 1, "only the final report fired");
    }

    #[test]
    fn test_throughput_meter_interval_report() {
        let mut count = 0;
        let mut meter = ThroughputMeter::new(Duration::ZERO, |_| count += 1);
        meter.add(1);
        meter.add(1);
        drop(meter);
        assert!(count >= 2, "zero interval reports on every add");
    }
}
