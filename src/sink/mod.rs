pub mod influx;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One completed observation window for one target.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub organization: String,
    pub target_name: String,
    /// The configured address input, literal or hostname.
    pub original_address: String,
    /// The address actually probed.
    pub resolved_address: Option<IpAddr>,
    /// Effective source address, or "default".
    pub source_address: String,
    pub window_start: DateTime<Utc>,
    pub avg_rtt_ms: f64,
    pub loss_pct: f64,
    pub jitter_ms: f64,
    pub is_dns_name: bool,
}

/// Delivers flushed data points to the time-series store.
pub trait PointWriter: Send + Sync + 'static {
    fn write(&self, points: Vec<DataPoint>) -> impl Future<Output = Result<()>> + Send;
}

/// Accumulates data points and flushes on size, time, or shutdown.
///
/// Writes never block probing: a size-triggered flush hands the batch to a
/// spawned task and write failures are logged, not propagated.
pub struct Batcher<W> {
    writer: Arc<W>,
    queue: Mutex<Vec<DataPoint>>,
    batch_size: usize,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl<W: PointWriter> Batcher<W> {
    pub fn new(writer: Arc<W>, batch_size: usize) -> Self {
        Self {
            writer,
            queue: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            done_rx: Mutex::new(None),
        }
    }

    /// Enqueue a point, flushing immediately once the batch is full.
    pub fn push(&self, point: DataPoint) {
        let batch = {
            let mut queue = self.queue.lock();
            queue.push(point);
            if queue.len() >= self.batch_size {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };

        if let Some(points) = batch {
            debug!(points = points.len(), "flushing batch (size)");
            let writer = Arc::clone(&self.writer);
            tokio::spawn(async move {
                if let Err(e) = writer.write(points).await {
                    warn!(error = %e, "time-series write failed");
                }
            });
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Start the periodic flush task. On cancellation it performs the final
    /// flush before signalling completion.
    pub fn start(self: Arc<Self>, flush_interval: std::time::Duration, cancel: CancellationToken) {
        let (done_tx, done_rx) = oneshot::channel();
        *self.done_rx.lock() = Some(done_rx);

        let batcher = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        batcher.flush("shutdown").await;
                        let _ = done_tx.send(());
                        return;
                    }
                    _ = ticker.tick() => {
                        batcher.flush("timer").await;
                    }
                }
            }
        });
    }

    /// Drain the queue and write it out, if non-empty.
    pub async fn flush(&self, reason: &str) {
        let points = std::mem::take(&mut *self.queue.lock());
        if points.is_empty() {
            return;
        }

        debug!(points = points.len(), reason, "flushing batch");
        if let Err(e) = self.writer.write(points).await {
            warn!(error = %e, reason, "time-series write failed");
        }
    }

    /// Wait for the flush task to finish its shutdown flush.
    pub async fn wait_for_shutdown(&self) {
        let rx = self.done_rx.lock().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingWriter {
        batches: Mutex<Vec<Vec<DataPoint>>>,
        writes: AtomicUsize,
    }

    impl PointWriter for RecordingWriter {
        async fn write(&self, points: Vec<DataPoint>) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().push(points);
            Ok(())
        }
    }

    fn point(name: &str) -> DataPoint {
        DataPoint {
            organization: "net".to_string(),
            target_name: name.to_string(),
            original_address: "192.0.2.1".to_string(),
            resolved_address: Some("192.0.2.1".parse().expect("ip")),
            source_address: "default".to_string(),
            window_start: Utc::now(),
            avg_rtt_ms: 1.0,
            loss_pct: 0.0,
            jitter_ms: 0.0,
            is_dns_name: false,
        }
    }

    #[tokio::test]
    async fn test_size_trigger_flushes() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = Batcher::new(Arc::clone(&writer), 3);

        batcher.push(point("a"));
        batcher.push(point("b"));
        assert_eq!(batcher.pending(), 2);
        assert_eq!(writer.writes.load(Ordering::SeqCst), 0);

        batcher.push(point("c"));
        assert_eq!(batcher.pending(), 0);

        // The size flush runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.batches.lock()[0].len(), 3);
    }

    #[tokio::test]
    async fn test_flush_preserves_enqueue_order() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = Batcher::new(Arc::clone(&writer), 100);

        batcher.push(point("first"));
        batcher.push(point("second"));
        batcher.push(point("third"));
        batcher.flush("test").await;

        let batches = writer.batches.lock();
        let names: Vec<&str> = batches[0].iter().map(|p| p.target_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_timer_trigger_flushes_non_empty_queue() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = Arc::new(Batcher::new(Arc::clone(&writer), 100));
        let cancel = CancellationToken::new();

        Arc::clone(&batcher).start(Duration::from_millis(20), cancel.clone());
        batcher.push(point("a"));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.pending(), 0);

        cancel.cancel();
        batcher.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_performs_final_flush() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = Arc::new(Batcher::new(Arc::clone(&writer), 100));
        let cancel = CancellationToken::new();

        Arc::clone(&batcher).start(Duration::from_secs(3600), cancel.clone());
        batcher.push(point("pending"));

        cancel.cancel();
        batcher.wait_for_shutdown().await;

        assert_eq!(writer.writes.load(Ordering::SeqCst), 1);
        assert_eq!(writer.batches.lock()[0][0].target_name, "pending");
    }

    #[tokio::test]
    async fn test_empty_queue_never_writes() {
        let writer = Arc::new(RecordingWriter::default());
        let batcher = Arc::new(Batcher::new(Arc::clone(&writer), 10));
        let cancel = CancellationToken::new();

        Arc::clone(&batcher).start(Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        batcher.wait_for_shutdown().await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 0);
    }
}
