//! transport.rs
//!
//! Log-shipping transport: collects records into batches and hands each
//! batch to a [`BatchSink`], retrying a bounded number of times.
//!
//! A batch is shipped when it reaches `batch_size`, when `flush_interval`
//! elapses with records waiting, and when the transport is closed. The
//! buffer belongs to a single task, so at most one batch is in flight.
//! A batch that still fails after `max_retries` retries is dropped and
//! logged; the transport carries on with the next one.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::TransportSettings;
use crate::errors::IndexerError;
use crate::metrics::{BATCHES_SENT, BATCH_RETRIES, RECORDS_DROPPED};

/// Destination of shipped batches.
pub trait BatchSink: Send + Sync + 'static {
    fn send_batch(&self, batch: &[Value]) -> impl Future<Output = Result<(), IndexerError>> + Send;
}

/// Running totals, returned when the transport shuts down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub batches_sent: u64,
    pub records_sent: u64,
    pub retries: u64,
    pub batches_dropped: u64,
    pub records_dropped: u64,
}

/// Producer side of a running transport.
pub struct TransportHandle {
    sender: mpsc::Sender<Value>,
    task: JoinHandle<TransportStats>,
}

impl TransportHandle {
    /// Queue one record. Waits while the queue is full.
    pub async fn send(&self, record: Value) -> Result<(), IndexerError> {
        self.sender
            .send(record)
            .await
            .map_err(|_| IndexerError::TransportClosed)
    }

    /// Stop accepting records, ship whatever is buffered, and wait for it.
    pub async fn close(self) -> Result<TransportStats, IndexerError> {
        drop(self.sender);
        Ok(self.task.await?)
    }
}

/// Start a transport task shipping to `sink`.
pub fn spawn<S: BatchSink>(sink: S, settings: &TransportSettings) -> TransportHandle {
    let batch_size = settings.batch_size.max(1);
    let (sender, receiver) = mpsc::channel(batch_size.saturating_mul(4));

    let batcher = Batcher {
        sink,
        buffer: Vec::with_capacity(batch_size),
        batch_size,
        max_retries: settings.max_retries,
        retry_interval: settings.retry_interval,
        stats: TransportStats::default(),
    };
    let task = tokio::spawn(batcher.run(receiver, settings.flush_interval));

    TransportHandle { sender, task }
}

struct Batcher<S> {
    sink: S,
    buffer: Vec<Value>,
    batch_size: usize,
    max_retries: u32,
    retry_interval: Duration,
    stats: TransportStats,
}

impl<S: BatchSink> Batcher<S> {
    async fn run(mut self, mut receiver: mpsc::Receiver<Value>, flush_interval: Duration) -> TransportStats {
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(record) => {
                        self.buffer.push(record);
                        if self.buffer.len() >= self.batch_size {
                            self.flush().await;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        debug!(records = self.buffer.len(), "Flush interval elapsed");
                        self.flush().await;
                    }
                }
            }
        }

        info!(
            batches_sent = self.stats.batches_sent,
            records_sent = self.stats.records_sent,
            records_dropped = self.stats.records_dropped,
            "Transport closed"
        );
        self.stats
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let mut attempt: u32 = 0;

        loop {
            match self.sink.send_batch(&batch).await {
                Ok(()) => {
                    self.stats.batches_sent += 1;
                    self.stats.records_sent += batch.len() as u64;
                    BATCHES_SENT.inc();
                    debug!(records = batch.len(), attempt, "Batch delivered");
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    self.stats.retries += 1;
                    BATCH_RETRIES.inc();
                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        retry_in = ?self.retry_interval,
                        "Batch submission failed, retrying"
                    );
                    sleep(self.retry_interval).await;
                }
                Err(e) => {
                    self.stats.batches_dropped += 1;
                    self.stats.records_dropped += batch.len() as u64;
                    RECORDS_DROPPED.inc_by(batch.len() as u64);
                    error!(
                        error = %e,
                        records = batch.len(),
                        attempts = attempt + 1,
                        "Dropping batch after exhausting retries"
                    );
                    return;
                }
            }
        }
    }
}

/// Lines read by [`pipe_lines`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipeStats {
    pub forwarded: u64,
    pub skipped: u64,
}

/// Forward newline-delimited JSON objects from `reader` into the transport
/// until EOF. Blank lines are ignored; anything that is not a JSON object,
/// invalid UTF-8 included, is skipped with a warning.
pub async fn pipe_lines<R>(mut reader: R, handle: &TransportHandle) -> Result<PipeStats, IndexerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = PipeStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = buf.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(record @ Value::Object(_)) => {
                handle.send(record).await?;
                stats.forwarded += 1;
            }
            Ok(_) => {
                warn!(line = %String::from_utf8_lossy(line), "Skipping line that is not a JSON object");
                stats.skipped += 1;
            }
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "Skipping unparsable line");
                stats.skipped += 1;
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Records every delivered batch; fails the first `failures` attempts.
    struct RecordingSink {
        delivered: UnboundedSender<Vec<Value>>,
        attempts: Arc<AtomicUsize>,
        failures: usize,
    }

    impl BatchSink for RecordingSink {
        async fn send_batch(&self, batch: &[Value]) -> Result<(), IndexerError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(IndexerError::UnexpectedStatus {
                    url: "test://bulk".into(),
                    status: 503,
                });
            }
            let _ = self.delivered.send(batch.to_vec());
            Ok(())
        }
    }

    fn sink(failures: usize) -> (RecordingSink, UnboundedReceiver<Vec<Value>>, Arc<AtomicUsize>) {
        let (delivered, rx) = unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let sink = RecordingSink {
            delivered,
            attempts: attempts.clone(),
            failures,
        };
        (sink, rx, attempts)
    }

    fn settings(batch_size: usize, flush_interval: Duration) -> TransportSettings {
        TransportSettings {
            url: "http://unused".into(),
            batch_size,
            flush_interval,
            max_retries: 2,
            retry_interval: Duration::from_secs(1),
        }
    }

    fn record(n: u64) -> Value {
        json!({ "level": 30, "time": n, "msg": format!("line {n}") })
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_ships_without_waiting_for_interval() {
        let (sink, mut delivered, _) = sink(0);
        let handle = spawn(sink, &settings(3, Duration::from_secs(3600)));
        let start = Instant::now();

        for n in 0..3 {
            handle.send(record(n)).await.unwrap();
        }
        let batch = delivered.recv().await.unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0]["time"], 0);
        assert!(start.elapsed() < Duration::from_secs(3600));

        let stats = handle.close().await.unwrap();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.records_sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_ships_when_interval_elapses() {
        let (sink, mut delivered, _) = sink(0);
        let handle = spawn(sink, &settings(100, Duration::from_secs(5)));
        let start = Instant::now();

        handle.send(record(1)).await.unwrap();
        handle.send(record(2)).await.unwrap();
        let batch = delivered.recv().await.unwrap();

        assert_eq!(batch.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(5));
        handle.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submission_is_retried() {
        let (sink, mut delivered, attempts) = sink(2);
        let handle = spawn(sink, &settings(2, Duration::from_secs(3600)));
        let start = Instant::now();

        handle.send(record(1)).await.unwrap();
        handle.send(record(2)).await.unwrap();
        let batch = delivered.recv().await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(2));

        let stats = handle.close().await.unwrap();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.records_dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_dropped_after_retries_run_out() {
        // Three failures: the first attempt plus both retries of batch one
        let (sink, mut delivered, attempts) = sink(3);
        let handle = spawn(sink, &settings(2, Duration::from_secs(3600)));

        handle.send(record(1)).await.unwrap();
        handle.send(record(2)).await.unwrap();
        handle.send(record(3)).await.unwrap();
        handle.send(record(4)).await.unwrap();

        // The transport keeps going: the second batch still arrives
        let batch = delivered.recv().await.unwrap();
        assert_eq!(batch[0]["time"], 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let stats = handle.close().await.unwrap();
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.records_dropped, 2);
        assert_eq!(stats.batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_the_buffer() {
        let (sink, mut delivered, _) = sink(0);
        let handle = spawn(sink, &settings(100, Duration::from_secs(3600)));

        handle.send(record(1)).await.unwrap();
        let stats = handle.close().await.unwrap();

        assert_eq!(stats.records_sent, 1);
        assert_eq!(delivered.recv().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pipe_forwards_json_objects_only() {
        let (sink, mut delivered, _) = sink(0);
        let handle = spawn(sink, &settings(100, Duration::from_secs(3600)));

        let input: &[u8] = b"{\"level\":30,\"msg\":\"a\"}\n\nnot json\n[1,2]\n{\"level\":40,\"msg\":\"b\"}\n";
        let stats = pipe_lines(input, &handle).await.unwrap();
        assert_eq!(stats, PipeStats { forwarded: 2, skipped: 2 });

        handle.close().await.unwrap();
        let batch = delivered.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1]["msg"], "b");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_utf8_line_is_skipped() {
        let (sink, mut delivered, _) = sink(0);
        let handle = spawn(sink, &settings(100, Duration::from_secs(3600)));

        let input: &[u8] = b"{\"msg\":\"a\"}\n\xff\xfe\n{\"msg\":\"b\"}";
        let stats = pipe_lines(input, &handle).await.unwrap();
        assert_eq!(stats, PipeStats { forwarded: 2, skipped: 1 });

        handle.close().await.unwrap();
        let batch = delivered.recv().await.unwrap();
        assert_eq!(batch[0]["msg"], "a");
        assert_eq!(batch[1]["msg"], "b");
    }
}
