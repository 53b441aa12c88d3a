//! Buffered, atomically-sequenced event emission (spec.md §4.C)

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::event::{Event, EventKind};
use crate::reliability::RetryPolicy;
use crate::store::{EventStore, Snapshot, StoreError};

/// Governs how large the in-memory event buffer is allowed to grow before
/// `record()` starts blocking the caller, and when it is allowed to resume
/// (spec.md §5 "Backpressure"). Hysteresis between the two watermarks
/// mirrors `worker::BackpressureConfig`, adapted from a load ratio to an
/// absolute buffered-event count since the recorder has no fixed
/// concurrency ceiling to divide by.
#[derive(Debug, Clone)]
pub struct RecorderBackpressureConfig {
    /// Buffer length at which `record()` starts blocking.
    pub high_watermark: usize,
    /// Buffer length at which `record()` resumes immediately.
    pub low_watermark: usize,
    /// How long to sleep between checks while blocked.
    pub poll_interval: Duration,
}

impl Default for RecorderBackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 10_000,
            low_watermark: 2_000,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Tunables for a [`Recorder`] instance.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Events per append flush (spec.md §6 `batch_size`, default 10).
    pub batch_size: usize,
    /// Bound on a single `append_events` call.
    pub flush_timeout: Duration,
    /// Retry policy applied to `StoreUnavailable` failures on flush.
    pub retry_policy: RetryPolicy,
    pub backpressure: RecorderBackpressureConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_timeout: Duration::from_secs(10),
            retry_policy: RetryPolicy::exponential(),
            backpressure: RecorderBackpressureConfig::default(),
        }
    }
}

/// Error surfaced by the recorder. `StoreUnavailable` is only returned
/// after the configured retry budget is exhausted (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("event store unavailable after retries: {0}")]
    StoreUnavailable(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl From<StoreError> for RecorderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => Self::Validation(msg),
            StoreError::SequenceConflict { .. } => Self::Validation(err.to_string()),
            other => Self::StoreUnavailable(other.to_string()),
        }
    }
}

/// A single recorder owned by exactly one execution. Accepts typed events
/// through [`Recorder::record`], stamps `event_id`/`sequence`, buffers
/// them under a mutex, and flushes to the store either when the batch
/// fills or on explicit [`Recorder::flush`].
///
/// `set_replay_mode(true)` makes `record` a no-op other than advancing the
/// in-memory sequence counter, used during history-driven reconstruction
/// so a replay never re-emits events that are already in the log.
pub struct Recorder {
    execution_id: Uuid,
    store: Arc<dyn EventStore>,
    sequence: AtomicI64,
    buffer: Mutex<Vec<Event>>,
    config: RecorderConfig,
    replay_mode: AtomicBool,
    flushed: Notify,
}

impl Recorder {
    pub fn new(execution_id: Uuid, store: Arc<dyn EventStore>, config: RecorderConfig) -> Self {
        Self {
            execution_id,
            store,
            sequence: AtomicI64::new(0),
            buffer: Mutex::new(Vec::new()),
            config,
            replay_mode: AtomicBool::new(false),
            flushed: Notify::new(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Last sequence number handed out. 0 before the first event.
    pub fn current_sequence(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Advance the sequence counter without emitting anything, used by the
    /// replayer to prime a recorder that will resume live recording after
    /// reconstructing from history.
    pub fn fast_forward_sequence(&self, to: i64) {
        self.sequence.store(to, Ordering::SeqCst);
    }

    pub fn set_replay_mode(&self, enabled: bool) {
        self.replay_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn is_replay_mode(&self) -> bool {
        self.replay_mode.load(Ordering::SeqCst)
    }

    /// Record a typed event. In replay mode this is a no-op (the sequence
    /// counter does not advance, since replay derives sequence from the
    /// events it is fed rather than minting new ones).
    #[instrument(skip(self, kind), fields(execution_id = %self.execution_id))]
    pub async fn record(
        &self,
        kind: EventKind,
        path_id: Option<Uuid>,
        step_name: Option<String>,
    ) -> Result<(), RecorderError> {
        if self.is_replay_mode() {
            return Ok(());
        }

        self.wait_for_capacity().await;

        // The sequence is stamped inside the same critical section as the
        // push so two concurrent path workers can never take sequences N
        // and N+1 but buffer them in the opposite order (spec.md §5
        // ordering, invariant §8.1).
        let should_flush = {
            let mut buffer = self.buffer.lock();
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let event = Event::new(self.execution_id, sequence, path_id, step_name, kind);
            buffer.push(event);
            buffer.len() >= self.config.batch_size
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn wait_for_capacity(&self) {
        loop {
            let len = self.buffer.lock().len();
            if len < self.config.backpressure.high_watermark {
                return;
            }
            warn!(buffer_len = len, "recorder buffer above high watermark, blocking");
            tokio::time::sleep(self.config.backpressure.poll_interval).await;
            if self.buffer.lock().len() <= self.config.backpressure.low_watermark {
                return;
            }
        }
    }

    /// Swap out the buffer and append it to the store, with bounded
    /// exponential-backoff retry on `StoreUnavailable`-shaped failures.
    /// An empty buffer flush is a no-op success that never touches the store.
    #[instrument(skip(self), fields(execution_id = %self.execution_id))]
    pub async fn flush(&self) -> Result<(), RecorderError> {
        let pending: Vec<Event> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };

        let mut attempt = 1u32;
        loop {
            let result = tokio::time::timeout(
                self.config.flush_timeout,
                self.store.append_events(self.execution_id, &pending),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    debug!(count = pending.len(), "flushed events");
                    self.flushed.notify_waiters();
                    return Ok(());
                }
                Ok(Err(StoreError::SequenceConflict { .. })) | Ok(Err(StoreError::Validation(_))) => {
                    let err = result.unwrap().unwrap_err();
                    return Err(err.into());
                }
                Ok(Err(other)) => {
                    if !self.config.retry_policy.has_attempts_remaining(attempt) {
                        return Err(RecorderError::StoreUnavailable(other.to_string()));
                    }
                }
                Err(_elapsed) => {
                    if !self.config.retry_policy.has_attempts_remaining(attempt) {
                        return Err(RecorderError::StoreUnavailable(
                            "append_events timed out".into(),
                        ));
                    }
                }
            }

            let delay = self.config.retry_policy.delay_for_attempt(attempt + 1);
            warn!(attempt, ?delay, "retrying event append after store failure");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Path-aware snapshot save; delegates to the store.
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), RecorderError> {
        self.store.save_snapshot(snapshot).await.map_err(Into::into)
    }

    /// Number of events currently buffered and not yet flushed.
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Resolve on the next flush that actually appends events (an empty
    /// buffer flush is a no-op and does not notify). Used to re-check
    /// continuation thresholds as history grows rather than on a fixed
    /// poll.
    pub async fn wait_for_flush(&self) {
        self.flushed.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;

    fn recorder(batch_size: usize) -> (Arc<InMemoryEventStore>, Recorder) {
        let store = Arc::new(InMemoryEventStore::new());
        let execution_id = Uuid::now_v7();
        let config = RecorderConfig {
            batch_size,
            ..RecorderConfig::default()
        };
        let recorder = Recorder::new(execution_id, store.clone(), config);
        (store, recorder)
    }

    #[tokio::test]
    async fn test_record_assigns_monotonic_sequence() {
        let (_store, recorder) = recorder(100);
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        assert_eq!(recorder.current_sequence(), 2);
    }

    #[tokio::test]
    async fn test_flush_triggered_at_batch_size() {
        let (store, recorder) = recorder(2);
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        assert_eq!(recorder.buffered_len(), 1);
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        // batch size reached -> auto-flushed
        assert_eq!(recorder.buffered_len(), 0);

        let history = store.get_history(recorder.execution_id()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_buffer_flush_is_noop_success() {
        let (store, recorder) = recorder(10);
        recorder.flush().await.unwrap();
        let history = store.get_history(recorder.execution_id()).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_replay_mode_skips_emission() {
        let (store, recorder) = recorder(10);
        recorder.set_replay_mode(true);
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        assert_eq!(recorder.buffered_len(), 0);
        recorder.flush().await.unwrap();
        let history = store.get_history(recorder.execution_id()).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_flush_persists_partial_batch() {
        let (store, recorder) = recorder(10);
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        recorder.flush().await.unwrap();
        let history = store.get_history(recorder.execution_id()).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    // A current-thread runtime never preempts between two `record()` calls,
    // so this needs real OS-thread concurrency to exercise the race the
    // sequence-under-lock fix closes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_record_keeps_buffer_order_monotonic() {
        let (store, recorder) = recorder(1_000_000);
        let recorder = Arc::new(recorder);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        recorder.flush().await.unwrap();
        let history = store.get_history(recorder.execution_id()).await.unwrap();
        assert_eq!(history.len(), 400);
        let sequences: Vec<i64> = history.iter().map(|e| e.sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted, "buffer order must equal sequence order");
    }

    #[tokio::test]
    async fn test_wait_for_flush_resolves_after_append() {
        let (_store, recorder) = recorder(10);
        let recorder = Arc::new(recorder);
        let waiter = recorder.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_flush().await });

        // Give the waiter a chance to register before the notification fires.
        tokio::task::yield_now().await;
        recorder.record(EventKind::PathCompleted, None, None).await.unwrap();
        recorder.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait_for_flush did not resolve")
            .unwrap();
    }
}
