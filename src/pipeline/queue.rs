//! Backpressure-aware handoff of frames to the shared worker queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, warn};

use crate::capture::Frame;
use crate::error::QueueError;
use crate::utils::timestamp_ms;

/// Metadata key set on frames that had to wait for queue capacity
pub const BLOCKED_TIMESTAMP_KEY: &str = "ts_ingestor_blocked";

/// Why a non-blocking enqueue did not take the frame. The frame is handed back.
pub enum TryPushError {
    Full(Frame),
    Closed(Frame),
}

/// Bounded queue shared between ingestion and the worker pool
pub trait FrameQueue: Send + Sync {
    /// Enqueue without waiting.
    fn try_push(&self, frame: Frame) -> Result<(), TryPushError>;

    /// Enqueue, waiting for capacity. Fails only when the queue is torn down.
    fn push_wait(&self, frame: Frame) -> Result<(), Frame>;
}

impl FrameQueue for flume::Sender<Frame> {
    fn try_push(&self, frame: Frame) -> Result<(), TryPushError> {
        self.try_send(frame).map_err(|e| match e {
            flume::TrySendError::Full(frame) => TryPushError::Full(frame),
            flume::TrySendError::Disconnected(frame) => TryPushError::Closed(frame),
        })
    }

    fn push_wait(&self, frame: Frame) -> Result<(), Frame> {
        self.send(frame).map_err(|e| e.into_inner())
    }
}

/// How a successful push went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Immediate,
    /// The queue was full and the blocking fallback was used
    Blocked,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_blocked: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Snapshot of queue client counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: usize,
    pub blocked: usize,
    pub dropped: usize,
}

/// Producer-side handle on the frame queue
#[derive(Clone)]
pub struct QueueClient {
    queue: Arc<dyn FrameQueue>,

    /// Statistics
    stats: Arc<CachePadded<Stats>>,
}

impl QueueClient {
    pub fn new(queue: Arc<dyn FrameQueue>) -> Self {
        Self {
            queue,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    pub fn from_sender(tx: flume::Sender<Frame>) -> Self {
        Self::new(Arc::new(tx))
    }

    /// Hand a frame over to the queue.
    ///
    /// Falls back to a blocking push when the queue is full, after stamping the
    /// frame with [`BLOCKED_TIMESTAMP_KEY`]. On success the queue owns the frame;
    /// on failure it has already been discarded.
    pub fn push(&self, frame: Frame) -> Result<PushOutcome, QueueError> {
        let frame = match self.queue.try_push(frame) {
            Ok(()) => {
                self.record_pushed();
                return Ok(PushOutcome::Immediate);
            }
            Err(TryPushError::Closed(frame)) => {
                self.discard(frame);
                return Err(QueueError::Closed);
            }
            Err(TryPushError::Full(frame)) => frame,
        };

        let mut frame = frame;
        // Stamped before the handoff; the frame is off limits afterwards
        if let Err(e) = frame.meta_mut().put(BLOCKED_TIMESTAMP_KEY, timestamp_ms()) {
            warn!("Failed to record queue blocking marker: {}", e);
        }
        self.stats.frames_blocked.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_frames_blocked_total").increment(1);
        debug!("Frame queue full, waiting for capacity");

        match self.queue.push_wait(frame) {
            Ok(()) => {
                self.record_pushed();
                Ok(PushOutcome::Blocked)
            }
            Err(frame) => {
                self.discard(frame);
                Err(QueueError::Closed)
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.stats.frames_pushed.load(Ordering::Relaxed),
            blocked: self.stats.frames_blocked.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }

    fn record_pushed(&self) {
        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_frames_pushed_total").increment(1);
    }

    fn discard(&self, frame: Frame) {
        error!("Failed to enqueue frame, frame dropped");
        drop(frame);
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_frames_dropped_total").increment(1);
    }
}
