//! Polling ingestion.
//!
//! One dedicated worker thread reads frames synchronously and pushes them to
//! the queue. The stop flag plus a thread join is the only coordination with
//! the controlling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::frame::{Frame, PixelBuffer, ReleaseFn};
use crate::capture::lifecycle::{IngestorState, StateCell};
use crate::capture::synthetic::{SyntheticCapture, STUB_SCHEME};
use crate::error::{ConfigError, IngestError, Result};
use crate::pipeline::QueueClient;
use crate::utils::timestamp_ms;
use crate::IngestorConfig;

/// Metadata key holding the per-run frame sequence number
pub const FRAME_NUMBER_KEY: &str = "frame_number";
/// Profiling marker: frame entered the ingestor
pub const PROFILE_ENTRY_KEY: &str = "ts_ingestor_entry";
/// Profiling marker: frame is about to be queued
pub const PROFILE_QUEUE_KEY: &str = "ts_filter_queue_entry";

/// How often a halted reader checks whether it has been asked to stop
const HALT_CHECK_INTERVAL: Duration = Duration::from_millis(250);
/// Back-off after a read that produced nothing usable
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Pixels produced by a capture handle
pub struct RawImage {
    pub buffer: Box<dyn PixelBuffer>,
    pub release: Option<ReleaseFn>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RawImage {
    pub fn owned(pixels: impl PixelBuffer + 'static, width: u32, height: u32, channels: u32) -> Self {
        Self {
            buffer: Box::new(pixels),
            release: None,
            width,
            height,
            channels,
        }
    }

    /// What a capture handle yields when it has nothing
    pub fn empty() -> Self {
        Self::owned(Vec::<u8>::new(), 0, 0, 0)
    }

    fn into_frame(self) -> Frame {
        Frame::from_parts(self.buffer, self.release, self.width, self.height, self.channels)
    }
}

pub enum ReadOutcome {
    Frame(RawImage),
    EndOfStream,
    /// The read failed but the handle still produced an image (possibly malformed)
    Failed { reason: String, image: RawImage },
}

/// Synchronous capture handle, exclusively owned by one reader
pub trait CaptureDevice: Send {
    /// Block until the next frame is available.
    fn read(&mut self) -> ReadOutcome;
    fn release(&mut self);
}

/// Open a capture handle for the given descriptor.
pub fn open_capture(descriptor: &str) -> Result<Box<dyn CaptureDevice>> {
    if descriptor.starts_with(STUB_SCHEME) {
        return Ok(Box::new(SyntheticCapture::open(descriptor)?));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    {
        Ok(Box::new(crate::capture::gst_capture::GstCaptureDevice::open(descriptor)?))
    }
    #[cfg(not(feature = "gstreamer-pipeline"))]
    {
        Err(IngestError::ResourceAcquisition(format!(
            "pipeline '{}' requires the gstreamer-pipeline feature",
            descriptor
        )))
    }
}

/// Sequence numbers for polled frames. Wraps to zero instead of overflowing.
#[derive(Debug, Default, Clone)]
pub struct FrameCounter {
    current: i64,
}

impl FrameCounter {
    pub fn next(&mut self) -> i64 {
        if self.current == i64::MAX {
            warn!("Frame count has reached i64::MAX, resetting it back to zero");
            self.current = 0;
        } else {
            self.current += 1;
        }
        self.current
    }

    #[cfg(test)]
    fn starting_at(current: i64) -> Self {
        Self { current }
    }
}

/// Reads frames from a capture handle, applying loop and duplicate policies
pub struct FrameReader {
    config: IngestorConfig,
    capture: Option<Box<dyn CaptureDevice>>,
    stop: Arc<AtomicBool>,
}

impl FrameReader {
    pub fn new(config: IngestorConfig, stop: Arc<AtomicBool>) -> Self {
        Self {
            config,
            capture: None,
            stop,
        }
    }

    /// Try to open the capture handle. Failure is logged and retried on the next read.
    pub fn open(&mut self) -> bool {
        match open_capture(&self.config.pipeline) {
            Ok(capture) => {
                self.capture = Some(capture);
                true
            }
            Err(e) => {
                error!("Failed to open pipeline {}: {}", self.config.pipeline, e);
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    pub fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
            debug!("Capture object released");
        }
    }

    /// Read one frame.
    ///
    /// At end of stream the handle is reopened when looping is enabled. Otherwise
    /// the reader parks until the ingestor is stopped and returns
    /// [`IngestError::Halted`]; it never yields another frame.
    pub fn read(&mut self) -> Result<Frame> {
        if self.capture.is_none() && !self.open() {
            return Err(IngestError::ResourceAcquisition(format!(
                "capture {} is not open",
                self.config.pipeline
            )));
        }

        let image = match self.read_once()? {
            ReadOutcome::Frame(image) => image,
            ReadOutcome::Failed { reason, image } => {
                error!("Failed to read frame from video capture: {}", reason);
                image
            }
            ReadOutcome::EndOfStream => self.handle_end_of_stream()?,
        };

        debug!("Frame read successfully");
        let mut frame = image.into_frame();

        if self.config.double_frames {
            let duplicate = frame.clone_unencoded();
            frame.set_duplicate(duplicate);
        }

        if let Some(delay) = self.config.poll_delay() {
            thread::sleep(delay);
        }

        Ok(frame)
    }

    fn read_once(&mut self) -> Result<ReadOutcome> {
        let capture = self.capture.as_mut().ok_or_else(|| {
            IngestError::ResourceAcquisition(format!("capture {} is not open", self.config.pipeline))
        })?;
        Ok(capture.read())
    }

    fn handle_end_of_stream(&mut self) -> Result<RawImage> {
        if !self.config.loop_video {
            warn!("Video ended...");
            return Err(self.halt());
        }

        warn!("Video ended. Looping...");
        self.release();
        if !self.open() {
            return Err(IngestError::ResourceAcquisition(format!(
                "failed to reopen {}",
                self.config.pipeline
            )));
        }

        match self.read_once()? {
            ReadOutcome::Frame(image) => Ok(image),
            ReadOutcome::Failed { reason, image } => {
                error!("Failed to read frame after reopening capture: {}", reason);
                Ok(image)
            }
            ReadOutcome::EndOfStream => Err(IngestError::Backend(format!(
                "{} produced no frames after reopening",
                self.config.pipeline
            ))),
        }
    }

    /// Park the reader. Only a stop request gets it out.
    fn halt(&self) -> IngestError {
        while !self.stop.load(Ordering::Acquire) {
            thread::sleep(HALT_CHECK_INTERVAL);
        }
        IngestError::Halted
    }
}

/// Run continuously, or stop after the first frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Continuous,
    Snapshot,
}

struct PollingWorker {
    reader: FrameReader,
    queue: QueueClient,
    counter: FrameCounter,
    stop: Arc<AtomicBool>,
    snapshot_tx: flume::Sender<i64>,
    profiling: bool,
}

impl PollingWorker {
    fn run(mut self, mode: RunMode) -> FrameReader {
        info!("Ingestor thread running");

        while !self.stop.load(Ordering::Acquire) {
            let mut frame = match self.reader.read() {
                Ok(frame) => frame,
                Err(IngestError::Halted) => break,
                Err(e) => {
                    error!("{}", e);
                    self.pause(READ_RETRY_DELAY);
                    continue;
                }
            };

            if self.profiling {
                if let Err(e) = frame.meta_mut().put(PROFILE_ENTRY_KEY, timestamp_ms()) {
                    error!("Failed to put profiling metadata: {}", e);
                }
            }

            let frame_number = self.counter.next();
            if let Err(e) = frame.meta_mut().put(FRAME_NUMBER_KEY, frame_number) {
                error!("Failed to put frame_number in metadata: {}", e);
                continue;
            }
            debug!("Frame number: {}", frame_number);

            if self.profiling {
                if let Err(e) = frame.meta_mut().put(PROFILE_QUEUE_KEY, timestamp_ms()) {
                    error!("Failed to put profiling metadata: {}", e);
                }
            }

            if let Err(e) = frame.set_encoding(self.reader.config.encoding) {
                error!("Failed to set frame encoding: {}", e);
            }

            if let Err(e) = self.queue.push(frame) {
                error!("Frame {} lost: {}", frame_number, e);
            }

            if mode == RunMode::Snapshot {
                self.stop.store(true, Ordering::Release);
                let _ = self.snapshot_tx.send(frame_number);
            }
        }

        info!("Ingestor thread stopped");
        self.reader
    }

    fn pause(&self, delay: Duration) {
        let step = HALT_CHECK_INTERVAL.min(delay);
        let mut waited = Duration::ZERO;
        while waited < delay && !self.stop.load(Ordering::Acquire) {
            thread::sleep(step);
            waited += step;
        }
    }
}

/// Ingestor that actively polls its capture handle on a worker thread.
///
/// Reusable: `run()` may be called again after `stop()`.
pub struct PollingIngestor {
    queue: QueueClient,
    profiling: bool,
    state: StateCell,
    stop: Arc<AtomicBool>,
    reader: Option<FrameReader>,
    worker: Option<JoinHandle<FrameReader>>,
    snapshot_tx: flume::Sender<i64>,
    snapshot_rx: flume::Receiver<i64>,
}

impl PollingIngestor {
    pub fn new(config: IngestorConfig, queue: QueueClient) -> Result<Self> {
        if config.pipeline.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "pipeline",
                reason: "descriptor is empty".into(),
            }
            .into());
        }

        info!("Pipeline: {}", config.pipeline);
        info!("Loop video: {}, double frames: {}", config.loop_video, config.double_frames);

        let stop = Arc::new(AtomicBool::new(false));
        let profiling = config.profiling;
        let mut reader = FrameReader::new(config, Arc::clone(&stop));
        reader.open();

        let (snapshot_tx, snapshot_rx) = flume::unbounded();
        Ok(Self {
            queue,
            profiling,
            state: StateCell::new(IngestorState::Idle),
            stop,
            reader: Some(reader),
            worker: None,
            snapshot_tx,
            snapshot_rx,
        })
    }

    pub fn state(&self) -> IngestorState {
        self.state.get()
    }

    /// Delivers the frame number once a snapshot run has pushed its frame.
    pub fn snapshot_signal(&self) -> &flume::Receiver<i64> {
        &self.snapshot_rx
    }

    /// Read one frame on the calling thread. Only valid while idle.
    pub fn read(&mut self) -> Result<Frame> {
        match self.reader.as_mut() {
            Some(reader) if self.state.get() == IngestorState::Idle => reader.read(),
            _ => Err(IngestError::InvalidState(format!(
                "read() while ingestor is {}",
                self.state.get()
            ))),
        }
    }

    /// Spawn the worker thread.
    pub fn run(&mut self, mode: RunMode) -> Result<()> {
        self.state
            .transition(IngestorState::Idle, IngestorState::Running)
            .map_err(|s| IngestError::InvalidState(format!("cannot run ingestor in state {}", s)))?;

        let Some(reader) = self.reader.take() else {
            self.state.set(IngestorState::Idle);
            return Err(IngestError::InvalidState("capture reader missing".into()));
        };

        // A signal nobody consumed belongs to an earlier run
        let stale = self.snapshot_rx.drain().count();
        if stale > 0 {
            debug!("Discarded {} unconsumed snapshot signal(s)", stale);
        }

        self.stop.store(false, Ordering::Release);
        let worker = PollingWorker {
            reader,
            queue: self.queue.clone(),
            counter: FrameCounter::default(),
            stop: Arc::clone(&self.stop),
            snapshot_tx: self.snapshot_tx.clone(),
            profiling: self.profiling,
        };

        let handle = thread::Builder::new()
            .name("polling-ingestor".into())
            .spawn(move || worker.run(mode));

        match handle {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.set(IngestorState::Stopped);
                Err(IngestError::Backend(format!("failed to spawn ingestor thread: {}", e)))
            }
        }
    }

    /// Stop the worker and wait for it, then release the capture handle.
    ///
    /// Once this returns no further read or push happens until the next `run()`.
    pub fn stop(&mut self) -> Result<()> {
        if self.state.get() == IngestorState::Running {
            self.state.set(IngestorState::Stopping);
        }
        self.stop.store(true, Ordering::Release);

        let joined = self.worker.take().map(|handle| handle.join());
        let result = match joined {
            Some(Ok(reader)) => {
                self.reader = Some(reader);
                Ok(())
            }
            Some(Err(_)) => Err(IngestError::Backend("ingestor thread panicked".into())),
            None => Ok(()),
        };

        info!("Releasing video capture object");
        if let Some(reader) = self.reader.as_mut() {
            reader.release();
        }

        self.stop.store(false, Ordering::Release);
        if result.is_ok() {
            self.state.set(IngestorState::Idle);
        } else {
            self.state.set(IngestorState::Stopped);
        }
        result
    }
}

impl Drop for PollingIngestor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            if let Ok(mut reader) = handle.join() {
                reader.release();
            }
        } else if let Some(reader) = self.reader.as_mut() {
            reader.release();
        }
    }
}
