//! Event-driven ingestion.
//!
//! The capture subsystem owns the streaming thread and calls back into us
//! whenever a sample is ready. We register two handlers up front (sample-ready
//! and bus status) and then park the calling thread inside the subsystem's
//! event loop until the stream ends or `stop()` is requested.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace};

use crate::capture::detections::{attach_detections, Region};
use crate::capture::frame::{Frame, PixelBuffer, ReleaseFn};
use crate::capture::lifecycle::{IngestorState, StateCell};
use crate::capture::polling::PROFILE_ENTRY_KEY;
use crate::capture::synthetic::{SyntheticTopology, STUB_SCHEME};
use crate::error::{ConfigError, IngestError, Result};
use crate::pipeline::QueueClient;
use crate::utils::{generate_image_handle, timestamp_ms, IMAGE_HANDLE_LENGTH};
use crate::IngestorConfig;

/// Metadata key holding the random image handle
pub const IMAGE_HANDLE_KEY: &str = "img_handle";

/// What the sample-ready handler reports back to the capture subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Ok,
    Error,
}

/// Messages posted on the topology's status bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusStatus {
    EndOfStream,
    Error(String),
    Other,
}

/// Negotiated layout of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGeometry {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

/// A sample borrowed from the capture subsystem, mapped read-only on demand
pub struct MappedSample {
    pub buffer: Box<dyn PixelBuffer>,
    /// Unmaps the buffer and releases the sample
    pub release: ReleaseFn,
}

/// A raw sample handed over by the capture subsystem
pub trait CapturedSample: Send {
    fn geometry(&self) -> Option<SampleGeometry>;

    /// Regions of interest attached by upstream inference
    fn regions(&self) -> Result<Vec<Region>>;

    /// Map the sample's buffer without copying.
    fn map(self: Box<Self>) -> Result<MappedSample>;
}

pub type SampleCallback = Box<dyn FnMut(Box<dyn CapturedSample>) -> FlowStatus + Send>;
pub type StatusCallback = Box<dyn FnMut(BusStatus) + Send>;

/// The cooperative loop that hosts our handlers
pub trait EventLoop: Send + Sync {
    /// Block until [`EventLoop::quit`] is called.
    fn run(&self);
    fn quit(&self);
}

/// A parsed capture topology with a designated output element
pub trait Topology: Send {
    fn connect_sample_handler(&mut self, handler: SampleCallback) -> Result<()>;
    fn connect_status_handler(&mut self, handler: StatusCallback) -> Result<()>;
    fn event_loop(&self) -> Arc<dyn EventLoop>;
    /// Start data flow
    fn activate(&mut self) -> Result<()>;
    fn deactivate(&mut self) -> Result<()>;
}

/// Parse a descriptor into a topology.
pub fn launch_topology(descriptor: &str) -> Result<Box<dyn Topology>> {
    if descriptor.starts_with(STUB_SCHEME) {
        return Ok(Box::new(SyntheticTopology::launch(descriptor)?));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    {
        Ok(Box::new(crate::capture::gst_capture::GstTopology::launch(descriptor)?))
    }
    #[cfg(not(feature = "gstreamer-pipeline"))]
    {
        Err(IngestError::ResourceAcquisition(format!(
            "pipeline '{}' requires the gstreamer-pipeline feature",
            descriptor
        )))
    }
}

/// Per-sample work: wrap, translate, tag and enqueue.
#[derive(Clone)]
pub struct SampleHandler {
    queue: QueueClient,
    profiling: bool,
    frames: Arc<AtomicU64>,
}

impl SampleHandler {
    pub fn new(queue: QueueClient, profiling: bool) -> Self {
        Self {
            queue,
            profiling,
            frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Frames successfully enqueued so far
    pub fn frames_pushed(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    #[instrument(skip_all)]
    pub fn handle(&self, sample: Box<dyn CapturedSample>) -> FlowStatus {
        let Some(geometry) = sample.geometry() else {
            error!("Sample carries no negotiated width/height, dropping it");
            metrics::counter!("ingest_samples_dropped_total").increment(1);
            return FlowStatus::Ok;
        };
        let regions = match sample.regions() {
            Ok(regions) => regions,
            Err(e) => {
                error!("Failed to read detections: {}", e);
                return FlowStatus::Error;
            }
        };

        let mapped = match sample.map() {
            Ok(mapped) => mapped,
            Err(e) => {
                error!("{}", e);
                metrics::counter!("ingest_samples_dropped_total").increment(1);
                return FlowStatus::Ok;
            }
        };

        let mut frame = Frame::from_parts(
            mapped.buffer,
            Some(mapped.release),
            geometry.width,
            geometry.height,
            geometry.channels,
        );
        trace!("Got frame of size: {}", frame.data().len());

        if self.profiling {
            if let Err(e) = frame.meta_mut().put(PROFILE_ENTRY_KEY, timestamp_ms()) {
                error!("Failed to put profiling metadata: {}", e);
                return FlowStatus::Error;
            }
        }

        if let Err(e) = attach_detections(frame.meta_mut(), &regions) {
            error!("Failed to build detection metadata: {}", e);
            return FlowStatus::Error;
        }

        let handle = generate_image_handle(IMAGE_HANDLE_LENGTH);
        if let Err(e) = frame.meta_mut().put(IMAGE_HANDLE_KEY, handle) {
            error!("Failed to put image handle metadata: {}", e);
            return FlowStatus::Error;
        }

        match self.queue.push(frame) {
            Ok(_) => {
                self.frames.fetch_add(1, Ordering::Relaxed);
                FlowStatus::Ok
            }
            Err(e) => {
                error!("Sample lost: {}", e);
                FlowStatus::Error
            }
        }
    }
}

/// Ingestor driven by the capture subsystem's sample-ready events.
///
/// Single-shot: once stopped (or once the stream ends) it cannot be restarted.
pub struct EventDrivenIngestor {
    config: IngestorConfig,
    handler: SampleHandler,
    state: StateCell,
    topology: Mutex<Option<Box<dyn Topology>>>,
    event_loop: Mutex<Option<Arc<dyn EventLoop>>>,
}

impl EventDrivenIngestor {
    pub fn new(config: IngestorConfig, queue: QueueClient) -> Result<Self> {
        if config.pipeline.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "pipeline",
                reason: "descriptor is empty".into(),
            }
            .into());
        }

        info!("Pipeline: {}", config.pipeline);
        info!("Poll interval: {:?}", config.poll_interval);

        Ok(Self {
            handler: SampleHandler::new(queue, config.profiling),
            config,
            state: StateCell::new(IngestorState::Idle),
            topology: Mutex::new(None),
            event_loop: Mutex::new(None),
        })
    }

    pub fn state(&self) -> IngestorState {
        self.state.get()
    }

    pub fn frames_pushed(&self) -> u64 {
        self.handler.frames_pushed()
    }

    /// Parse the topology and wire up the sample and status handlers.
    pub fn start(&self) -> Result<()> {
        if self.state.get() != IngestorState::Idle || self.topology.lock().is_some() {
            return Err(IngestError::InvalidState(format!(
                "cannot start event-driven ingestor in state {}",
                self.state.get()
            )));
        }

        self.install(launch_topology(&self.config.pipeline)?)
    }

    fn install(&self, mut topology: Box<dyn Topology>) -> Result<()> {
        let handler = self.handler.clone();
        topology.connect_sample_handler(Box::new(move |sample| handler.handle(sample)))?;

        let event_loop = topology.event_loop();
        let status_loop = Arc::clone(&event_loop);
        topology.connect_status_handler(Box::new(move |status| match status {
            BusStatus::EndOfStream => {
                info!("End of stream");
                status_loop.quit();
            }
            BusStatus::Error(msg) => {
                error!("Capture bus error: {}", msg);
                status_loop.quit();
            }
            BusStatus::Other => {}
        }))?;

        *self.event_loop.lock() = Some(event_loop);
        *self.topology.lock() = Some(topology);
        debug!("Event-driven ingestor started");
        Ok(())
    }

    /// Activate the topology and block in the event loop.
    pub fn run(&self) -> Result<()> {
        let event_loop = self
            .event_loop
            .lock()
            .clone()
            .ok_or_else(|| IngestError::InvalidState("run() called before start()".into()))?;

        self.state
            .transition(IngestorState::Idle, IngestorState::Running)
            .map_err(|s| IngestError::InvalidState(format!("cannot run ingestor in state {}", s)))?;

        let started = Instant::now();
        {
            let mut topology = self.topology.lock();
            let topology = topology
                .as_mut()
                .ok_or_else(|| IngestError::InvalidState("topology missing".into()))?;
            // stop() deactivates under this same lock; never reactivate after it
            if self.state.get() != IngestorState::Running {
                debug!("Stopped before activation, topology left inactive");
                return Ok(());
            }
            topology.activate()?;
        }

        info!("Event-driven ingestor thread started");
        // A stop() racing with activation must not leave us parked forever
        if self.state.get() == IngestorState::Running {
            event_loop.run();
        }
        self.state.set(IngestorState::Stopped);
        info!("Event-driven ingestor thread stopped");

        if self.config.profiling {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                info!("Capture FPS: {:.1}", self.frames_pushed() as f64 / elapsed);
            }
        }
        Ok(())
    }

    /// Ask the event loop to exit and deactivate the topology.
    ///
    /// Does not wait for an in-flight sample handler to finish.
    pub fn stop(&self) -> Result<()> {
        self.state.set(IngestorState::Stopped);
        if let Some(event_loop) = self.event_loop.lock().as_ref() {
            event_loop.quit();
        }
        if let Some(topology) = self.topology.lock().as_mut() {
            topology.deactivate()?;
        }
        Ok(())
    }
}

impl Drop for EventDrivenIngestor {
    fn drop(&mut self) {
        if let Some(mut topology) = self.topology.get_mut().take() {
            let _ = topology.deactivate();
        }
    }
}
