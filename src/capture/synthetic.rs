//! Deterministic in-process capture sources for `stub://` descriptors.
//!
//! Lets both ingestors run end to end without a media framework. Parameters
//! are `key=value` pairs joined with `&`:
//!
//! - `frames` samples before end-of-stream (default 10)
//! - `width`, `height`, `channels` frame geometry (default 64x48x3)
//! - `regions`, `tensors` detections attached to every sample (default 0)
//! - `fail_every` every Nth sample fails to map / read (default 0, never)
//! - `error_after` post a bus error instead of end-of-stream after N samples

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace};

use crate::capture::detections::{Region, Tensor};
use crate::capture::event::{
    BusStatus, CapturedSample, EventLoop, FlowStatus, MappedSample, SampleCallback, SampleGeometry,
    StatusCallback, Topology,
};
use crate::capture::polling::{CaptureDevice, RawImage, ReadOutcome};
use crate::error::{IngestError, Result};
use crate::utils::parse_stub_params;

pub const STUB_SCHEME: &str = "stub://";

/// Largest synthetic frame we are willing to allocate
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Parsed `stub://` descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubSpec {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub regions: u32,
    pub tensors: u32,
    pub fail_every: u64,
    pub error_after: Option<u64>,
}

impl Default for StubSpec {
    fn default() -> Self {
        Self {
            frames: 10,
            width: 64,
            height: 48,
            channels: 3,
            regions: 0,
            tensors: 0,
            fail_every: 0,
            error_after: None,
        }
    }
}

fn take_u32(params: &mut HashMap<String, u64>, key: &str, default: u32) -> Result<u32> {
    match params.remove(key) {
        Some(v) => u32::try_from(v)
            .map_err(|_| IngestError::ResourceAcquisition(format!("stub parameter '{}' too large", key))),
        None => Ok(default),
    }
}

impl StubSpec {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut params = parse_stub_params(descriptor)?;
        let mut spec = StubSpec::default();

        spec.width = take_u32(&mut params, "width", spec.width)?;
        spec.height = take_u32(&mut params, "height", spec.height)?;
        spec.channels = take_u32(&mut params, "channels", spec.channels)?;
        spec.regions = take_u32(&mut params, "regions", spec.regions)?;
        spec.tensors = take_u32(&mut params, "tensors", spec.tensors)?;
        spec.frames = params.remove("frames").unwrap_or(spec.frames);
        spec.fail_every = params.remove("fail_every").unwrap_or(0);
        spec.error_after = params.remove("error_after");

        if let Some(unknown) = params.keys().next() {
            return Err(IngestError::ResourceAcquisition(format!(
                "unknown stub parameter '{}'",
                unknown
            )));
        }

        match spec.frame_len() {
            Some(len) if len <= MAX_FRAME_BYTES => Ok(spec),
            _ => Err(IngestError::ResourceAcquisition(format!(
                "stub frame {}x{}x{} exceeds {} bytes",
                spec.width, spec.height, spec.channels, MAX_FRAME_BYTES
            ))),
        }
    }

    fn frame_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)
    }

    fn fails(&self, index: u64) -> bool {
        self.fail_every > 0 && (index + 1) % self.fail_every == 0
    }

    fn pixels(&self, index: u64) -> Vec<u8> {
        let len = self.frame_len().unwrap_or(0);
        (0..len).map(|i| ((i as u64 + index) % 256) as u8).collect()
    }

    fn regions(&self) -> Vec<Region> {
        (0..self.regions)
            .map(|r| {
                (0..self.tensors).fold(Region::new(r * 10, r * 5, 16, 16), |region, t| {
                    region.with_tensor(Tensor::new(
                        "detection",
                        format!("label_{}", t),
                        f64::from(t) * 10.0 + 0.75,
                    ))
                })
            })
            .collect()
    }
}

struct StubSample {
    index: u64,
    geometry: SampleGeometry,
    pixels: Vec<u8>,
    regions: Vec<Region>,
    fail_map: bool,
}

impl CapturedSample for StubSample {
    fn geometry(&self) -> Option<SampleGeometry> {
        Some(self.geometry)
    }

    fn regions(&self) -> Result<Vec<Region>> {
        Ok(self.regions.clone())
    }

    fn map(self: Box<Self>) -> Result<MappedSample> {
        if self.fail_map {
            return Err(IngestError::BufferMapping(format!(
                "synthetic sample {} refused to map",
                self.index
            )));
        }
        let index = self.index;
        Ok(MappedSample {
            buffer: Box::new(self.pixels),
            release: Box::new(move || trace!("Released synthetic sample {}", index)),
        })
    }
}

/// Event loop parked on a channel until quit
pub struct SyntheticLoop {
    tx: flume::Sender<()>,
    rx: flume::Receiver<()>,
}

impl SyntheticLoop {
    fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }
}

impl EventLoop for SyntheticLoop {
    fn run(&self) {
        let _ = self.rx.recv();
    }

    fn quit(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Topology whose "streaming thread" replays the stub parameters
pub struct SyntheticTopology {
    spec: StubSpec,
    sample_handler: Option<SampleCallback>,
    status_handler: Option<StatusCallback>,
    event_loop: Arc<SyntheticLoop>,
    halt: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl SyntheticTopology {
    pub fn launch(descriptor: &str) -> Result<Self> {
        let spec = StubSpec::parse(descriptor)?;
        info!("Synthetic topology: {:?}", spec);
        Ok(Self {
            spec,
            sample_handler: None,
            status_handler: None,
            event_loop: Arc::new(SyntheticLoop::new()),
            halt: Arc::new(AtomicBool::new(false)),
            producer: None,
        })
    }
}

impl Topology for SyntheticTopology {
    fn connect_sample_handler(&mut self, handler: SampleCallback) -> Result<()> {
        self.sample_handler = Some(handler);
        Ok(())
    }

    fn connect_status_handler(&mut self, handler: StatusCallback) -> Result<()> {
        self.status_handler = Some(handler);
        Ok(())
    }

    fn event_loop(&self) -> Arc<dyn EventLoop> {
        self.event_loop.clone()
    }

    fn activate(&mut self) -> Result<()> {
        if self.producer.is_some() {
            return Err(IngestError::InvalidState("synthetic topology already active".into()));
        }
        let mut on_sample = self
            .sample_handler
            .take()
            .ok_or_else(|| IngestError::InvalidState("no sample handler connected".into()))?;
        let mut on_status = self.status_handler.take();

        let spec = self.spec.clone();
        let halt = Arc::clone(&self.halt);
        let geometry = SampleGeometry {
            width: spec.width,
            height: spec.height,
            channels: spec.channels,
        };

        let producer = thread::Builder::new()
            .name("synthetic-stream".into())
            .spawn(move || {
                let limit = spec.error_after.unwrap_or(spec.frames).min(spec.frames);
                for index in 0..limit {
                    if halt.load(Ordering::Acquire) {
                        return;
                    }
                    let sample = StubSample {
                        index,
                        geometry,
                        pixels: spec.pixels(index),
                        regions: spec.regions(),
                        fail_map: spec.fails(index),
                    };
                    if on_sample(Box::new(sample)) == FlowStatus::Error {
                        debug!("Sample {} reported an error flow", index);
                    }
                }
                if halt.load(Ordering::Acquire) {
                    return;
                }
                if let Some(on_status) = on_status.as_mut() {
                    match spec.error_after {
                        Some(n) if n < spec.frames => {
                            on_status(BusStatus::Error(format!("synthetic failure after {} samples", n)))
                        }
                        _ => on_status(BusStatus::EndOfStream),
                    }
                }
            })
            .map_err(|e| IngestError::Backend(format!("failed to spawn synthetic stream: {}", e)))?;

        self.producer = Some(producer);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.halt.store(true, Ordering::Release);
        Ok(())
    }
}

/// Polled counterpart: hands out frames until exhausted
pub struct SyntheticCapture {
    spec: StubSpec,
    position: u64,
}

impl SyntheticCapture {
    pub fn open(descriptor: &str) -> Result<Self> {
        Ok(Self {
            spec: StubSpec::parse(descriptor)?,
            position: 0,
        })
    }
}

impl CaptureDevice for SyntheticCapture {
    fn read(&mut self) -> ReadOutcome {
        if self.position >= self.spec.frames {
            return ReadOutcome::EndOfStream;
        }
        let index = self.position;
        self.position += 1;

        if self.spec.fails(index) {
            return ReadOutcome::Failed {
                reason: format!("synthetic read failure at frame {}", index),
                image: RawImage::empty(),
            };
        }
        ReadOutcome::Frame(RawImage::owned(
            self.spec.pixels(index),
            self.spec.width,
            self.spec.height,
            self.spec.channels,
        ))
    }

    fn release(&mut self) {
        trace!("Synthetic capture released at frame {}", self.position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_and_overrides() {
        let spec = StubSpec::parse("stub://").unwrap();
        assert_eq!(spec, StubSpec::default());

        let spec = StubSpec::parse("stub://frames=3&width=8&height=4&channels=1&regions=2&tensors=3").unwrap();
        assert_eq!((spec.frames, spec.width, spec.height, spec.channels), (3, 8, 4, 1));
        assert_eq!(spec.regions().len(), 2);
        assert!(spec.regions().iter().all(|r| r.tensors.len() == 3));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        assert!(StubSpec::parse("stub://fps=30").is_err());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        for descriptor in [
            "stub://frames=1&width=70000&height=70000&channels=3",
            "stub://width=4294967295&height=4294967295&channels=4294967295",
        ] {
            assert!(matches!(
                StubSpec::parse(descriptor),
                Err(IngestError::ResourceAcquisition(_))
            ));
            assert!(SyntheticCapture::open(descriptor).is_err());
        }

        let spec = StubSpec::parse("stub://width=640&height=480&channels=4").unwrap();
        assert_eq!(spec.pixels(0).len(), 640 * 480 * 4);
    }

    #[test]
    fn capture_reports_end_of_stream() {
        let mut capture = SyntheticCapture::open("stub://frames=2&width=2&height=2").unwrap();
        assert!(matches!(capture.read(), ReadOutcome::Frame(_)));
        assert!(matches!(capture.read(), ReadOutcome::Frame(_)));
        assert!(matches!(capture.read(), ReadOutcome::EndOfStream));
        assert!(matches!(capture.read(), ReadOutcome::EndOfStream));
    }

    #[test]
    fn capture_injects_failures() {
        let mut capture = SyntheticCapture::open("stub://frames=4&fail_every=2").unwrap();
        let outcomes: Vec<_> = (0..4)
            .map(|_| matches!(capture.read(), ReadOutcome::Failed { .. }))
            .collect();
        assert_eq!(outcomes, [false, true, false, true]);
    }

    #[test]
    fn loop_quit_before_run_is_not_lost() {
        let event_loop = SyntheticLoop::new();
        event_loop.quit();
        event_loop.run();
    }
}
