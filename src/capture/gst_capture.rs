//! GStreamer capture backend.
//!
//! Descriptors are `gst-launch` style pipeline strings whose output element is
//! an `appsink` named `sink`. Buffers are mapped read-only and handed out
//! without copying; the sample is kept alive until the frame is dropped.

use std::sync::Arc;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::detections::{Region, Tensor};
use crate::capture::event::{
    BusStatus, CapturedSample, EventLoop, FlowStatus, MappedSample, SampleCallback, SampleGeometry,
    StatusCallback, Topology,
};
use crate::capture::frame::PixelBuffer;
use crate::capture::polling::{CaptureDevice, RawImage, ReadOutcome};
use crate::error::{IngestError, MetadataError, Result};

/// Name the output element must carry in the descriptor
pub const SINK_NAME: &str = "sink";

/// Channel count assumed when the negotiated format does not say
const DEFAULT_CHANNELS: u32 = 4;

fn launch(descriptor: &str) -> Result<(gst::Pipeline, gst_app::AppSink)> {
    gst::init().map_err(|e| IngestError::ResourceAcquisition(format!("failed to initialize GStreamer: {}", e)))?;

    let pipeline = gst::parse::launch(descriptor)
        .map_err(|e| IngestError::ResourceAcquisition(format!("failed to parse pipeline: {}", e)))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| IngestError::ResourceAcquisition("descriptor is not a pipeline".into()))?;

    let appsink = pipeline
        .by_name(SINK_NAME)
        .ok_or_else(|| {
            IngestError::ResourceAcquisition(format!("pipeline has no element named '{}'", SINK_NAME))
        })?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| IngestError::ResourceAcquisition(format!("'{}' is not an appsink", SINK_NAME)))?;

    Ok((pipeline, appsink))
}

fn set_state(pipeline: &gst::Pipeline, state: gst::State) -> Result<()> {
    pipeline
        .set_state(state)
        .map(|_| ())
        .map_err(|e| IngestError::Backend(format!("failed to set pipeline to {:?}: {:?}", state, e)))
}

/// Mapped buffer that keeps its memory alive while the frame exists
struct GstMapped(gst::MappedBuffer<gst::buffer::Readable>);

impl PixelBuffer for GstMapped {
    fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Label defaults to empty; a missing or non-numeric confidence is an error.
fn tensor_from_param(param: &gst::StructureRef) -> Result<Tensor> {
    let attribute = param.name().as_str();
    let label = param.get::<String>("label").unwrap_or_default();
    let confidence = param
        .get::<f64>("confidence")
        .or_else(|_| param.get::<f32>("confidence").map(f64::from))
        .map_err(|_| MetadataError::MissingConfidence {
            attribute: attribute.to_string(),
        })?;
    Ok(Tensor::new(attribute, label, confidence))
}

struct GstSample(gst::Sample);

impl GstSample {
    fn into_image(self: Box<Self>, geometry: SampleGeometry) -> Result<RawImage> {
        let mapped = CapturedSample::map(self)?;
        Ok(RawImage {
            buffer: mapped.buffer,
            release: Some(mapped.release),
            width: geometry.width,
            height: geometry.height,
            channels: geometry.channels,
        })
    }
}

impl CapturedSample for GstSample {
    fn geometry(&self) -> Option<SampleGeometry> {
        let info = gst_video::VideoInfo::from_caps(self.0.caps()?).ok()?;
        let channels = info
            .format_info()
            .pixel_stride()
            .first()
            .and_then(|stride| u32::try_from(*stride).ok())
            .filter(|stride| *stride > 0)
            .unwrap_or(DEFAULT_CHANNELS);
        Some(SampleGeometry {
            width: info.width(),
            height: info.height(),
            channels,
        })
    }

    fn regions(&self) -> Result<Vec<Region>> {
        let Some(buffer) = self.0.buffer() else {
            return Ok(Vec::new());
        };
        buffer
            .iter_meta::<gst_video::VideoRegionOfInterestMeta>()
            .map(|roi| {
                let (x, y, width, height) = roi.rect();
                roi.params()
                    .map(tensor_from_param)
                    .try_fold(
                        Region::new(x, y, width, height),
                        |region, tensor: Result<Tensor>| -> Result<Region> { Ok(region.with_tensor(tensor?)) },
                    )
            })
            .collect()
    }

    fn map(self: Box<Self>) -> Result<MappedSample> {
        let buffer = self
            .0
            .buffer_owned()
            .ok_or_else(|| IngestError::BufferMapping("sample has no buffer".into()))?;
        let mapped = buffer
            .into_mapped_buffer_readable()
            .map_err(|_| IngestError::BufferMapping("failed to map buffer readable".into()))?;

        let sample = self.0;
        Ok(MappedSample {
            buffer: Box::new(GstMapped(mapped)),
            release: Box::new(move || drop(sample)),
        })
    }
}

struct GstLoop(glib::MainLoop);

impl EventLoop for GstLoop {
    fn run(&self) {
        self.0.run();
    }

    fn quit(&self) {
        self.0.quit();
    }
}

/// Pipeline driven by appsink callbacks and a bus watch
pub struct GstTopology {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    event_loop: Arc<GstLoop>,
    bus_watch: Option<gst::bus::BusWatchGuard>,
}

impl GstTopology {
    pub fn launch(descriptor: &str) -> Result<Self> {
        let (pipeline, appsink) = launch(descriptor)?;
        info!("GStreamer pipeline parsed");
        Ok(Self {
            pipeline,
            appsink,
            event_loop: Arc::new(GstLoop(glib::MainLoop::new(None, false))),
            bus_watch: None,
        })
    }
}

impl Topology for GstTopology {
    fn connect_sample_handler(&mut self, mut handler: SampleCallback) -> Result<()> {
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    match handler(Box::new(GstSample(sample))) {
                        FlowStatus::Ok => Ok(gst::FlowSuccess::Ok),
                        FlowStatus::Error => Err(gst::FlowError::Error),
                    }
                })
                .build(),
        );
        Ok(())
    }

    fn connect_status_handler(&mut self, mut handler: StatusCallback) -> Result<()> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| IngestError::ResourceAcquisition("pipeline has no bus".into()))?;

        let guard = bus
            .add_watch(move |_, msg| {
                let status = match msg.view() {
                    gst::MessageView::Eos(..) => BusStatus::EndOfStream,
                    gst::MessageView::Error(err) => BusStatus::Error(format!(
                        "{} ({})",
                        err.error(),
                        err.debug().map(|d| d.to_string()).unwrap_or_default()
                    )),
                    _ => BusStatus::Other,
                };
                handler(status);
                glib::ControlFlow::Continue
            })
            .map_err(|e| IngestError::ResourceAcquisition(format!("failed to add bus watch: {}", e)))?;

        self.bus_watch = Some(guard);
        Ok(())
    }

    fn event_loop(&self) -> Arc<dyn EventLoop> {
        self.event_loop.clone()
    }

    fn activate(&mut self) -> Result<()> {
        set_state(&self.pipeline, gst::State::Playing)
    }

    fn deactivate(&mut self) -> Result<()> {
        set_state(&self.pipeline, gst::State::Null)
    }
}

impl Drop for GstTopology {
    fn drop(&mut self) {
        self.bus_watch.take();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to tear down pipeline: {:?}", e);
        }
    }
}

/// Blocking capture handle for the polling ingestor
pub struct GstCaptureDevice {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    released: bool,
}

impl GstCaptureDevice {
    pub fn open(descriptor: &str) -> Result<Self> {
        let (pipeline, appsink) = launch(descriptor)?;
        set_state(&pipeline, gst::State::Playing)?;
        Ok(Self {
            pipeline,
            appsink,
            released: false,
        })
    }
}

impl CaptureDevice for GstCaptureDevice {
    fn read(&mut self) -> ReadOutcome {
        let sample = match self.appsink.pull_sample() {
            Ok(sample) => Box::new(GstSample(sample)),
            Err(_) if self.appsink.is_eos() => return ReadOutcome::EndOfStream,
            Err(e) => {
                return ReadOutcome::Failed {
                    reason: e.to_string(),
                    image: RawImage::empty(),
                }
            }
        };

        let Some(geometry) = sample.geometry() else {
            return ReadOutcome::Failed {
                reason: "sample carries no negotiated width/height".into(),
                image: RawImage::empty(),
            };
        };

        match sample.into_image(geometry) {
            Ok(image) => ReadOutcome::Frame(image),
            Err(e) => ReadOutcome::Failed {
                reason: e.to_string(),
                image: RawImage::empty(),
            },
        }
    }

    fn release(&mut self) {
        if !self.released {
            let _ = self.pipeline.set_state(gst::State::Null);
            self.released = true;
            debug!("GStreamer capture released");
        }
    }
}

impl Drop for GstCaptureDevice {
    fn drop(&mut self) {
        self.release();
    }
}
