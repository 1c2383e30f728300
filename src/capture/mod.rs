pub mod detections;
pub mod event;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod lifecycle;
pub mod metadata;
pub mod polling;
pub mod synthetic;

pub use detections::{Region, Tensor, DETECTIONS_KEY};
pub use event::{EventDrivenIngestor, IMAGE_HANDLE_KEY};
pub use frame::{Encoding, Frame, PixelBuffer};
pub use lifecycle::IngestorState;
pub use metadata::{MetadataDocument, Value};
pub use polling::{PollingIngestor, RunMode, FRAME_NUMBER_KEY, PROFILE_ENTRY_KEY, PROFILE_QUEUE_KEY};
