//! Detection metadata translation.
//!
//! Converts regions of interest and their per-region inference tensors into
//! the generic metadata document layout consumed downstream:
//!
//! ```text
//! gva_meta: [ { x, y, width, height, tensor: [ { attribute, label, confidence } ] } ]
//! ```
//!
//! Every node is built completely before it is attached to its parent, and any
//! failure discards the whole array for that sample.

use tracing::debug;

use crate::capture::metadata::{MetadataDocument, Object, Value};
use crate::error::MetadataError;

/// Metadata key holding the detection array
pub const DETECTIONS_KEY: &str = "gva_meta";

/// A named inference output attached to a region
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub label: String,
    pub confidence: f64,
}

impl Tensor {
    pub fn new(name: impl Into<String>, label: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            confidence,
        }
    }
}

/// Axis-aligned region of interest
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub tensors: Vec<Tensor>,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            tensors: Vec::new(),
        }
    }

    pub fn with_tensor(mut self, tensor: Tensor) -> Self {
        self.tensors.push(tensor);
        self
    }
}

fn tensor_object(tensor: &Tensor) -> Result<Object, MetadataError> {
    debug!(
        "Attribute: {}, Label: {}, Confidence: {}",
        tensor.name, tensor.label, tensor.confidence
    );

    if !tensor.confidence.is_finite() {
        return Err(MetadataError::InvalidConfidence {
            attribute: tensor.name.clone(),
            confidence: tensor.confidence,
        });
    }

    let mut obj = Object::new();
    obj.put("attribute", tensor.name.as_str())?;
    obj.put("label", tensor.label.as_str())?;
    // Truncated toward zero
    obj.put("confidence", tensor.confidence as i64)?;
    Ok(obj)
}

fn region_object(region: &Region) -> Result<Object, MetadataError> {
    debug!(
        "Object Bounding Box: [{}, {}] [{}, {}]",
        region.x, region.y, region.width, region.height
    );

    let tensors = region
        .tensors
        .iter()
        .map(|t| tensor_object(t).map(Value::Object))
        .collect::<Result<Vec<_>, _>>()?;

    let mut obj = Object::new();
    obj.put("x", i64::from(region.x))?;
    obj.put("y", i64::from(region.y))?;
    obj.put("width", i64::from(region.width))?;
    obj.put("height", i64::from(region.height))?;
    obj.put("tensor", tensors)?;
    Ok(obj)
}

/// Build the detection array for a set of regions.
pub fn translate(regions: &[Region]) -> Result<Value, MetadataError> {
    regions
        .iter()
        .map(|r| region_object(r).map(Value::Object))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

/// Translate `regions` and attach the result under [`DETECTIONS_KEY`].
///
/// Nothing is attached when there are no regions or when translation fails.
pub fn attach_detections(doc: &mut MetadataDocument, regions: &[Region]) -> Result<(), MetadataError> {
    if regions.is_empty() {
        return Ok(());
    }
    let detections = translate(regions)?;
    doc.put(DETECTIONS_KEY, detections)
}
