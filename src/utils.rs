use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{IngestError, Result};

/// Length of the random `img_handle` attached to event-driven frames
pub const IMAGE_HANDLE_LENGTH: usize = 5;

/// Short random identifier for a captured image
pub fn generate_image_handle(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Wall-clock milliseconds since the Unix epoch, used for profiling markers
pub fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parse `key=value&key=value` parameters of a `stub://` descriptor
pub fn parse_stub_params(descriptor: &str) -> Result<HashMap<String, u64>> {
    let query = descriptor
        .strip_prefix("stub://")
        .ok_or_else(|| IngestError::ResourceAcquisition(format!("not a stub descriptor: {}", descriptor)))?;

    query
        .split('&')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                IngestError::ResourceAcquisition(format!("malformed stub parameter '{}'", part))
            })?;
            let value = value.trim().parse::<u64>().map_err(|_| {
                IngestError::ResourceAcquisition(format!("stub parameter '{}' is not an integer", key))
            })?;
            Ok((key.trim().to_string(), value))
        })
        .collect()
}
