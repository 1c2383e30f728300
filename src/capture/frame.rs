use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::capture::metadata::MetadataDocument;

/// Read-only view of pixel memory owned by someone else (a mapped capture
/// buffer, a decoder surface, a plain heap allocation).
pub trait PixelBuffer: Send {
    fn as_slice(&self) -> &[u8];
}

impl PixelBuffer for Vec<u8> {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

impl PixelBuffer for Box<[u8]> {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

impl PixelBuffer for Bytes {
    fn as_slice(&self) -> &[u8] {
        self
    }
}

/// Invoked exactly once, after the pixel buffer has been dropped
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Encoding requested for downstream publication. The ingestor only carries it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    None,
    Jpeg { level: u8 },
    Png { level: u8 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} encoding level {level} outside 0..={max}")]
pub struct EncodingError {
    pub kind: &'static str,
    pub level: i64,
    pub max: i64,
}

impl Encoding {
    pub const JPEG_MAX_LEVEL: i64 = 100;
    pub const PNG_MAX_LEVEL: i64 = 9;

    /// Build from the config's `type`/`level` pair.
    pub fn from_parts(kind: &str, level: i64) -> Result<Self, String> {
        let check = |kind: &'static str, max: i64| {
            if (0..=max).contains(&level) {
                Ok(level as u8)
            } else {
                Err(EncodingError { kind, level, max }.to_string())
            }
        };
        match kind {
            "jpeg" => Ok(Encoding::Jpeg {
                level: check("jpeg", Self::JPEG_MAX_LEVEL)?,
            }),
            "png" => Ok(Encoding::Png {
                level: check("png", Self::PNG_MAX_LEVEL)?,
            }),
            "none" => Ok(Encoding::None),
            other => Err(format!("unknown encoding type '{}'", other)),
        }
    }

    pub fn validate(self) -> Result<Self, EncodingError> {
        let (kind, level, max) = match self {
            Encoding::None => return Ok(self),
            Encoding::Jpeg { level } => ("jpeg", level, Self::JPEG_MAX_LEVEL),
            Encoding::Png { level } => ("png", level, Self::PNG_MAX_LEVEL),
        };
        if i64::from(level) > max {
            return Err(EncodingError {
                kind,
                level: level.into(),
                max,
            });
        }
        Ok(self)
    }
}

/// A captured frame.
///
/// Owns its pixel memory through a type-erased [`PixelBuffer`] plus an optional
/// release callback, so buffers borrowed from a capture backend are never copied.
/// Whoever holds the frame last (normally the consumer) triggers the release.
pub struct Frame {
    buffer: Option<Box<dyn PixelBuffer>>,
    release: Option<ReleaseFn>,
    width: u32,
    height: u32,
    channels: u32,
    encoding: Encoding,
    meta: MetadataDocument,
    duplicate: Option<Box<Frame>>,

    /// Capture timestamp for latency tracking
    timestamp: Instant,
}

impl Frame {
    /// Wrap a foreign buffer whose owner must be notified when the frame dies.
    pub fn from_foreign<B, F>(buffer: B, release: F, width: u32, height: u32, channels: u32) -> Self
    where
        B: PixelBuffer + 'static,
        F: FnOnce() + Send + 'static,
    {
        let mut frame = Self::from_owned(buffer, width, height, channels);
        frame.release = Some(Box::new(release));
        frame
    }

    /// Wrap a buffer the frame owns outright; dropping the frame frees it.
    pub fn from_owned<B>(buffer: B, width: u32, height: u32, channels: u32) -> Self
    where
        B: PixelBuffer + 'static,
    {
        Self {
            buffer: Some(Box::new(buffer)),
            release: None,
            width,
            height,
            channels,
            encoding: Encoding::None,
            meta: MetadataDocument::new(),
            duplicate: None,
            timestamp: Instant::now(),
        }
    }

    /// Already-boxed variant of [`Frame::from_foreign`], used by capture backends.
    pub fn from_parts(
        buffer: Box<dyn PixelBuffer>,
        release: Option<ReleaseFn>,
        width: u32,
        height: u32,
        channels: u32,
    ) -> Self {
        Self {
            buffer: Some(buffer),
            release,
            width,
            height,
            channels,
            encoding: Encoding::None,
            meta: MetadataDocument::new(),
            duplicate: None,
            timestamp: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_ref().map(|b| b.as_slice()).unwrap_or(&[])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn meta(&self) -> &MetadataDocument {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetadataDocument {
        &mut self.meta
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) -> Result<(), EncodingError> {
        self.encoding = encoding.validate()?;
        Ok(())
    }

    /// Content-identical copy that owns its own memory and carries no encoding.
    pub fn clone_unencoded(&self) -> Frame {
        Frame::from_owned(
            Bytes::copy_from_slice(self.data()),
            self.width,
            self.height,
            self.channels,
        )
    }

    /// Link a secondary representation of this frame.
    pub fn set_duplicate(&mut self, duplicate: Frame) {
        self.duplicate = Some(Box::new(duplicate));
    }

    pub fn duplicate(&self) -> Option<&Frame> {
        self.duplicate.as_deref()
    }

    pub fn take_duplicate(&mut self) -> Option<Frame> {
        self.duplicate.take().map(|f| *f)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // Unmap before handing the memory back to its owner
        drop(self.buffer.take());
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data().len())
            .field("encoding", &self.encoding)
            .field("meta", &self.meta)
            .field("duplicate", &self.duplicate.is_some())
            .finish()
    }
}
