//! Error taxonomy for the ingestion engine

use thiserror::Error;

/// Construction-time configuration problems. Always fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("config missing key '{0}'")]
    MissingKey(&'static str),

    #[error("config value for '{key}' must be {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("config value for '{key}' is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to load config: {0}")]
    Load(String),
}

/// Failures while building a metadata document
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetadataError {
    #[error("duplicate metadata key '{0}'")]
    DuplicateKey(String),

    #[error("tensor '{attribute}' has non-finite confidence {confidence}")]
    InvalidConfidence { attribute: String, confidence: f64 },

    #[error("tensor '{attribute}' has no numeric confidence")]
    MissingConfidence { attribute: String },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// All consumers are gone; the frame was discarded.
    #[error("frame queue closed, frame discarded")]
    Closed,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("failed to acquire capture resource: {0}")]
    ResourceAcquisition(String),

    #[error("failed to map capture buffer: {0}")]
    BufferMapping(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("invalid ingestor state: {0}")]
    InvalidState(String),

    /// The source is exhausted and looping is disabled; the adapter was stopped while parked.
    #[error("capture source exhausted and ingestion halted")]
    Halted,

    #[error("capture backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
