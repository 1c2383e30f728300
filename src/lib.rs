pub mod capture;
pub mod error;
pub mod ingestor;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::capture::frame::Encoding;
use crate::error::ConfigError;

pub use capture::{EventDrivenIngestor, Frame, MetadataDocument, PollingIngestor};
pub use ingestor::Ingestor;
pub use pipeline::{FrameQueue, QueueClient};

const PIPELINE: &str = "pipeline";
const TYPE: &str = "type";
const POLL_INTERVAL: &str = "poll_interval";
const LOOP_VIDEO: &str = "loop_video";
const DOUBLE_FRAMES: &str = "double_frames";
const PROFILING: &str = "profiling";
const QUEUE_SIZE: &str = "queue_size";
const ENCODING: &str = "encoding";

/// Environment variables with this prefix override file settings
pub const ENV_PREFIX: &str = "INGESTOR";

/// Which capture adapter drives ingestion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestorKind {
    /// Frames are pushed to us by the capture subsystem's sample-ready callback
    EventDriven,
    /// A dedicated thread reads frames synchronously
    #[default]
    Polling,
}

/// Ingestor configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestorConfig {
    /// Declarative capture-topology descriptor
    pub pipeline: String,
    #[serde(rename = "type")]
    pub kind: IngestorKind,
    /// Inter-frame delay (polling adapter)
    pub poll_interval: Option<Duration>,
    pub loop_video: bool,
    pub double_frames: bool,
    pub profiling: bool,
    pub queue_size: usize,
    pub encoding: Encoding,
}

impl IngestorConfig {
    pub const DEFAULT_QUEUE_SIZE: usize = 10;

    /// Minimal config for the given descriptor, every option at its default.
    pub fn new(pipeline: impl Into<String>, kind: IngestorKind) -> Self {
        Self {
            pipeline: pipeline.into(),
            kind,
            poll_interval: None,
            loop_video: false,
            double_frames: false,
            profiling: false,
            queue_size: Self::DEFAULT_QUEUE_SIZE,
            encoding: Encoding::None,
        }
    }

    /// Load from a config file overlaid with `INGESTOR_*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let value: Value = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        Self::from_value(&value)
    }

    /// Validate a raw JSON-like configuration tree.
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or(ConfigError::WrongType {
            key: "ingestor",
            expected: "an object",
        })?;

        let pipeline = match obj.get(PIPELINE) {
            None => return Err(ConfigError::MissingKey(PIPELINE)),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(ConfigError::WrongType {
                    key: PIPELINE,
                    expected: "a string",
                })
            }
        };

        let kind = match obj.get(TYPE) {
            None => IngestorKind::default(),
            Some(Value::String(s)) => match s.as_str() {
                "event_driven" => IngestorKind::EventDriven,
                "polling" => IngestorKind::Polling,
                other => {
                    return Err(ConfigError::Invalid {
                        key: TYPE,
                        reason: format!("unknown ingestor type '{}'", other),
                    })
                }
            },
            Some(_) => {
                return Err(ConfigError::WrongType {
                    key: TYPE,
                    expected: "a string",
                })
            }
        };

        let poll_interval = optional_number(obj, POLL_INTERVAL)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::Invalid {
                    key: POLL_INTERVAL,
                    reason: format!("{} seconds: {}", secs, e),
                })
            })
            .transpose()?;

        let queue_size = match obj.get(QUEUE_SIZE) {
            None => Self::DEFAULT_QUEUE_SIZE,
            Some(v) => match v.as_u64() {
                Some(0) => {
                    return Err(ConfigError::Invalid {
                        key: QUEUE_SIZE,
                        reason: "queue must hold at least one frame".into(),
                    })
                }
                Some(n) => n as usize,
                None => {
                    return Err(ConfigError::WrongType {
                        key: QUEUE_SIZE,
                        expected: "a positive integer",
                    })
                }
            },
        };

        let encoding = match obj.get(ENCODING) {
            None => Encoding::None,
            Some(Value::Object(enc)) => parse_encoding(enc)?,
            Some(_) => {
                return Err(ConfigError::WrongType {
                    key: ENCODING,
                    expected: "an object",
                })
            }
        };

        Ok(Self {
            pipeline,
            kind,
            poll_interval,
            loop_video: optional_bool(obj, LOOP_VIDEO)?.unwrap_or(false),
            double_frames: optional_bool(obj, DOUBLE_FRAMES)?.unwrap_or(false),
            profiling: optional_bool(obj, PROFILING)?.unwrap_or(false),
            queue_size,
            encoding,
        })
    }

    /// Delay between polled frames, if any.
    pub fn poll_delay(&self) -> Option<Duration> {
        self.poll_interval.filter(|delay| !delay.is_zero())
    }
}

fn optional_bool(obj: &Map<String, Value>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ConfigError::WrongType {
            key,
            expected: "a boolean",
        }),
    }
}

fn optional_number(obj: &Map<String, Value>, key: &'static str) -> Result<Option<f64>, ConfigError> {
    match obj.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(_) => Err(ConfigError::WrongType {
            key,
            expected: "a number",
        }),
    }
}

fn parse_encoding(enc: &Map<String, Value>) -> Result<Encoding, ConfigError> {
    let kind = match enc.get(TYPE) {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Err(ConfigError::WrongType {
                key: ENCODING,
                expected: "an object with a string 'type'",
            })
        }
        None => return Err(ConfigError::MissingKey("encoding.type")),
    };
    let level = match enc.get("level") {
        Some(v) => v.as_i64().ok_or(ConfigError::WrongType {
            key: ENCODING,
            expected: "an object with an integer 'level'",
        })?,
        None => return Err(ConfigError::MissingKey("encoding.level")),
    };

    Encoding::from_parts(kind, level).map_err(|reason| ConfigError::Invalid {
        key: ENCODING,
        reason,
    })
}
