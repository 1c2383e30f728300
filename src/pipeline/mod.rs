pub mod queue;

pub use queue::{FrameQueue, PushOutcome, QueueClient, QueueStats, TryPushError, BLOCKED_TIMESTAMP_KEY};
