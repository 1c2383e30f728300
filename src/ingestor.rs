use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::capture::{EventDrivenIngestor, IngestorState, PollingIngestor, RunMode};
use crate::error::{IngestError, Result};
use crate::pipeline::QueueClient;
use crate::{IngestorConfig, IngestorKind};

/// Capture adapter chosen by the configured `type`
pub enum Ingestor {
    EventDriven {
        inner: Arc<EventDrivenIngestor>,
        runner: Option<JoinHandle<Result<()>>>,
    },
    Polling(PollingIngestor),
}

impl Ingestor {
    pub fn build(config: IngestorConfig, queue: QueueClient) -> Result<Self> {
        info!("Building {:?} ingestor", config.kind);
        Ok(match config.kind {
            IngestorKind::EventDriven => Ingestor::EventDriven {
                inner: Arc::new(EventDrivenIngestor::new(config, queue)?),
                runner: None,
            },
            IngestorKind::Polling => Ingestor::Polling(PollingIngestor::new(config, queue)?),
        })
    }

    pub fn kind(&self) -> IngestorKind {
        match self {
            Ingestor::EventDriven { .. } => IngestorKind::EventDriven,
            Ingestor::Polling(_) => IngestorKind::Polling,
        }
    }

    pub fn state(&self) -> IngestorState {
        match self {
            Ingestor::EventDriven { inner, .. } => inner.state(),
            Ingestor::Polling(polling) => polling.state(),
        }
    }

    /// Begin ingesting on a background thread. Returns immediately.
    pub fn start(&mut self) -> Result<()> {
        match self {
            Ingestor::EventDriven { inner, runner } => {
                if runner.is_some() {
                    return Err(IngestError::InvalidState("event-driven ingestor already started".into()));
                }
                inner.start()?;
                let ingestor = Arc::clone(inner);
                let handle = thread::Builder::new()
                    .name("event-ingestor".into())
                    .spawn(move || ingestor.run())
                    .map_err(|e| IngestError::Backend(format!("failed to spawn ingestor thread: {}", e)))?;
                *runner = Some(handle);
                Ok(())
            }
            Ingestor::Polling(polling) => polling.run(RunMode::Continuous),
        }
    }

    /// Stop ingestion and wait for the background thread to exit.
    pub fn stop(&mut self) -> Result<()> {
        match self {
            Ingestor::EventDriven { inner, runner } => {
                inner.stop()?;
                match runner.take().map(JoinHandle::join) {
                    Some(Ok(Ok(()))) | None => Ok(()),
                    // stop() won the race against run() reaching the event loop
                    Some(Ok(Err(IngestError::InvalidState(msg)))) => {
                        warn!("{}", msg);
                        Ok(())
                    }
                    Some(Ok(Err(e))) => Err(e),
                    Some(Err(_)) => Err(IngestError::Backend("ingestor thread panicked".into())),
                }
            }
            Ingestor::Polling(polling) => polling.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use std::time::Duration;

    fn queue(capacity: usize) -> (QueueClient, flume::Receiver<Frame>) {
        let (tx, rx) = flume::bounded(capacity);
        (QueueClient::from_sender(tx), rx)
    }

    #[test]
    fn build_selects_adapter_by_type() {
        let (client, _rx) = queue(1);
        let ingestor = Ingestor::build(IngestorConfig::new("stub://", IngestorKind::EventDriven), client).unwrap();
        assert_eq!(ingestor.kind(), IngestorKind::EventDriven);

        let (client, _rx) = queue(1);
        let ingestor = Ingestor::build(IngestorConfig::new("stub://", IngestorKind::Polling), client).unwrap();
        assert_eq!(ingestor.kind(), IngestorKind::Polling);
    }

    #[test]
    fn event_driven_delivers_then_stops() {
        let (client, rx) = queue(8);
        let config = IngestorConfig::new("stub://frames=3&width=4&height=4", IngestorKind::EventDriven);
        let mut ingestor = Ingestor::build(config, client).unwrap();

        ingestor.start().unwrap();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        ingestor.stop().unwrap();
        assert_eq!(ingestor.state(), IngestorState::Stopped);
    }

    #[test]
    fn polling_can_be_restarted() {
        let (client, rx) = queue(8);
        let config = IngestorConfig::new("stub://frames=2", IngestorKind::Polling);
        let mut ingestor = Ingestor::build(config, client).unwrap();

        for _ in 0..2 {
            ingestor.start().unwrap();
            for _ in 0..2 {
                rx.recv_timeout(Duration::from_secs(5)).unwrap();
            }
            ingestor.stop().unwrap();
            assert_eq!(ingestor.state(), IngestorState::Idle);
        }
    }
}
