use std::sync::Arc;
use std::thread;
use std::time::Duration;

use frame_ingest::capture::{
    EventDrivenIngestor, Frame, IngestorState, Value, DETECTIONS_KEY, IMAGE_HANDLE_KEY, PROFILE_ENTRY_KEY,
};
use frame_ingest::pipeline::{QueueClient, BLOCKED_TIMESTAMP_KEY};
use frame_ingest::utils::IMAGE_HANDLE_LENGTH;
use frame_ingest::{IngestorConfig, IngestorKind};

fn ingestor(pipeline: &str, capacity: usize) -> (EventDrivenIngestor, QueueClient, flume::Receiver<Frame>) {
    let (tx, rx) = flume::bounded(capacity);
    let client = QueueClient::from_sender(tx);
    let config = IngestorConfig::new(pipeline, IngestorKind::EventDriven);
    let ingestor = EventDrivenIngestor::new(config, client.clone()).expect("ingestor");
    (ingestor, client, rx)
}

#[test]
fn delivers_every_sample_until_end_of_stream() {
    let (ingestor, client, rx) = ingestor("stub://frames=10&width=16&height=8&channels=3", 16);

    ingestor.start().unwrap();
    ingestor.run().unwrap();
    assert_eq!(ingestor.state(), IngestorState::Stopped);

    let frames: Vec<_> = rx.try_iter().collect();
    assert_eq!(frames.len(), 10);
    for (index, frame) in frames.iter().enumerate() {
        assert_eq!((frame.width(), frame.height(), frame.channels()), (16, 8, 3));
        assert_eq!(frame.data().len(), 16 * 8 * 3);
        assert_eq!(frame.data()[0], index as u8);

        let handle = frame.meta().get(IMAGE_HANDLE_KEY).and_then(Value::as_str).unwrap();
        assert_eq!(handle.len(), IMAGE_HANDLE_LENGTH);
        assert!(handle.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!frame.meta().contains_key(DETECTIONS_KEY));
        assert!(!frame.meta().contains_key(PROFILE_ENTRY_KEY));
    }
    assert_eq!(client.stats().pushed, 10);
    assert_eq!(ingestor.frames_pushed(), 10);
}

#[test]
fn detections_are_translated_in_order() {
    let (ingestor, _client, rx) = ingestor("stub://frames=2&regions=2&tensors=3", 4);
    ingestor.start().unwrap();
    ingestor.run().unwrap();

    let frame = rx.try_recv().unwrap();
    let regions = frame.meta().get(DETECTIONS_KEY).and_then(Value::as_array).unwrap();
    assert_eq!(regions.len(), 2);

    let second = regions[1].as_object().unwrap();
    assert_eq!(
        second.keys().collect::<Vec<_>>(),
        ["x", "y", "width", "height", "tensor"]
    );
    assert_eq!(second.get("x").and_then(Value::as_i64), Some(10));
    assert_eq!(second.get("y").and_then(Value::as_i64), Some(5));

    let tensors = second.get("tensor").and_then(Value::as_array).unwrap();
    assert_eq!(tensors.len(), 3);
    for (t, tensor) in tensors.iter().enumerate() {
        let tensor = tensor.as_object().unwrap();
        assert_eq!(tensor.keys().collect::<Vec<_>>(), ["attribute", "label", "confidence"]);
        assert_eq!(tensor.get("attribute").and_then(Value::as_str), Some("detection"));
        assert_eq!(tensor.get("label").and_then(Value::as_str), Some(format!("label_{}", t).as_str()));
        assert_eq!(tensor.get("confidence").and_then(Value::as_i64), Some(t as i64 * 10));
    }
}

#[test]
fn unmappable_samples_are_skipped() {
    let (ingestor, _client, rx) = ingestor("stub://frames=9&fail_every=3", 16);
    ingestor.start().unwrap();
    ingestor.run().unwrap();

    let first_bytes: Vec<u8> = rx.try_iter().map(|f| f.data()[0]).collect();
    assert_eq!(first_bytes, [0, 1, 3, 4, 6, 7]);
}

#[test]
fn bus_error_ends_the_run() {
    let (ingestor, _client, rx) = ingestor("stub://frames=10&error_after=4", 16);
    ingestor.start().unwrap();
    ingestor.run().unwrap();

    assert_eq!(rx.len(), 4);
    assert_eq!(ingestor.state(), IngestorState::Stopped);
}

#[test]
fn full_queue_blocks_without_dropping() {
    let (ingestor, client, rx) = ingestor("stub://frames=6&width=2&height=2&channels=1", 2);
    ingestor.start().unwrap();

    let consumer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect::<Vec<_>>()
    });

    ingestor.run().unwrap();
    let frames = consumer.join().unwrap();

    let order: Vec<u8> = frames.iter().map(|f| f.data()[0]).collect();
    assert_eq!(order, [0, 1, 2, 3, 4, 5]);
    assert!(frames.iter().any(|f| f.meta().contains_key(BLOCKED_TIMESTAMP_KEY)));
    assert!(!frames[0].meta().contains_key(BLOCKED_TIMESTAMP_KEY));

    let stats = client.stats();
    assert_eq!(stats.pushed, 6);
    assert!(stats.blocked >= 1);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn stop_from_another_thread_ends_run() {
    let (ingestor, _client, rx) = ingestor("stub://frames=100000&width=2&height=2", 4);
    let ingestor = Arc::new(ingestor);
    ingestor.start().unwrap();

    let runner = {
        let ingestor = Arc::clone(&ingestor);
        thread::spawn(move || ingestor.run())
    };
    let drain = thread::spawn(move || while rx.recv_timeout(Duration::from_millis(500)).is_ok() {});

    thread::sleep(Duration::from_millis(100));
    ingestor.stop().unwrap();
    runner.join().unwrap().unwrap();
    assert_eq!(ingestor.state(), IngestorState::Stopped);

    // Single-shot: no restart after stop
    assert!(ingestor.start().is_err());
    drop(ingestor);
    drain.join().unwrap();
}

#[test]
fn profiling_stamps_entry_time() {
    let (tx, rx) = flume::bounded(4);
    let mut config = IngestorConfig::new("stub://frames=1", IngestorKind::EventDriven);
    config.profiling = true;
    let ingestor = EventDrivenIngestor::new(config, QueueClient::from_sender(tx)).unwrap();
    ingestor.start().unwrap();
    ingestor.run().unwrap();

    let frame = rx.try_recv().unwrap();
    assert!(frame.meta().get(PROFILE_ENTRY_KEY).and_then(Value::as_i64).unwrap() > 0);
}

#[test]
fn unsupported_descriptor_fails_to_start() {
    let (tx, _rx) = flume::bounded(1);
    let config = IngestorConfig::new("stub://bogus=1", IngestorKind::EventDriven);
    let ingestor = EventDrivenIngestor::new(config, QueueClient::from_sender(tx)).unwrap();
    assert!(ingestor.start().is_err());
    assert_eq!(ingestor.state(), IngestorState::Idle);
}
