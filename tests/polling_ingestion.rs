use std::thread;
use std::time::Duration;

use frame_ingest::capture::{
    Encoding, Frame, IngestorState, PollingIngestor, RunMode, Value, FRAME_NUMBER_KEY, PROFILE_ENTRY_KEY,
    PROFILE_QUEUE_KEY,
};
use frame_ingest::pipeline::{QueueClient, BLOCKED_TIMESTAMP_KEY};
use frame_ingest::{IngestorConfig, IngestorKind};

const WAIT: Duration = Duration::from_secs(5);

fn frame_number(frame: &Frame) -> i64 {
    frame.meta().get(FRAME_NUMBER_KEY).and_then(Value::as_i64).unwrap()
}

fn ingestor(config: IngestorConfig, capacity: usize) -> (PollingIngestor, QueueClient, flume::Receiver<Frame>) {
    let (tx, rx) = flume::bounded(capacity);
    let client = QueueClient::from_sender(tx);
    let ingestor = PollingIngestor::new(config, client.clone()).expect("ingestor");
    (ingestor, client, rx)
}

fn polling(pipeline: &str) -> IngestorConfig {
    IngestorConfig::new(pipeline, IngestorKind::Polling)
}

#[test]
fn numbers_frames_from_one_and_halts_at_end() {
    let (mut ingestor, _client, rx) = ingestor(polling("stub://frames=5&width=4&height=4"), 16);
    ingestor.run(RunMode::Continuous).unwrap();

    let numbers: Vec<_> = (0..5).map(|_| frame_number(&rx.recv_timeout(WAIT).unwrap())).collect();
    assert_eq!(numbers, [1, 2, 3, 4, 5]);

    // Exhausted and not looping: nothing more arrives, the worker just waits
    assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
    assert_eq!(ingestor.state(), IngestorState::Running);

    ingestor.stop().unwrap();
    assert_eq!(ingestor.state(), IngestorState::Idle);
}

#[test]
fn looping_keeps_numbering_across_reopen() {
    let mut config = polling("stub://frames=3&width=2&height=2");
    config.loop_video = true;
    let (mut ingestor, _client, rx) = ingestor(config, 4);
    ingestor.run(RunMode::Continuous).unwrap();

    let frames: Vec<_> = (0..8).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    let numbers: Vec<_> = frames.iter().map(frame_number).collect();
    assert_eq!(numbers, [1, 2, 3, 4, 5, 6, 7, 8]);
    let first_bytes: Vec<u8> = frames.iter().map(|f| f.data()[0]).collect();
    assert_eq!(first_bytes, [0, 1, 2, 0, 1, 2, 0, 1]);

    let drain = thread::spawn(move || while rx.recv_timeout(Duration::from_millis(300)).is_ok() {});
    ingestor.stop().unwrap();
    drain.join().unwrap();
}

#[test]
fn double_frames_carry_an_unencoded_copy() {
    let mut config = polling("stub://frames=10&width=8&height=8&channels=3");
    config.double_frames = true;
    config.encoding = Encoding::Png { level: 4 };
    let (mut ingestor, _client, rx) = ingestor(config, 16);
    ingestor.run(RunMode::Continuous).unwrap();

    for _ in 0..10 {
        let frame = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(frame.encoding(), Encoding::Png { level: 4 });
        let duplicate = frame.duplicate().expect("duplicate");
        assert_eq!(duplicate.encoding(), Encoding::None);
        assert_eq!(duplicate.data(), frame.data());
        assert_eq!(
            (duplicate.width(), duplicate.height(), duplicate.channels()),
            (8, 8, 3)
        );
    }
    ingestor.stop().unwrap();
}

#[test]
fn snapshot_pushes_one_frame_and_signals() {
    let (mut ingestor, _client, rx) = ingestor(polling("stub://frames=10"), 4);
    ingestor.run(RunMode::Snapshot).unwrap();

    assert_eq!(ingestor.snapshot_signal().recv_timeout(WAIT).unwrap(), 1);
    assert_eq!(frame_number(&rx.recv_timeout(WAIT).unwrap()), 1);
    ingestor.stop().unwrap();
    assert!(rx.try_recv().is_err());

    // Reusable once idle again; numbering restarts
    ingestor.run(RunMode::Snapshot).unwrap();
    assert_eq!(ingestor.snapshot_signal().recv_timeout(WAIT).unwrap(), 1);
    ingestor.stop().unwrap();
}

#[test]
fn profiling_stamps_entry_and_queue_times() {
    let mut config = polling("stub://frames=2");
    config.profiling = true;
    let (mut ingestor, _client, rx) = ingestor(config, 4);
    ingestor.run(RunMode::Continuous).unwrap();

    let frame = rx.recv_timeout(WAIT).unwrap();
    let entry = frame.meta().get(PROFILE_ENTRY_KEY).and_then(Value::as_i64).unwrap();
    let queued = frame.meta().get(PROFILE_QUEUE_KEY).and_then(Value::as_i64).unwrap();
    assert!(queued >= entry);
    ingestor.stop().unwrap();
}

#[test]
fn full_queue_blocks_without_dropping() {
    let (mut ingestor, client, rx) = ingestor(polling("stub://frames=5&width=2&height=2"), 1);
    ingestor.run(RunMode::Continuous).unwrap();

    thread::sleep(Duration::from_millis(200));
    let frames: Vec<_> = (0..5).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(frames.iter().map(frame_number).collect::<Vec<_>>(), [1, 2, 3, 4, 5]);
    assert!(frames[1].meta().contains_key(BLOCKED_TIMESTAMP_KEY));

    ingestor.stop().unwrap();
    let stats = client.stats();
    assert_eq!(stats.pushed, 5);
    assert!(stats.blocked >= 1);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn poll_interval_spaces_out_reads() {
    let mut config = polling("stub://frames=3");
    config.poll_interval = Some(Duration::from_millis(100));
    let (mut ingestor, _client, rx) = ingestor(config, 4);

    let started = std::time::Instant::now();
    ingestor.run(RunMode::Continuous).unwrap();
    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert!(started.elapsed() >= Duration::from_millis(250));
    ingestor.stop().unwrap();
}

#[test]
fn run_twice_is_rejected() {
    let (mut ingestor, _client, _rx) = ingestor(polling("stub://frames=1"), 4);
    ingestor.run(RunMode::Continuous).unwrap();
    assert!(ingestor.run(RunMode::Continuous).is_err());
    ingestor.stop().unwrap();
}
