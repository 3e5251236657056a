use bytes::Bytes;
use dispatchq::io::{CloseMode, RandomAccessChannel, ReadLength, StreamChannel};
use dispatchq::{ChannelError, Queue};
use std::fs;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_path(name: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "dispatchq-{}-{}-{}-{}.tmp",
        name,
        std::process::id(),
        unique,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn no_cleanup(_: Option<ChannelError>) {}

// Collects the deliveries of one operation and returns them once done.
fn collect() -> (
    impl FnMut(bool, Bytes, Option<ChannelError>) + Send + 'static,
    mpsc::Receiver<(Vec<Bytes>, Option<ChannelError>)>,
) {
    let (tx, rx) = mpsc::channel();
    let mut parts = Vec::new();
    let handler = move |done: bool, data: Bytes, error: Option<ChannelError>| {
        parts.push(data);
        if done {
            let _ = tx.send((std::mem::take(&mut parts), error));
        }
    };
    (handler, rx)
}

fn concat(parts: &[Bytes]) -> Vec<u8> {
    parts.iter().flat_map(|part| part.iter().copied()).collect()
}

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn random_access_write_then_read_roundtrip() {
    let path = unique_path("random-roundtrip");
    let queue = Queue::serial("io.random");
    let channel = RandomAccessChannel::open(&path, libc::O_RDWR | libc::O_CREAT, 0o644, &queue, no_cleanup);

    let payload: Vec<u8> = (0..100u8).collect();
    let (on_write, written) = collect();
    channel.write_at(payload.clone(), 0, &queue, on_write);
    let (_, error) = written.recv_timeout(TIMEOUT).expect("write should complete");
    assert!(error.is_none(), "write failed: {error:?}");

    let (on_read, read) = collect();
    channel.read_at(0, ReadLength::Exact(100), &queue, on_read);
    let (parts, error) = read.recv_timeout(TIMEOUT).expect("read should complete");
    assert!(error.is_none(), "read failed: {error:?}");
    assert_eq!(concat(&parts), payload, "read data should match what was written");

    channel.close(CloseMode::Drain);
    let _ = fs::remove_file(path);
}

#[test]
fn duplicated_channel_reads_what_the_original_wrote() {
    let path = unique_path("random-duplicate");
    let queue = Queue::serial("io.random.duplicate");
    let original = RandomAccessChannel::open(&path, libc::O_RDWR | libc::O_CREAT, 0o644, &queue, no_cleanup);
    let duplicate = RandomAccessChannel::from_channel(&original, &queue, no_cleanup);
    assert_eq!(original.fd(), duplicate.fd(), "both channels share the descriptor");

    let (on_write, written) = collect();
    original.write_at(&b"shared bytes"[..], 4, &queue, on_write);
    written.recv_timeout(TIMEOUT).unwrap();

    original.close(CloseMode::Drain);

    let (on_read, read) = collect();
    duplicate.read_at(4, ReadLength::ToEnd, &queue, on_read);
    let (parts, error) = read.recv_timeout(TIMEOUT).unwrap();
    assert!(error.is_none());
    assert_eq!(concat(&parts), b"shared bytes");

    duplicate.close(CloseMode::Drain);
    let _ = fs::remove_file(path);
}

#[test]
fn water_marks_split_deliveries() {
    let path = unique_path("water-marks");
    fs::write(&path, vec![7u8; 35]).unwrap();

    let queue = Queue::serial("io.water");
    let channel = RandomAccessChannel::open(&path, libc::O_RDONLY, 0, &queue, no_cleanup);
    channel.set_low_water(10);
    channel.set_high_water(10);

    let (on_read, read) = collect();
    channel.read_at(0, ReadLength::Exact(35), &queue, on_read);
    let (parts, error) = read.recv_timeout(TIMEOUT).unwrap();

    assert!(error.is_none());
    let sizes: Vec<usize> = parts.iter().map(Bytes::len).collect();
    assert_eq!(sizes, vec![10, 10, 10, 5]);

    channel.close(CloseMode::Drain);
    let _ = fs::remove_file(path);
}

#[test]
fn copy_reports_cumulative_progress() {
    let source_path = unique_path("copy-source");
    let target_path = unique_path("copy-target");
    let payload: Vec<u8> = (0..250).map(|i| (i % 251) as u8).collect();
    fs::write(&source_path, &payload).unwrap();

    let queue = Queue::serial("io.copy");
    let source = StreamChannel::open(&source_path, libc::O_RDONLY, 0, &queue, no_cleanup);
    let target = StreamChannel::open(
        &target_path,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        0o644,
        &queue,
        no_cleanup,
    );

    let progress = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let seen = progress.clone();
    source.copy_to(
        ReadLength::Exact(250),
        100,
        target.clone(),
        &queue,
        move |copied| seen.lock().unwrap().push(copied),
        move |total, error| tx.send((total, error)).unwrap(),
    );

    let (total, error) = rx.recv_timeout(TIMEOUT).expect("copy should complete");
    assert_eq!(total, 250);
    assert!(error.is_none(), "copy failed: {error:?}");
    assert_eq!(*progress.lock().unwrap(), vec![100, 200, 250]);

    source.close(CloseMode::Drain);
    target.close(CloseMode::Drain);
    queue.dispatch_sync(|| {});
    assert_eq!(fs::read(&target_path).unwrap(), payload);

    let _ = fs::remove_file(source_path);
    let _ = fs::remove_file(target_path);
}

#[test]
fn copy_stops_early_at_end_of_file() {
    let source_path = unique_path("copy-short-source");
    let target_path = unique_path("copy-short-target");
    let payload = vec![3u8; 150];
    fs::write(&source_path, &payload).unwrap();

    let queue = Queue::serial("io.copy.short");
    let source = StreamChannel::open(&source_path, libc::O_RDONLY, 0, &queue, no_cleanup);
    let target = StreamChannel::open(
        &target_path,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        0o644,
        &queue,
        no_cleanup,
    );

    let progress = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let seen = progress.clone();
    source.copy_to(
        ReadLength::Exact(400),
        100,
        target.clone(),
        &queue,
        move |copied| seen.lock().unwrap().push(copied),
        move |total, error| tx.send((total, error)).unwrap(),
    );

    let (total, error) = rx.recv_timeout(TIMEOUT).expect("copy should complete at end of file");
    assert_eq!(total, 150, "only the bytes before end of file are copied");
    assert!(error.is_none(), "a short source is not an error: {error:?}");
    assert_eq!(*progress.lock().unwrap(), vec![100, 150]);

    source.close(CloseMode::Drain);
    target.close(CloseMode::Drain);
    let _ = fs::remove_file(source_path);
    let _ = fs::remove_file(target_path);
}

#[test]
fn empty_copy_completes_on_the_given_queue() {
    let path = unique_path("copy-nothing");
    fs::write(&path, b"data").unwrap();
    let queue = Queue::serial("io.copy.nothing");
    let source = StreamChannel::open(&path, libc::O_RDONLY, 0, &queue, no_cleanup);
    let target_path = unique_path("copy-nothing-target");
    let target = StreamChannel::open(&target_path, libc::O_WRONLY | libc::O_CREAT, 0o644, &queue, no_cleanup);

    let (tx, rx) = mpsc::channel();
    let on_queue = queue.clone();
    source.copy_to(ReadLength::Exact(0), 100, target, &queue, |_| {}, move |total, error| {
        tx.send((total, error.is_none(), on_queue.is_current())).unwrap()
    });

    let (total, ok, on_queue) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(total, 0);
    assert!(ok);
    assert!(on_queue, "the completion runs on the copy's queue");
    let _ = fs::remove_file(path);
    let _ = fs::remove_file(target_path);
}

#[test]
fn copy_rejects_empty_chunks() {
    let path = unique_path("copy-empty-chunk");
    fs::write(&path, b"data").unwrap();
    let queue = Queue::serial("io.copy.invalid");
    let source = StreamChannel::open(&path, libc::O_RDONLY, 0, &queue, no_cleanup);
    let target = StreamChannel::open(unique_path("copy-empty-target"), libc::O_WRONLY | libc::O_CREAT, 0o644, &queue, no_cleanup);

    let (tx, rx) = mpsc::channel();
    source.copy_to(ReadLength::ToEnd, 0, target, &queue, |_| {}, move |total, error| {
        tx.send((total, error)).unwrap()
    });

    let (total, error) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(total, 0);
    assert!(matches!(error, Some(ChannelError::InvalidChunkLength)));
    let _ = fs::remove_file(path);
}

#[test]
fn drain_close_completes_writes_before_cleanup() {
    let path = unique_path("close-drain");
    let queue = Queue::serial("io.close.drain");
    let (tx, rx) = mpsc::channel();

    let cleanup_tx = tx.clone();
    let channel = StreamChannel::open(
        &path,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        0o644,
        &queue,
        move |error| cleanup_tx.send(format!("cleanup {}", error.is_some())).unwrap(),
    );
    channel.write(&b"drained"[..], &queue, move |done, _, error| {
        if done {
            tx.send(format!("write {}", error.is_some())).unwrap();
        }
    });
    channel.close(CloseMode::Drain);
    channel.close(CloseMode::Drain);

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "write false");
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), "cleanup false");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "cleanup runs once");
    assert_eq!(fs::read(&path).unwrap(), b"drained");
    let _ = fs::remove_file(path);
}

#[test]
fn immediate_close_cancels_a_blocked_read() {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let queue = Queue::serial("io.close.immediate");
    let (cleanup_tx, cleanup_rx) = mpsc::channel();
    let channel = StreamChannel::from_fd(read, &queue, move |error| cleanup_tx.send(error).unwrap());

    let (on_read, result) = collect();
    channel.read(ReadLength::Exact(16), &queue, on_read);
    std::thread::sleep(Duration::from_millis(50));
    channel.close(CloseMode::Immediate);

    let (_, error) = result.recv_timeout(TIMEOUT).expect("read should be cancelled");
    assert!(matches!(error, Some(ChannelError::Cancelled)), "unexpected error: {error:?}");
    assert!(cleanup_rx.recv_timeout(TIMEOUT).unwrap().is_none());
    drop(write);
}

#[test]
fn operations_after_close_report_closed() {
    let path = unique_path("after-close");
    let queue = Queue::serial("io.after.close");
    let channel = StreamChannel::open(&path, libc::O_WRONLY | libc::O_CREAT, 0o644, &queue, no_cleanup);
    channel.close(CloseMode::Drain);

    let (on_write, result) = collect();
    channel.write(&b"late"[..], &queue, on_write);
    let (_, error) = result.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(error, Some(ChannelError::Closed)));
    let _ = fs::remove_file(path);
}

#[test]
fn channel_stays_open_until_cleanup_runs() {
    let path = unique_path("open-until-cleanup");
    let cleanup_queue = Queue::serial("io.open.until.cleanup.handler");
    let (tx, rx) = mpsc::channel();

    cleanup_queue.suspend();
    let channel = StreamChannel::open(
        &path,
        libc::O_WRONLY | libc::O_CREAT,
        0o644,
        &cleanup_queue,
        move |error| tx.send(error.is_none()).unwrap(),
    );
    channel.close(CloseMode::Drain);
    let (drained_tx, drained) = mpsc::channel();
    channel.dispatch_barrier(move || drained_tx.send(()).unwrap());
    drained.recv_timeout(TIMEOUT).expect("the close should be processed");
    assert!(channel.is_open(), "a closing channel is open until its cleanup ran");

    cleanup_queue.resume();
    assert!(rx.recv_timeout(TIMEOUT).unwrap(), "cleanup should report no error");
    assert!(!channel.is_open(), "the channel is closed once cleanup ran");
    let _ = fs::remove_file(path);
}

#[test]
fn failed_open_reports_to_cleanup() {
    let queue = Queue::serial("io.open.failure");
    let (tx, rx) = mpsc::channel();
    let channel = RandomAccessChannel::open(unique_path("missing"), libc::O_RDONLY, 0, &queue, move |error| {
        tx.send(error).unwrap()
    });

    let error = rx.recv_timeout(TIMEOUT).unwrap().expect("open should fail");
    assert_eq!(error.raw_os_error(), Some(libc::ENOENT));
    assert!(!channel.is_open());
    assert_eq!(channel.fd(), None);
}

#[test]
fn barrier_runs_after_earlier_operations() {
    let path = unique_path("barrier");
    let queue = Queue::serial("io.barrier");
    let channel = RandomAccessChannel::open(&path, libc::O_RDWR | libc::O_CREAT, 0o644, &queue, no_cleanup);

    let (on_write, _written) = collect();
    channel.write_at(vec![1u8; 4096], 0, &queue, on_write);
    let (tx, rx) = mpsc::channel();
    let barrier_path = path.clone();
    channel.dispatch_barrier(move || tx.send(fs::metadata(&barrier_path).unwrap().len()).unwrap());

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), 4096, "the write should be complete");
    channel.close(CloseMode::Drain);
    let _ = fs::remove_file(path);
}
