use dispatchq::source::{
    FileEvents, FileObserver, FileReader, MemoryPressure, MemoryPressureObserver, PathObserver, ProcessEvents,
    ProcessObserver, Timer,
};
use dispatchq::{DispatchError, Queue};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_path(name: &str) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift")
        .as_nanos();
    std::env::temp_dir().join(format!(
        "dispatchq-{}-{}-{}-{}",
        name,
        std::process::id(),
        unique,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

fn wait_for_events(rx: &mpsc::Receiver<FileEvents>, wanted: FileEvents) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(events) if events.intersects(wanted) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    false
}

#[test]
fn cancel_handler_runs_exactly_once() {
    let queue = Queue::serial("source.cancel");
    let timer = Timer::new(&queue);
    let cancels = Arc::new(AtomicUsize::new(0));

    let counter = cancels.clone();
    timer.set_cancel_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    timer.enable();

    timer.cancel();
    timer.cancel();
    let other = timer.clone();
    thread::spawn(move || other.cancel()).join().unwrap();
    queue.dispatch_sync(|| {});

    assert_eq!(cancels.load(Ordering::SeqCst), 1, "cancel handler must run once");
    assert!(timer.is_cancelled());
}

#[test]
fn cancel_before_enable_still_runs_the_cancel_handler() {
    let queue = Queue::serial("source.cancel.disabled");
    let timer = Timer::new(&queue);
    let (tx, rx) = mpsc::channel();
    timer.set_cancel_handler(move || tx.send(()).unwrap());

    timer.cancel();

    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
}

#[test]
fn file_observer_reports_writes() {
    let path = unique_path("observe-write");
    fs::write(&path, b"start").unwrap();

    let queue = Queue::serial("source.file.write");
    let observer = FileObserver::open(&path, FileEvents::WRITE | FileEvents::EXTEND, &queue).unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = observer.clone();
    observer.set_event_handler(move || {
        let _ = tx.send(handle.events());
    });
    observer.enable();

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b" more").unwrap();
    file.flush().unwrap();

    assert!(wait_for_events(&rx, FileEvents::WRITE | FileEvents::EXTEND), "write should be observed");
    assert_eq!(observer.path(), Some(path.as_path()));

    observer.cancel();
    let _ = fs::remove_file(path);
}

#[test]
fn file_observer_reports_delete() {
    let path = unique_path("observe-delete");
    fs::write(&path, b"doomed").unwrap();

    let queue = Queue::serial("source.file.delete");
    let file = fs::File::open(&path).unwrap();
    let observer = FileObserver::from_fd(file, FileEvents::DELETE, &queue).unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = observer.clone();
    observer.set_event_handler(move || {
        let _ = tx.send(handle.events());
    });
    observer.enable();

    fs::remove_file(&path).unwrap();

    assert!(wait_for_events(&rx, FileEvents::DELETE), "delete should be observed");
    observer.cancel();
}

#[test]
fn file_observer_fails_for_missing_files() {
    let queue = Queue::serial("source.file.missing");
    let result = FileObserver::open(unique_path("missing"), FileEvents::WRITE, &queue);
    assert!(matches!(result, Err(DispatchError::Io(_))), "observing a missing file should fail");
}

#[test]
fn path_observer_follows_a_path_that_appears_later() {
    let root = unique_path("observe-path");
    fs::create_dir(&root).unwrap();
    let target = root.join("nested").join("file.txt");

    let queue = Queue::serial("source.path");
    let (tx, rx) = mpsc::channel();
    let observer = PathObserver::new(&target, FileEvents::WRITE, &queue, move |events| {
        let _ = tx.send(events);
    })
    .unwrap();
    observer.enable();
    assert!(!observer.target_exists());

    fs::create_dir(root.join("nested")).unwrap();
    fs::write(&target, b"created").unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while !observer.target_exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(observer.target_exists(), "observer should pick up the new segments");
    while rx.try_recv().is_ok() {}

    let mut file = OpenOptions::new().append(true).open(&target).unwrap();
    file.write_all(b" and written").unwrap();
    file.flush().unwrap();
    assert!(wait_for_events(&rx, FileEvents::WRITE), "writes to the new target should be observed");

    observer.dispose();
    let _ = fs::remove_dir_all(root);
}

#[test]
fn path_observer_rebuilds_after_an_intermediate_directory_is_replaced() {
    let root = unique_path("observe-path-replace");
    let middle = root.join("middle");
    let target = middle.join("file.txt");
    fs::create_dir_all(&middle).unwrap();
    fs::write(&target, b"original").unwrap();

    let queue = Queue::serial("source.path.replace");
    let (tx, rx) = mpsc::channel();
    let observer = PathObserver::new(&target, FileEvents::WRITE, &queue, move |events| {
        let _ = tx.send(events);
    })
    .unwrap();
    observer.enable();
    assert!(observer.target_exists());

    fs::rename(&middle, root.join("middle.old")).unwrap();
    fs::create_dir(&middle).unwrap();
    fs::write(&target, b"replacement").unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while !observer.target_exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(observer.target_exists(), "the chain should be rebuilt on the new directory");
    // Let the notifications of the rebuild settle.
    thread::sleep(Duration::from_millis(200));
    while rx.try_recv().is_ok() {}

    let mut file = OpenOptions::new().append(true).open(&target).unwrap();
    file.write_all(b" and written").unwrap();
    file.flush().unwrap();
    assert!(
        wait_for_events(&rx, FileEvents::WRITE),
        "writes to the file in the new directory should be observed"
    );

    observer.dispose();
    let _ = fs::remove_dir_all(root);
}

#[test]
fn path_observer_rejects_relative_paths() {
    let queue = Queue::serial("source.path.relative");
    let result = PathObserver::new("relative/path", FileEvents::WRITE, &queue, |_| {});
    assert!(matches!(result, Err(DispatchError::InvalidPath(_))));
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0; 2];
    let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "pipe failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

#[test]
fn file_reader_reports_available_bytes() {
    let (read, write) = pipe();
    let queue = Queue::serial("source.reader");
    let reader = FileReader::new(read, &queue).unwrap();
    let (tx, rx) = mpsc::channel();

    let handle = reader.clone();
    reader.set_event_handler(move || {
        let available = handle.available_bytes();
        let mut buffer = [0u8; 64];
        let n = unsafe { libc::read(handle.fd(), buffer.as_mut_ptr().cast(), buffer.len()) };
        let _ = tx.send((available, n));
    });
    reader.enable();

    let mut writer = fs::File::from(write);
    writer.write_all(b"hello").unwrap();

    let (available, read) = rx.recv_timeout(Duration::from_secs(2)).expect("reader should fire");
    assert_eq!(available, 5);
    assert_eq!(read, 5);

    writer.write_all(b"again").unwrap();
    let (available, _) = rx.recv_timeout(Duration::from_secs(2)).expect("reader should fire again");
    assert_eq!(available, 5, "the reader is re-armed after each delivery");

    reader.cancel();
}

#[test]
fn process_observer_reports_exit() {
    let mut child = std::process::Command::new("sleep")
        .arg("0.2")
        .spawn()
        .expect("sleep should be available");

    let queue = Queue::serial("source.process");
    let observer = ProcessObserver::new(child.id() as i32, ProcessEvents::EXIT, &queue).unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = observer.clone();
    observer.set_event_handler(move || {
        let _ = tx.send(handle.events());
    });
    observer.enable();

    let events = rx.recv_timeout(Duration::from_secs(5)).expect("exit should be observed");
    assert!(events.contains(ProcessEvents::EXIT));
    assert_eq!(observer.pid(), child.id() as i32);

    observer.cancel();
    child.wait().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn memory_pressure_observer_needs_pressure_stall_information() {
    let queue = Queue::serial("source.memory");
    match MemoryPressureObserver::new(MemoryPressure::WARN | MemoryPressure::CRITICAL, &queue) {
        Ok(observer) => {
            assert_eq!(observer.mask(), MemoryPressure::WARN | MemoryPressure::CRITICAL);
            observer.cancel();
            assert!(observer.is_cancelled());
        }
        // Kernels without PSI, or sandboxes hiding /proc/pressure.
        Err(err) => assert!(matches!(err, DispatchError::Io(_)), "unexpected error: {err}"),
    }
}

#[cfg(not(target_os = "linux"))]
#[test]
fn memory_pressure_observer_is_unsupported() {
    let queue = Queue::serial("source.memory");
    let result = MemoryPressureObserver::new(MemoryPressure::WARN, &queue);
    assert!(matches!(result, Err(DispatchError::Unsupported(_))));
}
