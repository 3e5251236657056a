use dispatchq::source::SignalObserver;
use dispatchq::Queue;
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[test]
fn signal_observer_counts_deliveries() {
    let queue = Queue::serial("source.signal");
    let observer = SignalObserver::new(libc::SIGUSR1, &queue).expect("SIGUSR1 can be observed");
    assert_eq!(observer.signal(), libc::SIGUSR1);

    let (tx, rx) = mpsc::channel();
    let handle = observer.clone();
    observer.set_event_handler(move || {
        let _ = tx.send(handle.count());
    });
    observer.enable();

    unsafe {
        libc::raise(libc::SIGUSR1);
        libc::raise(libc::SIGUSR1);
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut total = 0;
    while total < 2 {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("both signals should be observed in time");
        total += rx.recv_timeout(remaining).expect("signal should be observed");
    }
    assert_eq!(total, 2, "each raised signal is counted once");

    observer.cancel();
}

#[test]
fn uncatchable_signals_are_rejected() {
    let queue = Queue::serial("source.signal.kill");
    assert!(SignalObserver::new(libc::SIGKILL, &queue).is_err());
}
