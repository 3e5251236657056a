use dispatchq::source::Timer;
use dispatchq::time::Clock;
use dispatchq::Queue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn single_shot_fires_once() {
    let queue = Queue::serial("timer.single");
    let timer = Timer::single_shot(Duration::from_millis(20), Clock::Monotonic, &queue);
    let (tx, rx) = mpsc::channel();

    let handle = timer.clone();
    timer.set_event_handler(move || tx.send(handle.fire_count()).unwrap());
    timer.enable();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("timer should fire"), 1);
    assert!(
        rx.recv_timeout(Duration::from_millis(100)).is_err(),
        "a single-shot timer fires only once"
    );
    timer.cancel();
}

#[test]
fn missed_fires_accumulate_while_the_queue_is_suspended() {
    let queue = Queue::serial("timer.coalesce");
    queue.suspend();

    let timer = Timer::repeating(Duration::from_millis(10), Duration::ZERO, Clock::Monotonic, &queue);
    let (tx, rx) = mpsc::channel();
    let handle = timer.clone();
    timer.set_event_handler(move || {
        let _ = tx.send(handle.fire_count());
    });
    timer.enable();

    thread::sleep(Duration::from_millis(50));
    queue.resume();

    let first = rx.recv_timeout(Duration::from_secs(2)).expect("timer should fire");
    assert!(first >= 4, "expected at least 4 coalesced fires, got {first}");
    timer.cancel();
}

#[test]
fn timer_does_not_deliver_before_enable() {
    let queue = Queue::serial("timer.disabled");
    let timer = Timer::single_shot(Duration::from_millis(10), Clock::Monotonic, &queue);
    let (tx, rx) = mpsc::channel();
    timer.set_event_handler(move || tx.send(()).unwrap());

    assert!(rx.recv_timeout(Duration::from_millis(80)).is_err(), "timers start disabled");

    timer.enable();
    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok(), "the recorded fire is delivered on enable");
    timer.cancel();
}

#[test]
fn cancel_stops_a_repeating_timer() {
    let queue = Queue::serial("timer.cancel");
    let timer = Timer::repeating(Duration::from_millis(5), Duration::ZERO, Clock::Monotonic, &queue);
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    timer.set_event_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    timer.enable();
    thread::sleep(Duration::from_millis(40));

    timer.cancel();
    queue.dispatch_sync(|| {});
    let after_cancel = fired.load(Ordering::SeqCst);
    assert!(after_cancel > 0, "timer should have fired before cancel");

    thread::sleep(Duration::from_millis(40));
    queue.dispatch_sync(|| {});
    assert_eq!(fired.load(Ordering::SeqCst), after_cancel, "no delivery after cancel");
    assert!(timer.is_cancelled());
}

#[test]
fn set_fire_reschedules() {
    let queue = Queue::serial("timer.reschedule");
    let timer = Timer::single_shot(Duration::from_secs(60), Clock::Monotonic, &queue);
    let (tx, rx) = mpsc::channel();
    timer.set_event_handler(move || tx.send(Instant::now()).unwrap());
    timer.enable();

    let start = Instant::now();
    timer.set_fire(Duration::from_millis(30), Clock::Monotonic);

    let fired = rx.recv_timeout(Duration::from_secs(2)).expect("rescheduled timer should fire");
    assert!(fired - start >= Duration::from_millis(30));
    timer.cancel();
}

#[test]
fn wall_clock_timer_fires() {
    let queue = Queue::serial("timer.wall");
    let timer = Timer::single_shot(Duration::from_millis(20), Clock::WallTime, &queue);
    let (tx, rx) = mpsc::channel();
    timer.set_event_handler(move || tx.send(()).unwrap());
    timer.enable();

    assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    timer.cancel();
}

#[test]
fn no_event_is_delivered_after_the_cancel_handler() {
    let queue = Queue::serial("timer.cancel.in.delivery");
    let timer = Timer::repeating(Duration::from_millis(5), Duration::ZERO, Clock::Monotonic, &queue);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started) = mpsc::channel();
    let (cancelled_tx, cancelled) = mpsc::channel();

    let events = log.clone();
    timer.set_event_handler(move || {
        let first = {
            let mut events = events.lock().unwrap();
            events.push("event");
            events.len() == 1
        };
        if first {
            let _ = started_tx.send(());
            // Keep this delivery running while the timer is cancelled.
            thread::sleep(Duration::from_millis(50));
        }
    });
    let cancel_log = log.clone();
    timer.set_cancel_handler(move || {
        cancel_log.lock().unwrap().push("cancel");
        let _ = cancelled_tx.send(());
    });
    timer.enable();

    started.recv_timeout(Duration::from_secs(2)).expect("timer should fire");
    timer.cancel();
    cancelled.recv_timeout(Duration::from_secs(2)).expect("cancel handler should run");
    thread::sleep(Duration::from_millis(50));

    let log = log.lock().unwrap();
    assert_eq!(log.last(), Some(&"cancel"), "nothing runs after the cancel handler: {log:?}");
    assert_eq!(log.iter().filter(|entry| **entry == "cancel").count(), 1);
}
