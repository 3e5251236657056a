use dispatchq::{Queue, QueueKind, is_main_thread};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn main_queue_is_a_singleton() {
    assert_eq!(Queue::main(), Queue::main());
    assert_eq!(Queue::main().kind(), QueueKind::Main);
    assert_eq!(Queue::main().label(), Some("dispatchq.main"));
}

#[test]
fn sync_runs_on_the_main_thread() {
    assert!(!is_main_thread(), "the test thread is not the main queue thread");

    let (on_main, thread_id) = Queue::main().dispatch_sync(|| (is_main_thread(), thread::current().id()));

    assert!(on_main, "main queue blocks run on the main queue thread");
    assert_ne!(thread_id, thread::current().id());
}

#[test]
fn async_runs_on_the_main_thread() {
    let (tx, rx) = mpsc::channel();
    Queue::main().dispatch_async(move || tx.send(is_main_thread()).unwrap());

    let on_main = rx.recv_timeout(Duration::from_secs(2)).expect("block should run");
    assert!(on_main);
}

#[test]
fn sync_hop_keeps_the_callers_queues_current() {
    let outer = Queue::serial("main.hop.outer");
    let probe = outer.clone();

    let (outer_current, main_current) = outer.dispatch_sync(move || {
        Queue::main().dispatch_sync(move || (probe.is_current(), Queue::main().is_current()))
    });

    assert!(outer_current, "the caller's queue should stay current on the main thread");
    assert!(main_current);
}

#[test]
fn sync_panic_on_main_reaches_the_caller() {
    let result = panic::catch_unwind(AssertUnwindSafe(|| Queue::main().dispatch_sync(|| panic!("main boom"))));
    assert!(result.is_err());

    assert_eq!(Queue::main().dispatch_sync(|| 3), 3, "main queue should keep working");
}

#[test]
fn main_queue_is_serial() {
    let (tx, rx) = mpsc::channel();
    for i in 0..50 {
        let tx = tx.clone();
        Queue::main().dispatch_async(move || tx.send(i).unwrap());
    }

    let received: Vec<i32> = (0..50)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
        .collect();
    assert_eq!(received, (0..50).collect::<Vec<_>>());
}
