use dispatchq::{ConcurrentQueue, Priority, Queue, QueueKind};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

#[test]
fn blocks_run_in_parallel() {
    let queue = ConcurrentQueue::new("concurrent.parallel");
    let barrier = Arc::new(Barrier::new(4));
    let (tx, rx) = mpsc::channel();

    // Each block waits for the other three, so this only completes if all
    // four run at the same time.
    for _ in 0..4 {
        let barrier = barrier.clone();
        let tx = tx.clone();
        queue.dispatch_async(move || {
            barrier.wait();
            tx.send(()).unwrap();
        });
    }

    for _ in 0..4 {
        rx.recv_timeout(Duration::from_secs(5))
            .expect("all four blocks should run concurrently");
    }
}

#[test]
fn barrier_waits_for_earlier_blocks_and_holds_later_ones() {
    let queue = ConcurrentQueue::new("concurrent.barrier");
    let finished = Arc::new(AtomicUsize::new(0));
    let barrier_done = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    for _ in 0..10 {
        let finished = finished.clone();
        queue.dispatch_async(move || {
            thread::sleep(Duration::from_millis(10));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    {
        let finished = finished.clone();
        let barrier_done = barrier_done.clone();
        let tx = tx.clone();
        queue.dispatch_barrier_async(move || {
            tx.send(("barrier", finished.load(Ordering::SeqCst))).unwrap();
            thread::sleep(Duration::from_millis(20));
            barrier_done.store(true, Ordering::SeqCst);
        });
    }

    for _ in 0..5 {
        let barrier_done = barrier_done.clone();
        let tx = tx.clone();
        queue.dispatch_async(move || {
            tx.send(("after", usize::from(barrier_done.load(Ordering::SeqCst)))).unwrap();
        });
    }

    let (label, seen) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(label, "barrier", "the barrier should run before later blocks");
    assert_eq!(seen, 10, "the barrier should see every earlier block finished");

    for _ in 0..5 {
        let (label, done) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(label, "after");
        assert_eq!(done, 1, "later blocks should start after the barrier finished");
    }
}

#[test]
fn barrier_sync_returns_after_earlier_blocks() {
    let queue = ConcurrentQueue::new("concurrent.barrier.sync");
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let finished = finished.clone();
        queue.dispatch_async(move || {
            thread::sleep(Duration::from_millis(5));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    let seen = queue.dispatch_barrier_sync(|| finished.load(Ordering::SeqCst));
    assert_eq!(seen, 8);
}

#[test]
fn apply_runs_every_iteration() {
    let queue = ConcurrentQueue::new("concurrent.apply");
    let sum = AtomicUsize::new(0);
    let threads = Mutex::new(HashSet::new());

    queue.dispatch_apply(100, |i| {
        sum.fetch_add(i, Ordering::SeqCst);
        threads.lock().unwrap().insert(thread::current().id());
        thread::sleep(Duration::from_millis(1));
    });

    assert_eq!(sum.load(Ordering::SeqCst), (0..100).sum::<usize>());
    assert!(!threads.lock().unwrap().is_empty());
}

#[test]
fn apply_reraises_a_panicking_iteration() {
    let queue = ConcurrentQueue::new("concurrent.apply.panic");
    let completed = AtomicUsize::new(0);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.dispatch_apply(10, |i| {
            if i == 3 {
                panic!("iteration {i} failed");
            }
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }));

    assert!(result.is_err(), "the panic should reach the caller");
    assert_eq!(completed.load(Ordering::SeqCst), 9, "every other iteration should still run");
}

#[test]
fn global_queues_are_shared_and_ignore_suspend() {
    let queue = Queue::global(Priority::Low);
    assert_eq!(queue, Queue::global(Priority::Low), "global queues are singletons");
    assert_eq!(queue.kind(), QueueKind::Global(Priority::Low));
    assert_ne!(queue, Queue::global(Priority::High));

    queue.suspend();
    let (tx, rx) = mpsc::channel();
    queue.dispatch_async(move || tx.send(()).unwrap());
    assert!(
        rx.recv_timeout(Duration::from_secs(2)).is_ok(),
        "suspending a global queue has no effect"
    );
    assert!(!queue.is_suspended());
}

#[test]
fn global_sync_runs_on_the_caller_thread() {
    let queue = Queue::global(Priority::Default);
    let caller = thread::current().id();
    let ran_on = queue.dispatch_sync(|| thread::current().id());
    assert_eq!(caller, ran_on);
}
