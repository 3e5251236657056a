use dispatchq::{Queue, QueueGraph};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

// Leaves two workers deadlocked for the rest of the process, so it must stay
// the only test in this binary.
#[test]
fn crossed_sync_dispatches_form_a_reported_cycle() {
    let graph = QueueGraph::shared();
    let a = Queue::serial("deadlock.a");
    let b = Queue::serial("deadlock.b");
    let both_running = Arc::new(Barrier::new(2));

    {
        let b = b.clone();
        let both_running = both_running.clone();
        a.dispatch_async(move || {
            both_running.wait();
            b.dispatch_sync(|| {});
        });
    }
    {
        let a = a.clone();
        let both_running = both_running.clone();
        b.dispatch_async(move || {
            both_running.wait();
            a.dispatch_sync(|| {});
        });
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut acyclic = true;
    while Instant::now() < deadline {
        acyclic = graph.check_tree_structure(true);
        if !acyclic {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!acyclic, "A -> B and B -> A should be reported as a cycle");

    let cycles = graph.find_cycles();
    let cycle = cycles
        .iter()
        .find(|cycle| cycle.contains_label("deadlock.a"))
        .expect("the cycle should include queue A");
    assert!(cycle.contains_label("deadlock.b"), "the cycle should include queue B: {cycle}");
    assert_eq!(cycle.nodes.len(), 2);
}
