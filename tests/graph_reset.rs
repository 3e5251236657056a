use dispatchq::{Queue, QueueGraph};

// Resets the process-wide graph: keep it the only test in this binary.

#[test]
fn reset_drops_edges_and_ignores_older_guards() {
    let graph = QueueGraph::shared();
    let a = Queue::serial("graph.reset.a");
    let b = Queue::serial("graph.reset.b");
    let (a_id, b_id) = (a.id(), b.id());

    let inner = b.clone();
    let (during, after_reset) = a.dispatch_sync(move || {
        inner.dispatch_sync(|| {
            let during = graph.edge_count(a_id, b_id);
            graph.reset();
            (during, graph.edge_count(a_id, b_id))
        })
    });

    assert_eq!(during, 1);
    assert_eq!(after_reset, 0, "reset clears the edge");
    assert_eq!(graph.edge_count(a_id, b_id), 0, "the stale guard must not underflow the count");

    let inner = b.clone();
    let again = a.dispatch_sync(move || inner.dispatch_sync(|| graph.edge_count(a_id, b_id)));
    assert_eq!(again, 1, "edges recorded after a reset work normally");
}
