use dispatchq::{DispatchBuilder, DispatchError, GraphState, Queue, QueueGraph, config};
use std::time::Duration;

// Installs the process-wide configuration; no other test in this binary may
// start the runtime.
#[test]
fn builder_configures_the_runtime_once() {
    DispatchBuilder::new()
        .min_threads(2)
        .max_threads(8)
        .idle_timeout(Duration::from_secs(1))
        .queue_graph(GraphState::WithLabels)
        .install()
        .expect("nothing resolved the configuration yet");

    let installed = config::get();
    assert_eq!(installed.min_threads, 2);
    assert_eq!(installed.max_threads, 8);
    assert_eq!(QueueGraph::shared().state(), GraphState::WithLabels);

    let err = DispatchBuilder::new().install().unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyConfigured), "unexpected error: {err}");

    assert_eq!(Queue::serial("builder.check").dispatch_sync(|| 1), 1);
}

#[test]
fn graph_state_parses_the_environment_spellings() {
    assert_eq!("off".parse::<GraphState>(), Ok(GraphState::Off));
    assert_eq!("Labels".parse::<GraphState>(), Ok(GraphState::WithLabels));
    assert_eq!("3".parse::<GraphState>(), Ok(GraphState::WithBacktrace));
    assert!("verbose".parse::<GraphState>().is_err());
}
