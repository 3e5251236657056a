use dispatchq::source::Timer;
use dispatchq::{Group, KeyedBlockQueue, Queue, config};
use std::panic::{self, AssertUnwindSafe};

// Toggles the process-wide assertion switch: keep it the only test in this
// binary.
#[test]
fn misuse_is_logged_and_panics_only_while_assertions_are_enabled() {
    config::set_assertions_enabled(false);

    let queue = Queue::serial("assert.queue");
    queue.resume();
    assert!(!queue.is_suspended(), "an unbalanced resume leaves the count at zero");
    assert_eq!(queue.dispatch_sync(|| 1), 1, "the queue still works");

    let group = Group::new();
    group.leave();
    assert_eq!(group.outstanding(), 0);

    let keyed: KeyedBlockQueue<u8> = KeyedBlockQueue::new();
    keyed.resume();
    assert!(!keyed.is_suspended());

    let timer = Timer::new(&queue);
    timer.cancel();
    timer.set_event_handler(|| {});

    config::set_assertions_enabled(true);
    let result = panic::catch_unwind(AssertUnwindSafe(|| Group::new().leave()));
    assert_eq!(
        result.is_err(),
        cfg!(debug_assertions),
        "assertions panic in debug builds only"
    );
}
