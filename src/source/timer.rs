use crate::queue::Queue;
use crate::source::{Backend, EventSource, Merge, SourceCore};
use crate::time::{self, Clock, Deadline, TimerId};

use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Default)]
struct Schedule {
    id: Option<TimerId>,
    next: Option<Deadline>,
    interval: Option<Duration>,
}

struct TimerBackend {
    schedule: Arc<Mutex<Schedule>>,
}

impl Backend for TimerBackend {
    fn deactivate(&self) {
        let id = self.schedule.lock().id.take();
        if let Some(id) = id {
            time::driver().cancel(id);
        }
    }
}

/// A timer source. Its data is the number of times the timer fired since the
/// last delivery, including intervals missed while delivery was held back.
///
/// # Example
/// ```ignore
/// let timer = Timer::single_shot(Duration::from_millis(50), Clock::Monotonic, &queue);
/// timer.set_event_handler(|| println!("fired"));
/// timer.enable();
/// ```
#[derive(Clone)]
pub struct Timer {
    source: EventSource,
    schedule: Arc<Mutex<Schedule>>,
}

impl Timer {
    /// Creates an unscheduled timer delivering to `queue`.
    pub fn new(queue: &Queue) -> Self {
        let core = SourceCore::new("timer", queue, Merge::Add);
        let schedule = Arc::new(Mutex::new(Schedule::default()));
        core.set_backend(Box::new(TimerBackend {
            schedule: schedule.clone(),
        }));

        Self {
            source: EventSource::new(core),
            schedule,
        }
    }

    /// Creates a timer firing every `interval`, first after one interval.
    pub fn repeating(interval: Duration, leeway: Duration, clock: Clock, queue: &Queue) -> Self {
        let timer = Self::new(queue);
        timer.set_timer(Deadline::after(interval, clock), Some(interval), leeway);
        timer
    }

    /// Creates a timer firing once after `delay`.
    pub fn single_shot(delay: Duration, clock: Clock, queue: &Queue) -> Self {
        let timer = Self::new(queue);
        timer.set_timer(Deadline::after(delay, clock), None, Duration::ZERO);
        timer
    }

    /// (Re)schedules the timer: first fire at `start`, then every `interval`
    /// if given. `leeway` lets the timer fire late by that much, so that
    /// timers due around the same time fire together.
    pub fn set_timer(&self, start: Deadline, interval: Option<Duration>, leeway: Duration) {
        if self.source.is_cancelled() {
            return;
        }

        let interval = interval.filter(|interval| !interval.is_zero());
        let mut schedule = self.schedule.lock();
        schedule.next = Some(start);
        schedule.interval = interval;

        if let Some(id) = schedule.id {
            if time::driver().reschedule(id, start, leeway) {
                return;
            }
        }

        let weak_core = Arc::downgrade(&self.source.core);
        let weak_schedule = Arc::downgrade(&self.schedule);
        let id = time::driver().register(
            start,
            leeway,
            Box::new(move |_| fire(&weak_core, &weak_schedule)),
        );
        schedule.id = Some(id);
    }

    /// Reschedules the timer to fire once after `delay`.
    pub fn set_fire(&self, delay: Duration, clock: Clock) {
        self.set_timer(Deadline::after(delay, clock), None, Duration::ZERO);
    }

    /// Fires counted by the current delivery.
    pub fn fire_count(&self) -> u64 {
        self.source.data()
    }

    pub fn interval(&self) -> Option<Duration> {
        self.schedule.lock().interval
    }
}

// Runs on the timer thread when the timer is due.
fn fire(core: &Weak<SourceCore>, schedule: &Weak<Mutex<Schedule>>) -> Option<Deadline> {
    let core = core.upgrade()?;
    let schedule = schedule.upgrade()?;

    let (fires, next) = {
        let mut schedule = schedule.lock();
        let due = schedule.next?;
        match schedule.interval {
            Some(interval) => {
                let missed = (due.overdue().as_nanos() / interval.as_nanos()) as u32;
                let next = due.offset(interval * (missed + 1));
                schedule.next = Some(next);
                (u64::from(missed) + 1, Some(next))
            }
            None => {
                schedule.next = None;
                schedule.id = None;
                (1, None)
            }
        }
    };

    core.merge_data(fires);
    next
}

impl Deref for Timer {
    type Target = EventSource;

    fn deref(&self) -> &EventSource {
        &self.source
    }
}
