use crate::reactor::poller::{Interest, PollEvent, Poller};
use crate::runtime::panic_message;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};
use std::thread;
use std::time::Duration;

/// Called on the reactor thread with the event data of a registration.
pub(crate) type Handler = Arc<dyn Fn(u64) + Send + Sync>;

/// Identifies a registration with the reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(u64);

struct Registration {
    interest: Interest,
    handler: Handler,
}

static REACTOR: OnceLock<Result<Reactor, (io::ErrorKind, String)>> = OnceLock::new();
static STARTED: Once = Once::new();

/// Returns the process-wide reactor, starting its thread on first use.
///
/// # Errors
/// Fails if the platform backend could not be created.
pub(crate) fn reactor() -> io::Result<&'static Reactor> {
    let reactor = REACTOR
        .get_or_init(|| Reactor::new().map_err(|err| (err.kind(), err.to_string())))
        .as_ref()
        .map_err(|(kind, message)| io::Error::new(*kind, message.clone()))?;

    STARTED.call_once(|| {
        let spawned = thread::Builder::new()
            .name("dispatchq-reactor".into())
            .spawn(move || reactor.run());
        if let Err(err) = spawned {
            tracing::error!("failed to spawn reactor thread: {}", err);
        }
    });
    Ok(reactor)
}

/// Event loop delivering OS readiness to registered handlers.
///
/// A single thread waits on the poller. Handlers run on that thread and
/// must only record the event and hand off work to a queue.
pub(crate) struct Reactor {
    poller: Poller,
    registrations: Mutex<HashMap<u64, Registration>>,
    next_token: AtomicU64,
}

impl Reactor {
    fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Registers `handler` for `interest`.
    pub(crate) fn register(&self, interest: Interest, handler: Handler) -> io::Result<Token> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        // Inserted before arming so an immediate event finds its handler.
        self.registrations.lock().insert(
            token,
            Registration {
                interest: interest.clone(),
                handler,
            },
        );
        if let Err(err) = self.poller.add(token, &interest) {
            self.registrations.lock().remove(&token);
            return Err(err);
        }

        tracing::trace!(token, ?interest, "reactor registration added");
        Ok(Token(token))
    }

    /// Removes a registration. Its handler is not called afterwards, except
    /// for an invocation already in progress.
    pub(crate) fn deregister(&self, token: Token) {
        let registration = self.registrations.lock().remove(&token.0);
        if let Some(registration) = registration {
            self.poller.remove(token.0, &registration.interest);
            tracing::trace!(token = token.0, "reactor registration removed");
        }
    }

    /// Re-enables a oneshot registration after its event was handled.
    pub(crate) fn rearm(&self, token: Token) {
        let interest = self
            .registrations
            .lock()
            .get(&token.0)
            .map(|registration| registration.interest.clone());
        if let Some(interest) = interest {
            if let Err(err) = self.poller.rearm(token.0, &interest) {
                tracing::warn!(token = token.0, "failed to rearm registration: {}", err);
            }
        }
    }

    fn run(&self) {
        tracing::debug!("reactor thread started");
        let mut events: Vec<PollEvent> = Vec::with_capacity(64);

        loop {
            events.clear();
            if let Err(err) = self.poller.wait(&mut events, None) {
                tracing::error!("reactor wait failed: {}", err);
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            for event in events.drain(..) {
                // Handlers run outside the lock; they may deregister.
                let handler = self
                    .registrations
                    .lock()
                    .get(&event.token)
                    .map(|registration| registration.handler.clone());
                let Some(handler) = handler else {
                    continue;
                };
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(event.data))) {
                    tracing::error!("event handler panicked: {}", panic_message(&*payload));
                }
            }
        }
    }
}
