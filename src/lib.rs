//! Queue-based concurrency with deadlock detection.
//!
//! This crate runs closures on dispatch queues backed by a shared thread
//! pool, and turns OS events into closures on those queues. Synchronous
//! waits between queues are tracked in a process-wide dependency graph so
//! deadlocks show up as reported cycles instead of silent hangs.
//!
//! # Architecture
//!
//! - **Queue**: serial, concurrent, main and global queues with async, sync,
//!   dynamic, delayed and grouped dispatch
//! - **QueueGraph**: wait edges between queues, semaphores and groups, with
//!   cycle detection
//! - **Event sources**: timers, file, path, signal, process, memory pressure
//!   and readable descriptor observers, each delivering to a queue
//! - **I/O channels**: background reads and writes on files and streams,
//!   with water marks and chunked copies
//! - **Group / Semaphore / KeyedBlockQueue**: synchronisation primitives that
//!   take part in deadlock detection
//! - **DispatchBuilder**: fluent configuration of the worker pool and graph
//!
//! The pool and the timer, reactor and main-queue threads start lazily on
//! first use.

#[macro_use]
mod macros;

mod builder;
pub mod config;
mod error;
mod graph;
pub mod io;
mod object;
mod queue;
mod reactor;
mod runtime;
pub mod source;
mod sync;
pub mod time;

pub use builder::DispatchBuilder;
pub use config::{DispatchConfig, GraphState};
pub use error::{ChannelError, DispatchError, Result};
pub use graph::{Cycle, CycleNode, NodeId, NodeKind, QueueGraph};
pub use queue::{ConcurrentQueue, DispatchKind, Priority, Queue, QueueKind, is_main_thread};
pub use runtime::{current_queue, dump_current_queues};
pub use sync::{Group, KeyedBlockQueue, Semaphore};
pub use time::{Clock, Deadline};
