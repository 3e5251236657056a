//! Process-wide runtime configuration.
//!
//! The configuration is resolved once, the first time any part of the
//! runtime needs it (pool start, graph creation). Until then it can be
//! installed explicitly through [`DispatchBuilder`](crate::DispatchBuilder);
//! otherwise it is read from the environment with [`DispatchConfig::from_env`].
//!
//! Recognised environment variables:
//!
//! - `DISPATCHQ_MIN_THREADS`: workers kept alive while idle
//! - `DISPATCHQ_MAX_THREADS`: upper bound for on-demand worker growth
//! - `DISPATCHQ_QUEUE_GRAPH`: `off`, `minimal`, `labels` or `backtrace`
//! - `DISPATCHQ_CHECK_CYCLES`: `1`/`true` to check the graph on every synchronous dispatch

use crate::error::{DispatchError, Result};

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static CONFIG: OnceLock<DispatchConfig> = OnceLock::new();

static ASSERTIONS_ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

/// How much bookkeeping the queue dependency graph performs.
///
/// The performance impact increases with higher states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphState {
    /// No edges are recorded. Current-queue tracking stays active.
    Off,
    /// Edges are recorded, cycle reports show node ids.
    Minimal,
    /// Cycle reports include queue labels.
    WithLabels,
    /// Every edge captures the backtrace of the synchronous call site.
    WithBacktrace,
}

impl GraphState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => GraphState::Off,
            1 => GraphState::Minimal,
            2 => GraphState::WithLabels,
            _ => GraphState::WithBacktrace,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }
}

impl FromStr for GraphState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(GraphState::Off),
            "minimal" | "1" => Ok(GraphState::Minimal),
            "labels" | "withlabels" | "2" => Ok(GraphState::WithLabels),
            "backtrace" | "withbacktrace" | "3" => Ok(GraphState::WithBacktrace),
            other => Err(format!("unknown queue graph state `{}`", other)),
        }
    }
}

/// Resolved runtime settings.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Worker threads kept alive while idle.
    pub min_threads: usize,

    /// Upper bound for worker threads. Workers are added on demand when
    /// every existing worker is busy or blocked in a synchronous wait.
    pub max_threads: usize,

    /// How long a surplus worker stays idle before it exits.
    pub idle_timeout: Duration,

    /// Initial state of the queue dependency graph.
    pub queue_graph: GraphState,

    /// Run a cycle check every time a synchronous edge is added.
    pub check_cycles_on_sync: bool,

    /// Whether programmer-error assertions panic (debug builds) or only log.
    pub assertions: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            min_threads: cores.max(2),
            max_threads: (cores * 16).max(64),
            idle_timeout: Duration::from_secs(5),
            queue_graph: if cfg!(debug_assertions) {
                GraphState::Minimal
            } else {
                GraphState::Off
            },
            check_cycles_on_sync: false,
            assertions: cfg!(debug_assertions),
        }
    }
}

impl DispatchConfig {
    /// Builds a configuration from defaults overridden by `DISPATCHQ_*`
    /// environment variables. Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("DISPATCHQ_MIN_THREADS") {
            config.min_threads = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("DISPATCHQ_MAX_THREADS") {
            config.max_threads = n.max(1);
        }
        if let Some(state) = env_parse::<GraphState>("DISPATCHQ_QUEUE_GRAPH") {
            config.queue_graph = state;
        }
        if let Ok(value) = env::var("DISPATCHQ_CHECK_CYCLES") {
            config.check_cycles_on_sync = matches!(value.trim(), "1" | "true" | "yes" | "on");
        }

        config.max_threads = config.max_threads.max(config.min_threads);
        config
    }
}

fn env_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(variable = name, value = %raw, "ignoring invalid setting: {}", err);
            None
        }
    }
}

/// Returns the process-wide configuration, resolving it from the
/// environment on first use.
pub fn get() -> &'static DispatchConfig {
    CONFIG.get_or_init(DispatchConfig::from_env)
}

// Installs `config` unless the runtime already resolved one.
pub(crate) fn install(config: DispatchConfig) -> Result<()> {
    let assertions = config.assertions;
    CONFIG
        .set(config)
        .map_err(|_| DispatchError::AlreadyConfigured)?;
    ASSERTIONS_ENABLED.store(assertions, Ordering::Relaxed);

    Ok(())
}

/// Turns panicking assertions for programmer errors on or off.
///
/// Failed assertions are always logged. Turning them off is meant for tests
/// that deliberately misuse an API, such as resuming a queue that was never
/// suspended.
pub fn set_assertions_enabled(enabled: bool) {
    ASSERTIONS_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn assertions_enabled() -> bool {
    ASSERTIONS_ENABLED.load(Ordering::Relaxed)
}
