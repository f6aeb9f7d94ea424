//! Structured event logging for the coordination core.
//!
//! Every observable state transition gets an event variant here, binned
//! into the five named streams a worker's [`cnc_logging::Registry`] may or
//! may not have a destination bound for. Nobody pays for events nobody is
//! listening to: logging a `StepEvent` when `"cnc/step"` has no bound
//! action is a buffer push behind an `Option` check, so logging stays
//! zero-cost when unused.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use cnc_logging::Registry;

/// Identifies a worker for every event it logs.
///
/// Here it is the owning process's pid rather than an OS-thread index: §5's
/// concurrency model runs many step instances across a shared worker pool
/// within one process, so a stream keyed by thread identity wouldn't track
/// anything meaningful across a step's suspend/resume. Every thread in a
/// process (pool workers and the environment thread alike) installs its own
/// thread-local [`Registry`], but all of them tag their events with the same
/// pid.
pub type WorkerId = usize;

/// A destination-binding closure, applied once per thread that installs a
/// registry (every pool worker, plus the environment thread). Cloned cheaply
/// via `Arc` since the same bindings apply to every thread in a process.
pub type LoggingConfig = Arc<dyn Fn(&mut Registry<WorkerId>) + Send + Sync>;

/// The default configuration: no stream is bound to a destination, so every
/// `log_*` call below is a single `Option` check away from a no-op (§10.4:
/// "Nobody pays for events nobody is listening to").
pub fn no_logging() -> LoggingConfig {
    Arc::new(|_registry: &mut Registry<WorkerId>| {})
}

thread_local! {
    static CURRENT: RefCell<Option<Registry<WorkerId>>> = const { RefCell::new(None) };
}

/// Installs a thread-local registry for the calling thread, bound per
/// `config`. Called once by the environment thread ([`crate::context::Worker::new`])
/// and once more by every scheduler worker thread it spawns, all sharing the
/// same `config` and `pid` (this process's identity).
pub fn install(pid: WorkerId, config: &LoggingConfig) {
    let mut registry = Registry::new(Instant::now(), pid);
    config(&mut registry);
    CURRENT.with(|cell| *cell.borrow_mut() = Some(registry));
}

/// Events on the `"cnc/step"` stream: step instance lifecycle transitions.
#[derive(Clone, Debug)]
pub enum StepEvent {
    /// A step instance was prepared for the first time.
    Prepared { collection: usize, tag: String },
    /// A step instance's `execute` returned success.
    Done { collection: usize, tag: String },
    /// A `get` miss suspended a step instance.
    Suspended { collection: usize, tag: String },
    /// A suspended step instance was resumed by a matching `put`.
    Resumed { collection: usize, tag: String },
    /// A step instance was routed to the sequentialized queue.
    Sequentialized { collection: usize, tag: String },
    /// A worker bypass-dispatched directly into a successor step.
    Bypassed { from_collection: usize, to_collection: usize },
}

/// Events on the `"cnc/item"` stream: item cell lifecycle.
#[derive(Clone, Debug)]
pub enum ItemEvent {
    /// A cell received its value.
    Put { collection: usize, tag: String },
    /// A cell's get-count reached zero and it was erased.
    Erased { collection: usize, tag: String },
    /// A `get` found no value and suspended the caller.
    Miss { collection: usize, tag: String },
}

/// Events on the `"cnc/comm"` stream: message send/receive.
#[derive(Clone, Debug)]
pub enum CommEvent {
    Sent { kind: &'static str, dst: usize, bytes: usize },
    Received { kind: &'static str, bytes: usize },
}

/// Events on the `"cnc/reduction"` stream: the reduction status lattice.
#[derive(Clone, Debug)]
pub enum ReductionEvent {
    Transition { out_tag: String, from: &'static str, to: &'static str },
    Finished { out_tag: String },
}

/// Events on the `"cnc/progress"` stream: quiescence round bookkeeping.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    RoundStart { iteration: u64 },
    RoundEnd { iteration: u64, quiescent: bool },
}

/// The names of the streams §10.4 specifies, for binding at registry
/// construction time.
pub mod streams {
    pub const STEP: &str = "cnc/step";
    pub const ITEM: &str = "cnc/item";
    pub const COMM: &str = "cnc/comm";
    pub const REDUCTION: &str = "cnc/reduction";
    pub const PROGRESS: &str = "cnc/progress";
}

/// Convenience accessors over a worker's registry, returning `None` for any
/// stream nobody bound a destination for.
pub struct Logging<'a> {
    registry: &'a Registry<WorkerId>,
}

impl<'a> Logging<'a> {
    pub fn new(registry: &'a Registry<WorkerId>) -> Self { Logging { registry } }

    pub fn step(&self) -> Option<cnc_logging::Logger<WorkerId, StepEvent>> {
        self.registry.get(streams::STEP)
    }
    pub fn item(&self) -> Option<cnc_logging::Logger<WorkerId, ItemEvent>> {
        self.registry.get(streams::ITEM)
    }
    pub fn comm(&self) -> Option<cnc_logging::Logger<WorkerId, CommEvent>> {
        self.registry.get(streams::COMM)
    }
    pub fn reduction(&self) -> Option<cnc_logging::Logger<WorkerId, ReductionEvent>> {
        self.registry.get(streams::REDUCTION)
    }
    pub fn progress(&self) -> Option<cnc_logging::Logger<WorkerId, ProgressEvent>> {
        self.registry.get(streams::PROGRESS)
    }
}

/// Logs a step-lifecycle event on the calling thread's registry, if one is
/// installed and `"cnc/step"` is bound.
pub fn log_step(event: StepEvent) {
    CURRENT.with(|cell| {
        if let Some(registry) = cell.borrow().as_ref() {
            if let Some(logger) = Logging::new(registry).step() {
                logger.log(event);
            }
        }
    });
}

/// Logs an item-cell lifecycle event, as [`log_step`].
pub fn log_item(event: ItemEvent) {
    CURRENT.with(|cell| {
        if let Some(registry) = cell.borrow().as_ref() {
            if let Some(logger) = Logging::new(registry).item() {
                logger.log(event);
            }
        }
    });
}

/// Logs a message send/receive event, as [`log_step`].
pub fn log_comm(event: CommEvent) {
    CURRENT.with(|cell| {
        if let Some(registry) = cell.borrow().as_ref() {
            if let Some(logger) = Logging::new(registry).comm() {
                logger.log(event);
            }
        }
    });
}

/// Logs a reduction status-lattice transition, as [`log_step`].
pub fn log_reduction(event: ReductionEvent) {
    CURRENT.with(|cell| {
        if let Some(registry) = cell.borrow().as_ref() {
            if let Some(logger) = Logging::new(registry).reduction() {
                logger.log(event);
            }
        }
    });
}

/// Logs a quiescence round-boundary event, as [`log_step`].
pub fn log_progress(event: ProgressEvent) {
    CURRENT.with(|cell| {
        if let Some(registry) = cell.borrow().as_ref() {
            if let Some(logger) = Logging::new(registry).progress() {
                logger.log(event);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn unbound_registry_makes_every_log_call_a_no_op() {
        install(0, &no_logging());
        // Would panic on a double-borrow if `log_step` ever held the
        // `RefCell` borrow across a call back into logging.
        log_step(StepEvent::Done { collection: 0, tag: "t".into() });
    }

    #[test]
    fn bound_stream_receives_logged_events() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let config: LoggingConfig = Arc::new(move |registry: &mut Registry<WorkerId>| {
            let seen3 = seen2.clone();
            registry.insert::<ItemEvent>(
                streams::ITEM,
                Box::new(move |_id, _now, events| {
                    for (_, event) in events {
                        seen3.lock().unwrap().push(format!("{event:?}"));
                    }
                }),
            );
        });
        install(0, &config);
        log_item(ItemEvent::Put { collection: 0, tag: "7".into() });
        CURRENT.with(|cell| {
            if let Some(registry) = cell.borrow().as_ref() {
                Logging::new(registry).item().unwrap().flush();
            }
        });
        assert_eq!(*seen.lock().unwrap(), vec!["Put { collection: 0, tag: \"7\" }".to_string()]);
    }
}
