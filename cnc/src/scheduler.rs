//! The ready-queue worker pool, sequentialization, bypass dispatch, and the
//! distributed quiescence (`wait`) protocol (§4.2, §4.3).
//!
//! This core's concurrency model (§5) runs many step instances, potentially
//! far more than there are threads, across a shared pool within one process,
//! so a ready-queue scheduler multiplexes them onto a fixed worker-thread
//! pool rather than dedicating one thread per instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use cnc_communication::dispatch::Distributable;

use crate::context::Node;
use crate::logging::{self, LoggingConfig, ProgressEvent, StepEvent};
use crate::step::{GetList, Step, StepOutcome, StepStatus};
use crate::wire::SchedulerMessage;

/// Ceiling on `wait`'s round count before it gives up rather than spin
/// forever on a protocol that never converges.
pub const QUIESCENCE_ITERATION_CAP: usize = 99_999;
/// Backoff between local-quiescence polls, shared by `wait` and the
/// environment-`get` poll loop in [`crate::item::collection::ItemCollection`].
pub const ENV_GET_POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Poll attempts per round before a `wait` round is abandoned and retried.
pub const ENV_GET_POLL_CAP: usize = 1000;

/// A component that needs a chance to flush pending work before the
/// scheduler declares quiescence (§4.1's GC flush on the `safe_flag`
/// boundary is the only current user).
pub trait QuiescenceHook: Send + Sync {
    fn flush_for_quiescence(&self);
}

/// Runs a ready queue of step instances across a worker-thread pool, with
/// sequentialization, bypass dispatch and distributed quiescence.
pub struct Scheduler {
    node: Arc<Node>,
    dist_id: usize,
    ready: Mutex<VecDeque<Arc<dyn Step>>>,
    ready_cv: Condvar,
    sequentialized: Mutex<Vec<Arc<dyn Step>>>,
    quiescence_hooks: Mutex<Vec<Arc<dyn QuiescenceHook>>>,
    outstanding_steps: AtomicI64,
    shutdown: AtomicBool,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    bypass: bool,
    ping_seen: AtomicBool,
    pong_count: AtomicUsize,
    done_flag: AtomicBool,
    logging_config: LoggingConfig,
}

impl Scheduler {
    /// Builds a scheduler with a worker pool sized to available parallelism
    /// and registers it with `node` for the quiescence protocol's wire
    /// traffic.
    pub fn new(node: Arc<Node>) -> Arc<Scheduler> {
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Scheduler::new_with_workers(node, workers)
    }

    pub fn new_with_workers(node: Arc<Node>, worker_count: usize) -> Arc<Scheduler> {
        Scheduler::new_with_workers_and_logging(node, worker_count, logging::no_logging())
    }

    /// As [`Scheduler::new_with_workers`], but binds every pool worker
    /// thread's logging registry with `logging_config` instead of the
    /// no-op default.
    pub fn new_with_workers_and_logging(
        node: Arc<Node>,
        worker_count: usize,
        logging_config: LoggingConfig,
    ) -> Arc<Scheduler> {
        let dist_id = node.alloc_id();
        let bypass = std::env::var("CNC_SCHEDULER_BYPASS").map(|v| v == "1").unwrap_or(false);
        let scheduler = Arc::new(Scheduler {
            node: node.clone(),
            dist_id,
            ready: Mutex::new(VecDeque::new()),
            ready_cv: Condvar::new(),
            sequentialized: Mutex::new(Vec::new()),
            quiescence_hooks: Mutex::new(Vec::new()),
            outstanding_steps: AtomicI64::new(0),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            bypass,
            ping_seen: AtomicBool::new(false),
            pong_count: AtomicUsize::new(0),
            done_flag: AtomicBool::new(false),
            logging_config,
        });
        node.register(scheduler.clone() as Arc<dyn Distributable>);

        let mut handles = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let scheduler = scheduler.clone();
            handles.push(thread::spawn(move || worker_loop(scheduler)));
        }
        *scheduler.workers.lock().expect("workers mutex poisoned") = handles;
        scheduler
    }

    /// This scheduler's logging configuration, so the environment thread can
    /// install a matching registry for itself (§10.4; see
    /// [`crate::context::Worker::new_with_logging`]).
    pub fn logging_config(&self) -> &LoggingConfig { &self.logging_config }

    pub fn bypass_enabled(&self) -> bool { self.bypass }

    pub fn register_quiescence_hook(&self, hook: Arc<dyn QuiescenceHook>) {
        self.quiescence_hooks.lock().expect("quiescence hooks mutex poisoned").push(hook);
    }

    fn flush_quiescence_hooks(&self) {
        for hook in self.quiescence_hooks.lock().expect("quiescence hooks mutex poisoned").iter() {
            hook.flush_for_quiescence();
        }
    }

    /// Accounts for one new step instance that hasn't reached `Done` yet.
    /// Called once per instance, at creation ([`crate::context::StepCollection::put`]
    /// and [`parallel_for`]), never again on re-enqueue.
    pub fn track_new(&self) {
        self.outstanding_steps.fetch_add(1, Ordering::SeqCst);
    }

    /// Places `step` on the ready queue.
    pub fn enqueue(&self, step: Arc<dyn Step>) {
        step.set_status(StepStatus::Prepared);
        self.ready.lock().expect("ready queue mutex poisoned").push_back(step);
        self.ready_cv.notify_one();
    }

    fn next_ready(&self) -> Option<Arc<dyn Step>> {
        let mut guard = self.ready.lock().expect("ready queue mutex poisoned");
        loop {
            if let Some(step) = guard.pop_front() {
                return Some(step);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            let (g, _timed_out) =
                self.ready_cv.wait_timeout(guard, Duration::from_millis(50)).expect("ready queue mutex poisoned");
            guard = g;
        }
    }

    fn pop_sequentialized(&self) -> Option<Arc<dyn Step>> {
        let mut list = self.sequentialized.lock().expect("sequentialized list mutex poisoned");
        if list.is_empty() { None } else { Some(list.remove(0)) }
    }

    fn push_sequentialized(&self, step: Arc<dyn Step>) {
        self.sequentialized.lock().expect("sequentialized list mutex poisoned").push(step);
    }

    /// Runs `current` to its next suspension point, following bypass
    /// successors in place when enabled (§4.2 "Bypass dispatch"), as an
    /// explicit loop rather than recursion so a cycle (a step that
    /// designates itself as its own successor) can't blow the stack — it
    /// just spins the loop, which the status check below breaks by moving
    /// the step straight to `Done`.
    fn run_to_completion(&self, mut current: Arc<dyn Step>) {
        loop {
            if current.was_canceled() {
                current.set_status(StepStatus::Done);
                self.outstanding_steps.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            if current.sequentialize() && current.status() != StepStatus::Sequentialized {
                current.set_status(StepStatus::Sequentialized);
                logging::log_step(StepEvent::Sequentialized {
                    collection: current.collection_id(),
                    tag: current.tag_label(),
                });
                self.push_sequentialized(current);
                return;
            }

            match current.clone().execute() {
                StepOutcome::Success => {
                    current.set_status(StepStatus::Done);
                    self.outstanding_steps.fetch_sub(1, Ordering::SeqCst);
                    logging::log_step(StepEvent::Done {
                        collection: current.collection_id(),
                        tag: current.tag_label(),
                    });
                    match current.successor() {
                        Some(next) if self.bypass && !Arc::ptr_eq(&next, &current) => {
                            logging::log_step(StepEvent::Bypassed {
                                from_collection: current.collection_id(),
                                to_collection: next.collection_id(),
                            });
                            current = next;
                        }
                        Some(next) => {
                            self.enqueue(next);
                            return;
                        }
                        None => return,
                    }
                }
                StepOutcome::NeedsReplay => {
                    current.set_status(StepStatus::Suspended);
                    logging::log_step(StepEvent::Suspended {
                        collection: current.collection_id(),
                        tag: current.tag_label(),
                    });
                    return;
                }
                StepOutcome::NeedsSequentialize => {
                    current.set_status(StepStatus::Sequentialized);
                    logging::log_step(StepEvent::Sequentialized {
                        collection: current.collection_id(),
                        tag: current.tag_label(),
                    });
                    self.push_sequentialized(current);
                    return;
                }
            }
        }
    }

    fn quiescent_locally(&self) -> bool {
        self.ready.lock().expect("ready queue mutex poisoned").is_empty()
            && self.sequentialized.lock().expect("sequentialized list mutex poisoned").is_empty()
            && self.outstanding_steps.load(Ordering::SeqCst) == 0
            && self.node.outstanding() == 0
    }

    /// Polls the node and drains the sequentialized queue (run one at a
    /// time, on this thread, per §4.2) until the local graph is quiescent.
    fn drain_local(&self) {
        loop {
            self.node.poll();
            if let Some(step) = self.pop_sequentialized() {
                self.run_to_completion(step);
                continue;
            }
            if self.quiescent_locally() {
                return;
            }
            thread::sleep(ENV_GET_POLL_INTERVAL);
        }
    }

    /// Blocks until the whole graph reaches quiescence (§4.3). A single
    /// process (`peers() == 1`) never needs the PING/PONG/DONE barrier.
    /// Distributed, process 0 drives each round: ping every peer, collect
    /// pongs, and if nothing new appeared locally meanwhile, declare done.
    /// Peers reply to a ping with a pong and wait for either `done` or new
    /// local work, restarting the whole round if the latter happens first.
    /// Process 0 is the only legal quiescence root; a non-zero root is not
    /// supported.
    pub fn wait(&self) {
        for iteration in 0..QUIESCENCE_ITERATION_CAP {
            logging::log_progress(ProgressEvent::RoundStart { iteration: iteration as u64 });
            self.drain_local();
            self.flush_quiescence_hooks();

            if self.node.peers() == 1 {
                logging::log_progress(ProgressEvent::RoundEnd { iteration: iteration as u64, quiescent: true });
                return;
            }

            let converged = if self.node.pid() == 0 { self.root_round() } else { self.peer_round() };
            logging::log_progress(ProgressEvent::RoundEnd { iteration: iteration as u64, quiescent: converged });
            if converged {
                return;
            }
        }
        panic!("cnc: quiescence protocol failed to converge within {QUIESCENCE_ITERATION_CAP} rounds");
    }

    fn root_round(&self) -> bool {
        self.pong_count.store(0, Ordering::SeqCst);
        self.node.bcast(self.dist_id, &SchedulerMessage::Ping { root_pid: 0 }.encode());

        let needed = self.node.peers() - 1;
        for _ in 0..ENV_GET_POLL_CAP {
            self.node.poll();
            if self.pong_count.load(Ordering::SeqCst) >= needed {
                return if self.quiescent_locally() {
                    self.flush_quiescence_hooks();
                    self.node.bcast(self.dist_id, &SchedulerMessage::Done.encode());
                    true
                } else {
                    false
                };
            }
            thread::sleep(ENV_GET_POLL_INTERVAL);
        }
        false
    }

    fn peer_round(&self) -> bool {
        for _ in 0..ENV_GET_POLL_CAP {
            self.node.poll();
            if self.ping_seen.swap(false, Ordering::SeqCst) {
                self.node.send(0, self.dist_id, &SchedulerMessage::Pong.encode());
                break;
            }
            if !self.quiescent_locally() {
                return false;
            }
            thread::sleep(ENV_GET_POLL_INTERVAL);
        }

        for _ in 0..ENV_GET_POLL_CAP {
            self.node.poll();
            if self.done_flag.swap(false, Ordering::SeqCst) {
                return true;
            }
            if !self.quiescent_locally() {
                return false;
            }
            thread::sleep(ENV_GET_POLL_INTERVAL);
        }
        false
    }
}

impl Distributable for Scheduler {
    fn id(&self) -> usize { self.dist_id }

    fn recv(&self, payload: &[u8]) {
        match SchedulerMessage::decode(payload) {
            SchedulerMessage::Ping { .. } => {
                self.ping_seen.store(true, Ordering::SeqCst);
            }
            SchedulerMessage::Pong => {
                self.pong_count.fetch_add(1, Ordering::SeqCst);
            }
            SchedulerMessage::Done => {
                self.done_flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.ready_cv.notify_all();
        for handle in std::mem::take(&mut *self.workers.lock().expect("workers mutex poisoned")) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(scheduler: Arc<Scheduler>) {
    logging::install(scheduler.node.pid(), &scheduler.logging_config);
    loop {
        match scheduler.next_ready() {
            Some(step) => scheduler.run_to_completion(step),
            None => return,
        }
    }
}

/// Runs `body(i)` once per `i` in `[first, last)` stepping by `step`,
/// blocking until every invocation completes. Each invocation is itself a
/// step instance submitted to `scheduler`'s ready queue (§6, §10.6): there's
/// no separate "parallel for" execution path, it just generates a batch of
/// synthetic steps and waits on a private completion counter rather than on
/// global quiescence.
pub fn parallel_for<F>(scheduler: &Arc<Scheduler>, first: i64, last: i64, step: i64, body: F)
where
    F: Fn(i64) + Send + Sync + 'static,
{
    assert!(step > 0, "parallel_for step must be positive");
    if first >= last {
        return;
    }

    let body = Arc::new(body);
    let count = ((last - first - 1) / step + 1).max(0) as i64;
    let remaining = Arc::new((Mutex::new(count), Condvar::new()));

    let mut i = first;
    while i < last {
        let task: Arc<dyn Step> = Arc::new(ParallelForStep {
            i,
            body: body.clone(),
            remaining: remaining.clone(),
            successor: Mutex::new(None),
            status: Mutex::new(StepStatus::Prepared),
            suspend_count: AtomicI64::new(0),
            get_list: GetList::new(),
        });
        scheduler.track_new();
        scheduler.enqueue(task);
        i += step;
    }

    let (lock, cv) = &*remaining;
    let mut left = lock.lock().expect("parallel_for counter mutex poisoned");
    while *left > 0 {
        left = cv.wait(left).expect("parallel_for counter mutex poisoned");
    }
}

struct ParallelForStep<F> {
    i: i64,
    body: Arc<F>,
    remaining: Arc<(Mutex<i64>, Condvar)>,
    successor: Mutex<Option<Arc<dyn Step>>>,
    status: Mutex<StepStatus>,
    suspend_count: AtomicI64,
    get_list: GetList,
}

impl<F: Fn(i64) + Send + Sync + 'static> Step for ParallelForStep<F> {
    fn collection_id(&self) -> usize { 0 }

    fn tag_label(&self) -> String { format!("parallel_for({})", self.i) }

    fn execute(self: Arc<Self>) -> StepOutcome {
        (self.body)(self.i);
        let (lock, cv) = &*self.remaining;
        let mut left = lock.lock().expect("parallel_for counter mutex poisoned");
        *left -= 1;
        if *left == 0 {
            cv.notify_all();
        }
        StepOutcome::Success
    }

    fn sequentialize(&self) -> bool { false }
    fn was_canceled(&self) -> bool { false }
    fn status(&self) -> StepStatus { *self.status.lock().expect("step status mutex poisoned") }
    fn set_status(&self, status: StepStatus) { *self.status.lock().expect("step status mutex poisoned") = status; }
    fn suspend_count(&self) -> &AtomicI64 { &self.suspend_count }
    fn on_dependency_ready(self: Arc<Self>) { /* parallel_for bodies never suspend */ }
    fn successor(&self) -> Option<Arc<dyn Step>> { self.successor.lock().expect("successor mutex poisoned").clone() }
    fn set_successor(&self, successor: Option<Arc<dyn Step>>) {
        *self.successor.lock().expect("successor mutex poisoned") = successor;
    }
    fn get_list(&self) -> &GetList { &self.get_list }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnc_communication::generic::Generic;
    use cnc_communication::thread::Thread;
    use std::sync::atomic::AtomicI32;

    fn single_process_scheduler() -> Arc<Scheduler> {
        let node = Node::new(Generic::Thread(Thread::new()));
        Scheduler::new_with_workers(node, 2)
    }

    #[test]
    fn parallel_for_runs_every_index_exactly_once() {
        let scheduler = single_process_scheduler();
        let sum = Arc::new(AtomicI32::new(0));
        let sum2 = sum.clone();
        parallel_for(&scheduler, 0, 10, 1, move |i| {
            sum2.fetch_add(i as i32, Ordering::SeqCst);
        });
        assert_eq!(sum.load(Ordering::SeqCst), 45);
    }

    #[test]
    fn wait_returns_immediately_with_no_outstanding_work() {
        let scheduler = single_process_scheduler();
        scheduler.wait();
    }
}
