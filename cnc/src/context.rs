//! The node (§5 "process-level transport handle"), the blocking environment
//! waiter, and the graph-construction surface (`Worker`) that ties a node, a
//! scheduler, item collections and step collections together (§6 "External
//! interfaces").
//!
//! Step instances themselves (concrete `Step` implementations, one per step
//! collection) also live here: they're small enough, and tied closely enough
//! to `StepCollection`, that a separate module would just be indirection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use cnc_communication::dispatch::{Distributable, Switchboard};
use cnc_communication::generic::Generic;

use crate::item::collection::{GetContext, ItemCollection};
use crate::logging::{self, CommEvent, LoggingConfig, StepEvent};
use crate::reduction::ReductionGraph;
use crate::scheduler::Scheduler;
use crate::step::{GetList, Step, StepOutcome, StepStatus};
use crate::tag::{Tag, Value};
use crate::tuner::{ComputeOn, DependencyConsumer, ItemTuner, StepTuner};
use crate::wire::StepMessage;

/// A process's transport handle, shared by every item collection, step
/// collection and the scheduler's quiescence protocol.
///
/// Wraps the transport's [`Switchboard`] in a single mutex so it can be
/// shared across a process's worker pool (§5). Every accessor takes the lock
/// only long enough to talk to the transport or the handler table; `poll`
/// releases it before invoking any handler (see [`Switchboard::drain`]'s doc
/// comment for why that split exists).
pub struct Node {
    pub pid: usize,
    pub peers: usize,
    comm: Mutex<Switchboard<Generic>>,
    next_id: AtomicUsize,
}

impl Node {
    /// Wraps a transport, ready for collections and the scheduler to
    /// register against.
    pub fn new(transport: Generic) -> Arc<Node> {
        let switchboard = Switchboard::new(transport);
        let pid = switchboard.index();
        let peers = switchboard.peers();
        Arc::new(Node { pid, peers, comm: Mutex::new(switchboard), next_id: AtomicUsize::new(0) })
    }

    pub fn pid(&self) -> usize { self.pid }
    pub fn peers(&self) -> usize { self.peers }

    /// Allocates a fresh dispatch id for a collection, graph, or the
    /// scheduler itself to register under.
    pub fn alloc_id(&self) -> usize { self.next_id.fetch_add(1, Ordering::SeqCst) }

    pub fn register(&self, handler: Arc<dyn Distributable>) {
        self.comm.lock().expect("switchboard mutex poisoned").register(handler);
    }

    pub fn send(&self, id: usize, dst: usize, body: &[u8]) {
        self.comm.lock().expect("switchboard mutex poisoned").send(id, dst, body);
    }

    pub fn bcast(&self, id: usize, body: &[u8]) {
        self.comm.lock().expect("switchboard mutex poisoned").bcast(id, body);
    }

    pub fn bcast_subset(&self, id: usize, body: &[u8], dsts: &[usize]) {
        self.comm.lock().expect("switchboard mutex poisoned").bcast_subset(id, body, dsts);
    }

    /// Buffers sent minus received, across every registered component.
    pub fn outstanding(&self) -> i64 {
        self.comm.lock().expect("switchboard mutex poisoned").outstanding()
    }

    /// Drains every inbound buffer and dispatches it to its registered
    /// handler, without holding `comm`'s lock across the dispatch calls
    /// (§5; see [`Switchboard::drain`]).
    pub fn poll(&self) {
        let pending = self.comm.lock().expect("switchboard mutex poisoned").drain();
        for (handler, payload) in pending {
            handler.recv(&payload);
        }
    }
}

/// A one-shot wakeup for a blocking environment `get` (§3 "Suspend group",
/// the `Environment` member).
///
/// In practice [`ItemCollection::get_blocking`] blocks via the scheduler's
/// quiescence protocol rather than waiting on this directly, so `signal` is
/// usually a no-op fan-out; it's kept as a real condvar so a future caller
/// that wants to wait on a specific tag's arrival (rather than on global
/// quiescence) has something to wait on.
pub struct EnvWaiter {
    mutex: Mutex<bool>,
    cv: Condvar,
}

impl EnvWaiter {
    pub fn new() -> Self { EnvWaiter { mutex: Mutex::new(false), cv: Condvar::new() } }

    /// Wakes whoever is blocked in [`EnvWaiter::wait`].
    pub fn signal(&self) {
        let mut done = self.mutex.lock().expect("env waiter mutex poisoned");
        *done = true;
        self.cv.notify_all();
    }

    /// Blocks until [`EnvWaiter::signal`] is called.
    pub fn wait(&self) {
        let mut done = self.mutex.lock().expect("env waiter mutex poisoned");
        while !*done {
            done = self.cv.wait(done).expect("env waiter mutex poisoned");
        }
    }
}

/// Passed explicitly to a step body instead of relying on an implicit
/// thread-local "current step" pointer (§9): carries the prescribed tag and
/// the `Arc<dyn Step>` identity `get`/`put_within` need to register
/// suspension or bypass-dispatch successors against.
pub struct StepHandle<T: Tag> {
    tag: T,
    as_step: Arc<dyn Step>,
}

impl<T: Tag> StepHandle<T> {
    pub fn tag(&self) -> &T { &self.tag }

    /// The `GetContext` to pass to an item collection's `get`/`unsafe_get`
    /// from within this step's body.
    pub fn get_context(&self) -> GetContext<'_> { GetContext::Step(&self.as_step) }

    pub fn as_step(&self) -> &Arc<dyn Step> { &self.as_step }
}

/// A tag collection bound to a step body: `put` prescribes a new step
/// instance for a tag (§3 "Lifecycle").
///
/// Registers itself with `node` for dispatch: every process in a
/// distributed run builds the identical collection (same body, same tuner,
/// SPMD-style), so a tag `compute_on` sends elsewhere only has to cross the
/// wire as itself — the remote copy of this very collection reconstructs
/// the step instance from its own body and tuner (§4.2 "prepare": "If
/// `compute_on` selects a remote pid, the step is shipped and removed
/// locally").
pub struct StepCollection<T: Tag, F, Tn: StepTuner<T>> {
    id: usize,
    node: Arc<Node>,
    scheduler: Arc<Scheduler>,
    tuner: Arc<Tn>,
    body: Arc<F>,
    round_robin: AtomicUsize,
}

impl<T, F, Tn> StepCollection<T, F, Tn>
where
    T: Tag,
    F: Fn(&StepHandle<T>) -> StepOutcome + Send + Sync + 'static,
    Tn: StepTuner<T> + 'static,
{
    pub fn new(node: Arc<Node>, scheduler: Arc<Scheduler>, tuner: Tn, body: F) -> Arc<Self> {
        let id = node.alloc_id();
        let collection = Arc::new(StepCollection {
            id,
            node: node.clone(),
            scheduler,
            tuner: Arc::new(tuner),
            body: Arc::new(body),
            round_robin: AtomicUsize::new(0),
        });
        node.register(collection.clone() as Arc<dyn Distributable>);
        collection
    }

    /// Prescribes a step instance for `tag`, from the environment.
    pub fn put(&self, tag: T) {
        self.prescribe(tag, None)
    }

    /// As [`StepCollection::put`], but called from within another step
    /// instance's body, so the scheduler can consider running the new
    /// instance as a bypass-dispatch successor instead of round-tripping
    /// through the ready queue (§4.2 "Bypass dispatch").
    pub fn put_within<U: Tag>(&self, tag: T, from: &StepHandle<U>) {
        self.prescribe(tag, Some(from.as_step()))
    }

    /// Routes a prescription through `compute_on` (§4.1 "distributed
    /// delivery protocol", generalized to steps by §4.2 "prepare"): local
    /// execution enqueues directly (with bypass-dispatch available),
    /// anything else ships the tag to the selected remote process(es)
    /// instead, removing the instance from local consideration entirely.
    fn prescribe(&self, tag: T, current: Option<&Arc<dyn Step>>) {
        if self.node.peers() == 1 {
            self.prescribe_local(tag, current);
            return;
        }

        match self.tuner.compute_on(&tag) {
            ComputeOn::Local => self.prescribe_local(tag, current),
            ComputeOn::Pid(pid) if pid == self.node.pid() => self.prescribe_local(tag, current),
            ComputeOn::Pid(pid) => self.ship(pid, tag),
            ComputeOn::RoundRobin => {
                let target = self.round_robin.fetch_add(1, Ordering::SeqCst) % self.node.peers();
                if target == self.node.pid() {
                    self.prescribe_local(tag, current);
                } else {
                    self.ship(target, tag);
                }
            }
            // §9's first open question: every process computes; ownership
            // of whatever the step puts still follows the item tuner's own
            // `consumed_on`, independent of where the step itself runs.
            ComputeOn::All => {
                for pid in 0..self.node.peers() {
                    if pid != self.node.pid() {
                        self.ship(pid, tag.clone());
                    }
                }
                self.prescribe_local(tag, current);
            }
            ComputeOn::AllOthers => {
                for pid in 0..self.node.peers() {
                    if pid != self.node.pid() {
                        self.ship(pid, tag.clone());
                    }
                }
            }
        }
    }

    /// Sends `tag` to `dst` to be prescribed there instead of here.
    fn ship(&self, dst: usize, tag: T) {
        let bytes = StepMessage::Ship { tag }.encode();
        logging::log_comm(CommEvent::Sent { kind: "SHIP", dst, bytes: bytes.len() });
        self.node.send(self.id, dst, &bytes);
    }

    fn prescribe_local(&self, tag: T, current: Option<&Arc<dyn Step>>) {
        let instance: Arc<dyn Step> = Arc::new(StepInstance {
            tag,
            collection_id: self.id,
            scheduler: self.scheduler.clone(),
            tuner: self.tuner.clone(),
            body: self.body.clone(),
            prepared: AtomicBool::new(false),
            status: Mutex::new(StepStatus::Prepared),
            suspend_count: AtomicI64::new(0),
            successor: Mutex::new(None),
            get_list: GetList::new(),
        });
        logging::log_step(StepEvent::Prepared { collection: self.id, tag: instance.tag_label() });
        self.scheduler.track_new();
        if self.scheduler.bypass_enabled() {
            if let Some(current) = current {
                current.set_successor(Some(instance));
                return;
            }
        }
        self.scheduler.enqueue(instance);
    }
}

impl<T, F, Tn> Distributable for StepCollection<T, F, Tn>
where
    T: Tag,
    F: Fn(&StepHandle<T>) -> StepOutcome + Send + Sync + 'static,
    Tn: StepTuner<T> + 'static,
{
    fn id(&self) -> usize { self.id }

    fn recv(&self, payload: &[u8]) {
        logging::log_comm(CommEvent::Received { kind: "SHIP", bytes: payload.len() });
        match StepMessage::<T>::decode(payload) {
            StepMessage::Ship { tag } => self.prescribe_local(tag, None),
        }
    }
}

/// The concrete `Step` every `StepCollection::put` instantiates.
struct StepInstance<T: Tag, F, Tn: StepTuner<T>> {
    tag: T,
    collection_id: usize,
    scheduler: Arc<Scheduler>,
    tuner: Arc<Tn>,
    body: Arc<F>,
    /// Whether `depends` has already been probed once (§4.2 "prepare" runs
    /// only on a step instance's first execution attempt; a resume after
    /// suspension re-enters execute directly).
    prepared: AtomicBool,
    status: Mutex<StepStatus>,
    suspend_count: AtomicI64,
    successor: Mutex<Option<Arc<dyn Step>>>,
    get_list: GetList,
}

impl<T, F, Tn> fmt::Debug for StepInstance<T, F, Tn>
where
    T: Tag,
    Tn: StepTuner<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepInstance({:?})", self.tag)
    }
}

impl<T, F, Tn> Step for StepInstance<T, F, Tn>
where
    T: Tag,
    F: Fn(&StepHandle<T>) -> StepOutcome + Send + Sync + 'static,
    Tn: StepTuner<T> + 'static,
{
    fn collection_id(&self) -> usize { self.collection_id }

    fn tag_label(&self) -> String { format!("{:?}", self.tag) }

    fn execute(self: Arc<Self>) -> StepOutcome {
        if !self.prepared.swap(true, Ordering::SeqCst) {
            let mut consumer = DependencyConsumer::new();
            let as_step = self.clone() as Arc<dyn Step>;
            self.tuner.depends(&self.tag, &as_step, &mut consumer);
            let results: Vec<bool> = consumer.probes.iter().map(|probe| probe.probe()).collect();
            let all_ready = results.into_iter().all(|ok| ok);
            if !all_ready {
                return StepOutcome::NeedsReplay;
            }
        }

        let handle = StepHandle { tag: self.tag.clone(), as_step: self.clone() as Arc<dyn Step> };
        let outcome = (self.body)(&handle);
        if let StepOutcome::Success = outcome {
            self.get_list.commit();
        }
        outcome
    }

    fn sequentialize(&self) -> bool { self.tuner.sequentialize(&self.tag) }

    fn was_canceled(&self) -> bool { self.tuner.was_canceled(&self.tag) }

    fn status(&self) -> StepStatus { *self.status.lock().expect("step status mutex poisoned") }

    fn set_status(&self, status: StepStatus) {
        *self.status.lock().expect("step status mutex poisoned") = status;
    }

    fn suspend_count(&self) -> &AtomicI64 { &self.suspend_count }

    fn on_dependency_ready(self: Arc<Self>) {
        if crate::step::release_suspend_count(&self.suspend_count) <= 0 {
            logging::log_step(StepEvent::Resumed { collection: self.collection_id, tag: self.tag_label() });
            self.scheduler.clone().enqueue(self);
        }
    }

    fn successor(&self) -> Option<Arc<dyn Step>> {
        self.successor.lock().expect("successor mutex poisoned").clone()
    }

    fn set_successor(&self, successor: Option<Arc<dyn Step>>) {
        *self.successor.lock().expect("successor mutex poisoned") = successor;
    }

    fn get_list(&self) -> &GetList { &self.get_list }
}

/// One process's graph-construction and execution surface (§6): builds a
/// node and scheduler, then hands out item collections, step collections
/// and reduction graphs that all share them.
pub struct Worker {
    node: Arc<Node>,
    scheduler: Arc<Scheduler>,
}

impl Worker {
    pub fn new(transport: Generic) -> Worker {
        Worker::with_pool_size_and_logging(
            transport,
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            logging::no_logging(),
        )
    }

    /// As [`Worker::new`], with an explicit worker-pool size instead of the
    /// default (available parallelism).
    pub fn with_pool_size(transport: Generic, workers: usize) -> Worker {
        Worker::with_pool_size_and_logging(transport, workers, logging::no_logging())
    }

    /// As [`Worker::new`], binding `logging_config` on every scheduler worker
    /// thread and on the calling (environment) thread itself, so events
    /// raised from environment calls (`wait`, `get_blocking`, graph
    /// construction) land in the same registry as pool-worker events
    /// (§10.4).
    pub fn new_with_logging(transport: Generic, logging_config: LoggingConfig) -> Worker {
        Worker::with_pool_size_and_logging(
            transport,
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            logging_config,
        )
    }

    /// As [`Worker::with_pool_size`], with an explicit [`LoggingConfig`].
    pub fn with_pool_size_and_logging(
        transport: Generic,
        workers: usize,
        logging_config: LoggingConfig,
    ) -> Worker {
        let node = Node::new(transport);
        let scheduler =
            Scheduler::new_with_workers_and_logging(node.clone(), workers, logging_config.clone());
        logging::install(node.pid(), &logging_config);
        Worker { node, scheduler }
    }

    pub fn pid(&self) -> usize { self.node.pid }
    pub fn peers(&self) -> usize { self.node.peers }
    pub fn node(&self) -> &Arc<Node> { &self.node }
    pub fn scheduler(&self) -> &Arc<Scheduler> { &self.scheduler }

    /// Declares an item collection (§4.1).
    pub fn item_collection<T, V, Tn>(&self, tuner: Tn) -> Arc<ItemCollection<T, V, Tn>>
    where
        T: Tag,
        V: Value,
        Tn: ItemTuner<T> + 'static,
    {
        ItemCollection::new(self.node.clone(), self.scheduler.clone(), tuner)
    }

    /// Declares a step collection bound to `body` (§3, §4.2).
    pub fn step_collection<T, F, Tn>(&self, tuner: Tn, body: F) -> Arc<StepCollection<T, F, Tn>>
    where
        T: Tag,
        F: Fn(&StepHandle<T>) -> StepOutcome + Send + Sync + 'static,
        Tn: StepTuner<T> + 'static,
    {
        StepCollection::new(self.node.clone(), self.scheduler.clone(), tuner, body)
    }

    /// Declares an asynchronous tree-reduction graph (§4.4).
    pub fn reduction_graph<O, V>(
        &self,
        identity: V,
        op: impl Fn(&V, &V) -> V + Send + Sync + 'static,
        on_finished: impl Fn(O, V) + Send + Sync + 'static,
    ) -> Arc<ReductionGraph<O, V>>
    where
        O: Tag,
        V: Value,
    {
        ReductionGraph::new(self.node.clone(), identity, op, on_finished)
    }

    /// Blocks until the whole graph (every process, if distributed) reaches
    /// quiescence (§4.3 "wait").
    pub fn wait(&self) { self.scheduler.wait() }

    /// Runs `body` once per `i` in `[first, last)` stepping by `step`,
    /// blocking until every invocation completes (§6, §10.6).
    pub fn parallel_for<FBody>(&self, first: i64, last: i64, step: i64, body: FBody)
    where
        FBody: Fn(i64) + Send + Sync + 'static,
    {
        crate::scheduler::parallel_for(&self.scheduler, first, last, step, body)
    }
}
