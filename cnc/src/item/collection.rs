//! The item collection's public contract and distributed coherence
//! protocol (§4.1).
//!
//! One [`ItemCollection`] owns one [`ItemTable`] plus the bookkeeping the
//! distributed GC and delivery protocols need: an erase buffer shared
//! across non-owner recipients, and a per-owner accumulator of opportunistic
//! local decrements waiting to be flushed as `GET_COUNTS`. It registers
//! itself with the node's switchboard under a collection-unique id so that
//! `put`/`get` misses and GC traffic route back here from any peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use cnc_communication::dispatch::Distributable;

use crate::context::Node;
use crate::item::cell::{GetCountState, ItemCell};
use crate::item::table::ItemTable;
use crate::logging::{self, CommEvent, ItemEvent};
use crate::scheduler::{QuiescenceHook, Scheduler};
use crate::step::{Step, SuspendGroup, SuspendMember};
use crate::tag::{Tag, Value};
use crate::tuner::{Consumer, GetCount, ItemTuner, Producer};
use crate::wire::ItemMessage;

/// Default erase-buffer flush threshold and its half-threshold broadcast
/// trigger (§4.1 "implementation threshold `G`").
pub const DEFAULT_G: usize = 100;

/// A `get`/`unsafe_get` caller, threaded explicitly rather than through a
/// thread-local "current step" pointer.
pub enum GetContext<'a> {
    /// A step instance, which registers itself in the cell's suspend group
    /// on a miss instead of blocking.
    Step(&'a Arc<dyn Step>),
    /// The blocking environment/main-thread caller.
    Environment,
}

/// The result of a non-blocking `get`/`unsafe_get` attempt.
pub enum GetOutcome<V> {
    Ready(Arc<V>),
    /// Absent; the caller has been registered in the cell's suspend group.
    NotReady,
}

/// How long [`ItemCollection::get_blocking`] and a gather poll before giving
/// up (§5 "Timeouts"; named as constants so tests can shrink them without
/// asserting on specific durations).
pub struct GatherTimeout {
    pub poll_interval: Duration,
    pub poll_cap: usize,
}

impl Default for GatherTimeout {
    fn default() -> Self {
        GatherTimeout { poll_interval: Duration::from_millis(5), poll_cap: 1000 }
    }
}

struct GcState<T> {
    /// Tags this owner has erased, pending an `ERASE` broadcast to every
    /// non-owner replica (§4.1 "Distributed GC protocol").
    erase_buffer: Vec<T>,
    /// Per-owner accumulation of locally-observed decrements not yet
    /// flushed as `GET_COUNTS` (§4.1 "Local GC algorithm", non-owner case).
    pending_decrements: HashMap<usize, Vec<T>>,
}

impl<T> GcState<T> {
    fn new() -> Self {
        GcState { erase_buffer: Vec::new(), pending_decrements: HashMap::new() }
    }
}

struct GatherState<T, V> {
    expected: usize,
    items: Vec<(T, Arc<V>)>,
}

/// Single-assignment mapping from tag to value with coordination semantics
/// (§4.1).
pub struct ItemCollection<T: Tag, V: Value, Tn: ItemTuner<T>> {
    id: usize,
    node: Arc<Node>,
    scheduler: Arc<Scheduler>,
    table: ItemTable<T, V>,
    tuner: Tn,
    gc: Mutex<GcState<T>>,
    gather: Mutex<Option<GatherState<T, V>>>,
    g: usize,
    timeout: GatherTimeout,
    self_ref: OnceLock<Weak<ItemCollection<T, V, Tn>>>,
}

impl<T: Tag, V: Value, Tn: ItemTuner<T> + 'static> ItemCollection<T, V, Tn> {
    /// Builds a collection, registers it for dispatch, and registers it as a
    /// GC-quiescence hook with `scheduler`.
    pub fn new(node: Arc<Node>, scheduler: Arc<Scheduler>, tuner: Tn) -> Arc<Self> {
        let id = node.alloc_id();
        let collection = Arc::new(ItemCollection {
            id,
            node: node.clone(),
            scheduler: scheduler.clone(),
            table: ItemTable::new(),
            tuner,
            gc: Mutex::new(GcState::new()),
            gather: Mutex::new(None),
            g: DEFAULT_G,
            timeout: GatherTimeout::default(),
            self_ref: OnceLock::new(),
        });
        let _ = collection.self_ref.set(Arc::downgrade(&collection));
        node.register(Arc::new(Handler(collection.clone())));
        scheduler.register_quiescence_hook(Arc::new(Handler(collection.clone())));
        collection
    }

    fn my_pid(&self) -> usize {
        self.node.pid
    }

    fn peers(&self) -> usize {
        self.node.peers
    }

    fn send(&self, dst: usize, msg: &ItemMessage<T, V>) {
        let bytes = msg.encode();
        logging::log_comm(CommEvent::Sent { kind: msg.kind_name(), dst, bytes: bytes.len() });
        self.node.send(self.id, dst, &bytes);
    }

    fn bcast(&self, msg: &ItemMessage<T, V>) {
        let bytes = msg.encode();
        logging::log_comm(CommEvent::Sent { kind: msg.kind_name(), dst: usize::MAX, bytes: bytes.len() });
        self.node.bcast(self.id, &bytes);
    }

    fn bcast_subset(&self, msg: &ItemMessage<T, V>, dsts: &[usize]) {
        let bytes = msg.encode();
        logging::log_comm(CommEvent::Sent { kind: msg.kind_name(), dst: usize::MAX, bytes: bytes.len() });
        self.node.bcast_subset(self.id, &bytes, dsts);
    }

    fn is_owner(&self, tag: &T) -> bool {
        self.table
            .get(tag)
            .map(|cell| cell.lock().expect("item cell mutex poisoned").props.am_owner(self.my_pid()))
            .unwrap_or(false)
    }

    /// §4.1 `put`.
    pub fn put(&self, tag: T, value: V) {
        if self.peers() == 1 {
            self.put_local(&tag, value, self.my_pid());
            return;
        }

        match self.tuner.consumed_on(&tag) {
            Consumer::Unknown | Consumer::Local => {
                self.put_local(&tag, value, self.my_pid());
            }
            Consumer::All => {
                self.bcast(&ItemMessage::Deliver { owner_pid: self.my_pid() as u32, tag: tag.clone(), value: value.clone() });
                self.put_local(&tag, value, self.my_pid());
            }
            Consumer::AllOthers => {
                let owner = (self.my_pid() + 1) % self.peers();
                let dsts: Vec<usize> = (0..self.peers()).filter(|&p| p != self.my_pid()).collect();
                self.bcast_subset(&ItemMessage::Deliver { owner_pid: owner as u32, tag: tag.clone(), value }, &dsts);
                // The producer itself never consumes; it keeps no local copy.
            }
            Consumer::Pid(dst) => {
                self.send(dst, &ItemMessage::DeliverToOwn { tag: tag.clone(), value });
            }
            Consumer::Pids(dsts) => {
                let owner = dsts[0];
                self.bcast_subset(&ItemMessage::Deliver { owner_pid: owner as u32, tag: tag.clone(), value: value.clone() }, &dsts);
                if owner == self.my_pid() {
                    self.put_local(&tag, value, owner);
                }
            }
        }
    }

    /// Stores `value` under this process's own ownership, resuming whoever
    /// was already suspended on it and serving any remote subscribers.
    fn put_local(&self, tag: &T, value: V, owner: usize) {
        let cell_arc = self.table.entry(tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");

        if cell.value.is_some() {
            eprintln!("cnc: duplicate put to tag {tag:?} on collection {}; dropping the second value", self.id);
            return;
        }

        logging::log_item(ItemEvent::Put { collection: self.id, tag: format!("{tag:?}") });

        let get_count = self.tuner.get_count(tag);
        cell.props.owner_pid = Some(owner);
        cell.props.am_creator = true;
        cell.value = Some(Arc::new(value));
        cell.props.get_count = match get_count {
            GetCount::NoGetCount => GetCountState::NoGetCount,
            GetCount::Tracked(n) => GetCountState::Value(n as i64),
        };

        let subscribers = cell.props.subscribers.take();
        if let Some(group) = cell.suspend_group.as_mut() {
            group.resume();
        }
        cell.suspend_group = None;

        // §8 boundary: a tracked get_count of zero at put time means the
        // item is never actually stored, though on-put observers (the
        // suspend-group resume above) still fire.
        let drop_after_put = matches!(cell.props.get_count, GetCountState::Value(0)) && cell.props.am_owner(self.my_pid());
        if drop_after_put {
            cell.value = None;
        }
        let value_for_subscribers = cell.value.clone();

        drop(cell);

        if let (Some(subscribers), Some(value)) = (subscribers, value_for_subscribers) {
            for subscriber in subscribers {
                self.send(subscriber, &ItemMessage::Deliver { owner_pid: owner as u32, tag: tag.clone(), value: (*value).clone() });
            }
        }

        if drop_after_put {
            self.table.remove(tag);
        }
    }

    /// §4.1 `get` from a step: returns the value, or registers the step in
    /// the cell's suspend group and reports `NotReady`.
    pub fn get(&self, tag: &T, ctx: GetContext) -> GetOutcome<V> {
        let cell_arc = self.table.entry(tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");

        if let Some(value) = cell.value.clone() {
            self.record_consumption(&mut cell, tag, &ctx);
            return GetOutcome::Ready(value);
        }

        self.register_waiter(&mut cell, ctx);
        drop(cell);
        self.request_if_needed(tag);
        logging::log_item(ItemEvent::Miss { collection: self.id, tag: format!("{tag:?}") });
        GetOutcome::NotReady
    }

    /// §4.1 `unsafe_get`: a non-suspending probe with the same bookkeeping
    /// on success; on a miss it still registers the caller to be woken.
    pub fn unsafe_get(&self, tag: &T, ctx: GetContext) -> Option<Arc<V>> {
        let cell_arc = self.table.entry(tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");

        if let Some(value) = cell.value.clone() {
            self.record_consumption(&mut cell, tag, &ctx);
            return Some(value);
        }

        self.register_waiter(&mut cell, ctx);
        drop(cell);
        self.request_if_needed(tag);
        logging::log_item(ItemEvent::Miss { collection: self.id, tag: format!("{tag:?}") });
        None
    }

    /// Records a `(collection, tag)` entry in the consuming step's
    /// `get_list` when the value carries a tracked `get_count`, so the
    /// corresponding decrement runs once, at step-commit time (§4.1 "Local
    /// GC algorithm").
    fn record_consumption(&self, cell: &mut ItemCell<V>, tag: &T, ctx: &GetContext) {
        if !matches!(cell.props.get_count, GetCountState::Value(_)) {
            return;
        }
        let GetContext::Step(step) = ctx else { return };
        let Some(collection) = self.self_ref.get().and_then(Weak::upgrade) else { return };
        let step = (*step).clone();
        let tag = tag.clone();
        step.get_list().record(move || collection.decrement_ref_count(&tag));
    }

    fn register_waiter(&self, cell: &mut ItemCell<V>, ctx: GetContext) {
        let group = cell.suspend_group.get_or_insert_with(SuspendGroup::default);
        match ctx {
            GetContext::Step(step) => {
                crate::step::bump_suspend_count(step.suspend_count());
                group.append(SuspendMember::Step(step.clone()));
            }
            GetContext::Environment => {
                let waiter = Arc::new(crate::context::EnvWaiter::new());
                group.append(SuspendMember::Environment(waiter));
            }
        }
    }

    fn request_if_needed(&self, tag: &T) {
        if self.peers() == 1 {
            return;
        }
        match self.tuner.produced_on(tag) {
            Producer::Local => {}
            Producer::Pid(dst) => self.send(dst, &ItemMessage::Request { tag: tag.clone(), requester_pid: self.my_pid() as u32 }),
            Producer::Unknown => self.bcast(&ItemMessage::Request { tag: tag.clone(), requester_pid: self.my_pid() as u32 }),
        }
    }

    /// §4.1 `get` from the environment: blocks until the value arrives or
    /// the graph reaches distributed quiescence, then probes once more
    /// before giving up with a warning (never a hard failure).
    pub fn get_blocking(&self, tag: &T) -> Option<Arc<V>> {
        if let GetOutcome::Ready(v) = self.get(tag, GetContext::Environment) {
            return Some(v);
        }

        self.scheduler.wait();

        if let Some(cell) = self.table.get(tag) {
            if let Some(value) = cell.lock().expect("item cell mutex poisoned").value.clone() {
                return Some(value);
            }
        }

        if self.peers() > 1 {
            self.bcast(&ItemMessage::Probe { tag: tag.clone(), requester_pid: self.my_pid() as u32 });
        }

        for _ in 0..self.timeout.poll_cap {
            self.node.poll();
            if let Some(cell) = self.table.get(tag) {
                if let Some(value) = cell.lock().expect("item cell mutex poisoned").value.clone() {
                    return Some(value);
                }
            }
            std::thread::sleep(self.timeout.poll_interval);
        }

        eprintln!("cnc: environment get for tag {tag:?} on collection {} returned after quiescence with no value", self.id);
        None
    }

    /// Explicit erasure, independent of get-count bookkeeping.
    pub fn erase(&self, tag: &T) {
        let is_owner = self.is_owner(tag);
        self.table.remove(tag);
        if is_owner && self.peers() > 1 {
            self.bcast(&ItemMessage::Erase { tags: vec![tag.clone()], safe_flag: 0 });
        }
    }

    /// §4.1 `size`/`empty`/iteration: triggers a gather so the caller's view
    /// includes items owned by every peer.
    pub fn size(&self) -> usize {
        self.gather_all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Collects every item this process or any peer owns (§4.1 `begin`/
    /// `end`/`size`/`empty`'s "global gather").
    pub fn gather_all(&self) -> Vec<(T, Arc<V>)> {
        let local: Vec<(T, Arc<V>)> = self
            .table
            .present_items()
            .into_iter()
            .filter(|(tag, _)| self.is_owner(tag))
            .collect();

        if self.peers() == 1 {
            return local;
        }

        *self.gather.lock().expect("gather mutex poisoned") =
            Some(GatherState { expected: self.peers() - 1, items: Vec::new() });
        self.bcast(&ItemMessage::GatherReq { sender_pid: self.my_pid() as u32 });

        for _ in 0..self.timeout.poll_cap {
            self.node.poll();
            let done = self
                .gather
                .lock()
                .expect("gather mutex poisoned")
                .as_ref()
                .map(|state| state.expected == 0)
                .unwrap_or(true);
            if done {
                break;
            }
            std::thread::sleep(self.timeout.poll_interval);
        }

        let mut result = local;
        if let Some(state) = self.gather.lock().expect("gather mutex poisoned").take() {
            result.extend(state.items);
        }
        result
    }

    /// §3 lifecycle / §7: the GC decrement issued once per `get_list` entry
    /// at step-commit time.
    pub fn decrement_ref_count(&self, tag: &T) {
        let cell_arc = self.table.entry(tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");
        let am_owner = cell.props.am_owner(self.my_pid()) || !cell.props.has_owner();

        let GetCountState::Value(n) = &mut cell.props.get_count else { return };
        *n -= 1;

        if am_owner {
            let reached_zero = *n <= 0;
            if reached_zero {
                drop(cell);
                self.table.remove(tag);
                logging::log_item(ItemEvent::Erased { collection: self.id, tag: format!("{tag:?}") });
                let mut gc = self.gc.lock().expect("gc mutex poisoned");
                gc.erase_buffer.push(tag.clone());
                if gc.erase_buffer.len() > self.g / 2 {
                    let tags = std::mem::take(&mut gc.erase_buffer);
                    drop(gc);
                    self.bcast(&ItemMessage::Erase { tags, safe_flag: 0 });
                }
            }
        } else {
            let owner = cell.props.owner_pid;
            drop(cell);
            if let Some(owner) = owner {
                let mut gc = self.gc.lock().expect("gc mutex poisoned");
                gc.pending_decrements.entry(owner).or_default().push(tag.clone());
                let total: usize = gc.pending_decrements.values().map(Vec::len).sum();
                if total > self.g {
                    self.flush_pending_decrements(&mut gc, false);
                }
            }
        }
    }

    fn flush_pending_decrements(&self, gc: &mut GcState<T>, safe: bool) {
        let pending = std::mem::take(&mut gc.pending_decrements);
        for (owner, tags) in pending {
            if tags.is_empty() {
                continue;
            }
            self.send(
                owner,
                &ItemMessage::GetCounts { sender_pid: self.my_pid() as u32, tags, safe_flag: safe as u8 },
            );
        }
    }

    /// Decodes and handles one inbound wire message (§4.1 "Message kinds").
    fn handle_message(&self, payload: &[u8]) {
        let msg = ItemMessage::<T, V>::decode(payload);
        logging::log_comm(CommEvent::Received { kind: msg.kind_name(), bytes: payload.len() });
        match msg {
            ItemMessage::Request { tag, requester_pid } => self.handle_request(tag, requester_pid as usize),
            ItemMessage::Probe { tag, requester_pid } => self.handle_probe(tag, requester_pid as usize),
            ItemMessage::Deliver { owner_pid, tag, value } => self.handle_deliver(tag, value, owner_pid as usize),
            ItemMessage::DeliverToOwn { tag, value } => self.handle_deliver(tag, value, self.my_pid()),
            ItemMessage::Unavail => {}
            ItemMessage::GatherReq { sender_pid } => self.handle_gather_req(sender_pid as usize),
            ItemMessage::GatherRes { owner_pid: _, items } => self.handle_gather_res(items),
            ItemMessage::GetCounts { tags, .. } => self.handle_get_counts(tags),
            ItemMessage::Erase { tags, .. } => {
                for tag in tags {
                    self.table.remove(&tag);
                }
            }
            ItemMessage::Reset => self.table.clear(),
        }
    }

    fn handle_request(&self, tag: T, requester_pid: usize) {
        let cell_arc = self.table.entry(&tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");
        match cell.value.clone() {
            Some(value) => {
                let owner = cell.props.owner_pid.unwrap_or(self.my_pid());
                drop(cell);
                self.send(requester_pid, &ItemMessage::Deliver { owner_pid: owner as u32, tag, value: (*value).clone() });
            }
            None => {
                cell.props.subscribers.get_or_insert_with(Vec::new).push(requester_pid);
            }
        }
    }

    fn handle_probe(&self, tag: T, requester_pid: usize) {
        let cell_arc = self.table.entry(&tag);
        let cell = cell_arc.lock().expect("item cell mutex poisoned");
        match cell.value.clone() {
            Some(value) => {
                let owner = cell.props.owner_pid.unwrap_or(self.my_pid());
                drop(cell);
                self.send(requester_pid, &ItemMessage::Deliver { owner_pid: owner as u32, tag, value: (*value).clone() });
            }
            None => {
                drop(cell);
                self.send(requester_pid, &ItemMessage::Unavail);
            }
        }
    }

    fn handle_deliver(&self, tag: T, value: V, owner_pid: usize) {
        let cell_arc = self.table.entry(&tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");
        if cell.value.is_some() {
            // Idempotent on non-owners: re-delivery can occur in distributed mode.
            return;
        }
        cell.props.owner_pid = Some(owner_pid);
        cell.props.am_creator = false;
        cell.props.get_count = match self.tuner.get_count(&tag) {
            GetCount::NoGetCount => GetCountState::NoGetCount,
            GetCount::Tracked(n) => GetCountState::Value(if owner_pid == self.my_pid() { n as i64 } else { 0 }),
        };
        cell.value = Some(Arc::new(value));
        if let Some(group) = cell.suspend_group.as_mut() {
            group.resume();
        }
        cell.suspend_group = None;
    }

    fn handle_gather_req(&self, sender_pid: usize) {
        let owned: Vec<(T, V)> = self
            .table
            .present_items()
            .into_iter()
            .filter(|(tag, _)| self.is_owner(tag))
            .map(|(tag, value)| (tag, (*value).clone()))
            .collect();
        self.send(sender_pid, &ItemMessage::GatherRes { owner_pid: self.my_pid() as u32, items: owned });
    }

    fn handle_gather_res(&self, items: Vec<(T, V)>) {
        let mut gather = self.gather.lock().expect("gather mutex poisoned");
        if let Some(state) = gather.as_mut() {
            state.items.extend(items.into_iter().map(|(tag, value)| (tag, Arc::new(value))));
            state.expected = state.expected.saturating_sub(1);
        }
    }

    fn handle_get_counts(&self, tags: Vec<T>) {
        for tag in tags {
            self.decrement_ref_count_owner_side(&tag);
        }
    }

    fn decrement_ref_count_owner_side(&self, tag: &T) {
        let cell_arc = self.table.entry(tag);
        let mut cell = cell_arc.lock().expect("item cell mutex poisoned");
        if let GetCountState::Value(n) = &mut cell.props.get_count {
            *n -= 1;
            if *n <= 0 {
                drop(cell);
                self.table.remove(tag);
                logging::log_item(ItemEvent::Erased { collection: self.id, tag: format!("{tag:?}") });
                let mut gc = self.gc.lock().expect("gc mutex poisoned");
                gc.erase_buffer.push(tag.clone());
                if gc.erase_buffer.len() > self.g / 2 {
                    let tags = std::mem::take(&mut gc.erase_buffer);
                    drop(gc);
                    self.bcast(&ItemMessage::Erase { tags, safe_flag: 0 });
                }
            }
        }
    }
}

/// A thin `Distributable`/`QuiescenceHook` wrapper so an `Arc<ItemCollection>`
/// can be registered by reference identity without the collection itself
/// needing to know about switchboard framing.
struct Handler<T: Tag, V: Value, Tn: ItemTuner<T>>(Arc<ItemCollection<T, V, Tn>>);

impl<T: Tag, V: Value, Tn: ItemTuner<T> + 'static> Distributable for Handler<T, V, Tn> {
    fn id(&self) -> usize {
        self.0.id
    }
    fn recv(&self, payload: &[u8]) {
        self.0.handle_message(payload);
    }
}

impl<T: Tag, V: Value, Tn: ItemTuner<T> + 'static> QuiescenceHook for Handler<T, V, Tn> {
    fn flush_for_quiescence(&self) {
        let collection = &self.0;
        let mut gc = collection.gc.lock().expect("gc mutex poisoned");
        collection.flush_pending_decrements(&mut gc, true);
        if !gc.erase_buffer.is_empty() {
            let tags = std::mem::take(&mut gc.erase_buffer);
            drop(gc);
            collection.bcast(&ItemMessage::Erase { tags, safe_flag: 1 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::DefaultTuner;
    use cnc_communication::generic::Generic;
    use cnc_communication::thread::Thread;

    fn single_process() -> (Arc<Node>, Arc<Scheduler>) {
        let node = Node::new(Generic::Thread(Thread::new()));
        let scheduler = Scheduler::new(node.clone());
        (node, scheduler)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (node, scheduler) = single_process();
        let collection: Arc<ItemCollection<u32, i64, DefaultTuner>> =
            ItemCollection::new(node, scheduler, DefaultTuner);
        collection.put(1, 42);
        match collection.get(&1, GetContext::Environment) {
            GetOutcome::Ready(v) => assert_eq!(*v, 42),
            GetOutcome::NotReady => panic!("expected the value to be ready"),
        }
    }

    #[test]
    fn get_before_put_returns_not_ready() {
        let (node, scheduler) = single_process();
        let collection: Arc<ItemCollection<u32, i64, DefaultTuner>> =
            ItemCollection::new(node, scheduler, DefaultTuner);
        match collection.get(&7, GetContext::Environment) {
            GetOutcome::NotReady => {}
            GetOutcome::Ready(_) => panic!("nothing has been put yet"),
        }
    }

    #[test]
    fn duplicate_put_on_owner_drops_second_value() {
        let (node, scheduler) = single_process();
        let collection: Arc<ItemCollection<u32, i64, DefaultTuner>> =
            ItemCollection::new(node, scheduler, DefaultTuner);
        collection.put(1, 1);
        collection.put(1, 2);
        match collection.get(&1, GetContext::Environment) {
            GetOutcome::Ready(v) => assert_eq!(*v, 1, "the first value wins"),
            GetOutcome::NotReady => panic!("expected a value"),
        }
    }

    #[test]
    fn zero_get_count_put_is_not_retained() {
        let (node, scheduler) = single_process();
        struct ZeroTuner;
        impl ItemTuner<u32> for ZeroTuner {
            fn get_count(&self, _tag: &u32) -> GetCount {
                GetCount::Tracked(0)
            }
        }
        let collection: Arc<ItemCollection<u32, i64, ZeroTuner>> = ItemCollection::new(node, scheduler, ZeroTuner);
        collection.put(1, 9);
        assert!(collection.table.get(&1).is_none() || collection.table.get(&1).unwrap().lock().unwrap().value.is_none());
    }

    /// Two real `Process` transports wired together, so `put`/`get` on one
    /// side round-trip actual `REQUEST`/`DELIVER` wire messages through the
    /// other's `handle_message`, rather than exercising the single-process
    /// shortcut the tests above take.
    fn two_processes() -> ((Arc<Node>, Arc<Scheduler>), (Arc<Node>, Arc<Scheduler>)) {
        use cnc_communication::process::Process;
        let mut procs = Process::new_vector(2).into_iter();
        let node0 = Node::new(Generic::Process(procs.next().unwrap()));
        let node1 = Node::new(Generic::Process(procs.next().unwrap()));
        let sched0 = Scheduler::new(node0.clone());
        let sched1 = Scheduler::new(node1.clone());
        ((node0, sched0), (node1, sched1))
    }

    #[test]
    fn remote_get_triggers_request_and_deliver_round_trip() {
        let ((node0, sched0), (node1, sched1)) = two_processes();
        let owner: Arc<ItemCollection<u32, i64, DefaultTuner>> =
            ItemCollection::new(node0.clone(), sched0, DefaultTuner);
        let remote: Arc<ItemCollection<u32, i64, DefaultTuner>> =
            ItemCollection::new(node1.clone(), sched1, DefaultTuner);

        owner.put(1, 99);
        match remote.get(&1, GetContext::Environment) {
            GetOutcome::NotReady => {}
            GetOutcome::Ready(_) => panic!("the remote side has nothing delivered yet"),
        }

        node0.poll(); // owner: deliver REQUEST -> sends DELIVER back
        node1.poll(); // remote: deliver DELIVER -> populates the cell

        match remote.get(&1, GetContext::Environment) {
            GetOutcome::Ready(v) => assert_eq!(*v, 99),
            GetOutcome::NotReady => panic!("expected the REQUEST/DELIVER round trip to have landed the value"),
        }
    }

    /// A tracked get-count flows through `DELIVER_TO_OWN`, a non-owner
    /// decrement, `GET_COUNTS`, and the owner-side erase it triggers.
    #[test]
    fn remote_decrement_erases_owner_after_get_counts_round_trip() {
        struct TrackedTuner;
        impl ItemTuner<u32> for TrackedTuner {
            fn get_count(&self, _tag: &u32) -> GetCount {
                GetCount::Tracked(1)
            }
            fn consumed_on(&self, _tag: &u32) -> Consumer {
                Consumer::Pid(1)
            }
        }

        let ((node0, sched0), (node1, sched1)) = two_processes();
        let producer: Arc<ItemCollection<u32, i64, TrackedTuner>> =
            ItemCollection::new(node0.clone(), sched0, TrackedTuner);
        let owner: Arc<ItemCollection<u32, i64, TrackedTuner>> =
            ItemCollection::new(node1.clone(), sched1, TrackedTuner);

        producer.put(1, 7); // Consumer::Pid(1) sends DELIVER_TO_OWN to process 1
        node1.poll(); // process 1 becomes owner, get_count = Tracked(1)

        match owner.get(&1, GetContext::Environment) {
            GetOutcome::Ready(v) => assert_eq!(*v, 7),
            GetOutcome::NotReady => panic!("DELIVER_TO_OWN should have landed the value"),
        }
        assert!(owner.is_owner(&1));

        // Simulate a non-owner replica's decrement reaching zero and the
        // quiescence flush that turns it into a GET_COUNTS message. Process 0
        // never actually received a copy here; drive the protocol directly.
        {
            let mut gc = producer.gc.lock().unwrap();
            gc.pending_decrements.entry(1).or_default().push(1u32);
            producer.flush_pending_decrements(&mut gc, true);
        }
        node1.poll(); // owner: deliver GET_COUNTS -> decrements to zero -> erases

        assert!(owner.table.get(&1).is_none(), "owner-side get_count reaching zero should erase the cell");
    }
}
