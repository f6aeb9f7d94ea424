//! Asynchronous tree-shaped reduction (§4.4): a fan-in that combines values
//! contributed under an output tag across every process, without a global
//! barrier for every contribution — only the final value triggers a wakeup.
//!
//! Follows the `DISTRED` protocol's shape: a count is broadcast down a
//! binary tree rooted at whichever process declares it,
//! leaves reply with their local contribution count, internal nodes fold
//! replies up until the root can compare the total against the declared
//! count, then a `DONE` broadcast triggers the mirror-image value fan-in.
//! The tree here is rooted at an arbitrary process (whoever calls
//! `set_count`) rather than always at process 0.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cnc_communication::dispatch::Distributable;

use crate::context::Node;
use crate::logging::{self, CommEvent, ReductionEvent};
use crate::tag::{Tag, Value};
use crate::wire::ReduceMessage;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Status {
    Local,
    CntAvailable,
    BcastDone,
    Done,
}

impl Status {
    fn name(self) -> &'static str {
        match self {
            Status::Local => "Local",
            Status::CntAvailable => "CntAvailable",
            Status::BcastDone => "BcastDone",
            Status::Done => "Done",
        }
    }
}

struct ReductionState<V> {
    status: Status,
    partial: V,
    n_reduced: i64,
    n_expected: Option<i64>,
    owner_pid: Option<usize>,
    counts_pending: usize,
    counts_total: i64,
    values_pending: usize,
}

impl<V: Clone> ReductionState<V> {
    fn new(identity: V) -> Self {
        ReductionState {
            status: Status::Local,
            partial: identity,
            n_reduced: 0,
            n_expected: None,
            owner_pid: None,
            counts_pending: 0,
            counts_total: 0,
            values_pending: 0,
        }
    }
}

/// Returns the shifted (root-relative) position of `p` in a tree of `n`
/// processes rooted at `r`.
fn shifted(p: usize, r: usize, n: usize) -> usize { (p + n - r) % n }

fn unshift(s: usize, r: usize, n: usize) -> usize { (s + r) % n }

/// The tree parent of process `p` in a tree of `n` processes rooted at `r`,
/// or `None` if `p == r` (§4.4 "tree-parent formula generalized to an
/// arbitrary root").
pub fn tree_parent(p: usize, r: usize, n: usize) -> Option<usize> {
    let s = shifted(p, r, n);
    if s == 0 { None } else { Some(unshift((s - 1) / 2, r, n)) }
}

/// The (zero, one or two) tree children of process `p` in a tree of `n`
/// processes rooted at `r`.
pub fn tree_children(p: usize, r: usize, n: usize) -> Vec<usize> {
    let s = shifted(p, r, n);
    let mut children = Vec::with_capacity(2);
    let c1 = 2 * s + 1;
    if c1 < n {
        children.push(unshift(c1, r, n));
    }
    let c2 = 2 * s + 2;
    if c2 < n {
        children.push(unshift(c2, r, n));
    }
    children
}

/// A tree-shaped asynchronous reduction over values contributed under an
/// output tag (§4.4).
///
/// `contribute` folds a value in under `O`; `set_count` declares how many
/// contributions to expect network-wide and makes this process the root of
/// the fan-in tree; `flush` forces completion using whatever has been
/// contributed so far, for output tags whose final count is never known in
/// advance.
pub struct ReductionGraph<O: Tag, V: Value> {
    id: usize,
    node: Arc<Node>,
    op: Arc<dyn Fn(&V, &V) -> V + Send + Sync>,
    identity: V,
    on_finished: Arc<dyn Fn(O, V) + Send + Sync>,
    states: Mutex<HashMap<O, ReductionState<V>>>,
}

impl<O: Tag, V: Value> ReductionGraph<O, V> {
    pub fn new(
        node: Arc<Node>,
        identity: V,
        op: impl Fn(&V, &V) -> V + Send + Sync + 'static,
        on_finished: impl Fn(O, V) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let id = node.alloc_id();
        let graph = Arc::new(ReductionGraph {
            id,
            node: node.clone(),
            op: Arc::new(op),
            identity,
            on_finished: Arc::new(on_finished),
            states: Mutex::new(HashMap::new()),
        });
        node.register(graph.clone() as Arc<dyn Distributable>);
        graph
    }

    fn my_pid(&self) -> usize { self.node.pid }
    fn peers(&self) -> usize { self.node.peers }

    fn send(&self, dst: usize, msg: &ReduceMessage<O, V>) {
        let bytes = msg.encode();
        logging::log_comm(CommEvent::Sent { kind: msg.kind_name(), dst, bytes: bytes.len() });
        self.node.send(self.id, dst, &bytes);
    }

    /// Combines `value` into the running total for `out_tag` (§4.4 step 1,
    /// "local phase"). If the count is already known when this contribution
    /// arrives, re-checks completion immediately: the owner compares its
    /// updated subtree total against `n_expected`, and a non-owner forwards
    /// a delta `GATHERCOUNT` straight to the owner rather than waiting for
    /// another count-phase round to pick it up.
    pub fn contribute(&self, out_tag: O, value: V) {
        let mut states = self.states.lock().expect("reduction states mutex poisoned");
        let state = states.entry(out_tag.clone()).or_insert_with(|| ReductionState::new(self.identity.clone()));
        state.partial = (self.op)(&state.partial, &value);
        state.n_reduced += 1;

        if state.status >= Status::CntAvailable {
            let owner = state.owner_pid.expect("CntAvailable implies an owner was already assigned");
            if owner == self.my_pid() {
                state.counts_total += 1;
                self.report_count(&out_tag, state);
            } else {
                self.send(owner, &ReduceMessage::GatherCount { out_tag, count: 1 });
            }
        }
    }

    /// Declares that exactly `count` contributions (or, if `count < 0`, an
    /// unknown number to be finalized later by [`ReductionGraph::flush`])
    /// will arrive for `out_tag`, and makes this process the reduction's
    /// owner (§4.4 steps 2-3).
    pub fn set_count(&self, out_tag: O, count: i64) {
        let owner = self.my_pid();
        let mut states = self.states.lock().expect("reduction states mutex poisoned");
        let state = states.entry(out_tag.clone()).or_insert_with(|| ReductionState::new(self.identity.clone()));
        self.begin_count_phase(&out_tag, state, owner, count);
    }

    fn begin_count_phase(&self, out_tag: &O, state: &mut ReductionState<V>, owner: usize, count: i64) {
        logging::log_reduction(ReductionEvent::Transition {
            out_tag: format!("{out_tag:?}"),
            from: state.status.name(),
            to: Status::CntAvailable.name(),
        });
        state.owner_pid = Some(owner);
        state.n_expected = Some(count);
        state.status = Status::CntAvailable;

        let children = tree_children(self.my_pid(), owner, self.peers());
        for &child in &children {
            self.send(child, &ReduceMessage::BcastCount { out_tag: out_tag.clone(), owner_pid: owner as u32, count });
        }
        state.counts_pending = children.len();
        state.counts_total = state.n_reduced;

        if state.counts_pending == 0 {
            self.report_count(out_tag, state);
        }
    }

    /// Called once this node's subtree count (own contributions plus every
    /// child's reported subtree total) is final: the owner compares against
    /// the expected count, everyone else forwards up (§4.4 step 3).
    fn report_count(&self, out_tag: &O, state: &mut ReductionState<V>) {
        let owner = state.owner_pid.expect("report_count called before an owner was assigned");
        if owner == self.my_pid() {
            let late_flush = state.n_expected == Some(-1);
            if late_flush || state.n_expected == Some(state.counts_total) {
                self.begin_done_phase(out_tag, state, owner);
            }
        } else if let Some(parent) = tree_parent(self.my_pid(), owner, self.peers()) {
            self.send(parent, &ReduceMessage::GatherCount { out_tag: out_tag.clone(), count: state.counts_total });
        }
    }

    /// Broadcasts the done signal down the tree and starts this node's half
    /// of the value fan-in (§4.4 steps 4-5).
    fn begin_done_phase(&self, out_tag: &O, state: &mut ReductionState<V>, owner: usize) {
        if state.status >= Status::BcastDone {
            return;
        }
        logging::log_reduction(ReductionEvent::Transition {
            out_tag: format!("{out_tag:?}"),
            from: state.status.name(),
            to: Status::BcastDone.name(),
        });
        state.status = Status::BcastDone;

        let children = tree_children(self.my_pid(), owner, self.peers());
        for &child in &children {
            self.send(child, &ReduceMessage::Done { out_tag: out_tag.clone(), owner_pid: owner as u32 });
        }
        state.values_pending = children.len();

        if state.values_pending == 0 {
            self.report_value(out_tag, state, owner);
        }
    }

    /// Called once every child's `VALUE` has folded into this node's
    /// partial: the owner finishes, everyone else forwards their combined
    /// partial up (§4.4 step 5-6).
    fn report_value(&self, out_tag: &O, state: &mut ReductionState<V>, owner: usize) {
        if owner == self.my_pid() {
            self.finish_locked(out_tag, state);
        } else if let Some(parent) = tree_parent(self.my_pid(), owner, self.peers()) {
            self.send(parent, &ReduceMessage::Value { out_tag: out_tag.clone(), value: state.partial.clone() });
            logging::log_reduction(ReductionEvent::Transition {
                out_tag: format!("{out_tag:?}"),
                from: state.status.name(),
                to: Status::Done.name(),
            });
            state.status = Status::Done;
        }
    }

    fn finish_locked(&self, out_tag: &O, state: &mut ReductionState<V>) {
        logging::log_reduction(ReductionEvent::Transition {
            out_tag: format!("{out_tag:?}"),
            from: state.status.name(),
            to: Status::Done.name(),
        });
        state.status = Status::Done;
        logging::log_reduction(ReductionEvent::Finished { out_tag: format!("{out_tag:?}") });
        (self.on_finished)(out_tag.clone(), state.partial.clone());
    }

    /// Forces every output tag this process owns, and hasn't finished yet,
    /// to finalize using whatever has been contributed so far (§4.4 step 7,
    /// "late flush"). Output tags owned by a remote process are left alone:
    /// only the owner can drive their fan-in to completion.
    pub fn flush(&self) {
        let pid = self.my_pid();
        let mut states = self.states.lock().expect("reduction states mutex poisoned");
        let pending: Vec<O> = states
            .iter()
            .filter(|(_, state)| state.status < Status::BcastDone && state.owner_pid.unwrap_or(pid) == pid)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in pending {
            let state = states.get_mut(&tag).expect("tag collected under the same lock");
            self.begin_count_phase(&tag, state, pid, -1);
        }
    }

    fn handle_message(&self, payload: &[u8]) {
        let msg = ReduceMessage::<O, V>::decode(payload);
        logging::log_comm(CommEvent::Received { kind: msg.kind_name(), bytes: payload.len() });
        match msg {
            ReduceMessage::BcastCount { out_tag, owner_pid, count } => {
                let mut states = self.states.lock().expect("reduction states mutex poisoned");
                let state =
                    states.entry(out_tag.clone()).or_insert_with(|| ReductionState::new(self.identity.clone()));
                self.begin_count_phase(&out_tag, state, owner_pid as usize, count);
            }
            ReduceMessage::GatherCount { out_tag, count } => {
                let mut states = self.states.lock().expect("reduction states mutex poisoned");
                if let Some(state) = states.get_mut(&out_tag) {
                    state.counts_total += count;
                    state.counts_pending = state.counts_pending.saturating_sub(1);
                    if state.counts_pending == 0 {
                        self.report_count(&out_tag, state);
                    }
                }
            }
            ReduceMessage::Done { out_tag, owner_pid } => {
                let mut states = self.states.lock().expect("reduction states mutex poisoned");
                let state =
                    states.entry(out_tag.clone()).or_insert_with(|| ReductionState::new(self.identity.clone()));
                state.owner_pid = Some(owner_pid as usize);
                self.begin_done_phase(&out_tag, state, owner_pid as usize);
            }
            ReduceMessage::Value { out_tag, value } => {
                let mut states = self.states.lock().expect("reduction states mutex poisoned");
                if let Some(state) = states.get_mut(&out_tag) {
                    state.partial = (self.op)(&state.partial, &value);
                    state.values_pending = state.values_pending.saturating_sub(1);
                    if state.values_pending == 0 {
                        let owner = state.owner_pid.unwrap_or(self.my_pid());
                        self.report_value(&out_tag, state, owner);
                    }
                }
            }
            // Reserved for a future batched flush that gathers every output
            // tag's value in one round trip instead of per-tag; the current
            // `flush` reuses the per-tag DONE/VALUE path above, which is
            // sufficient for §4.4 step 7.
            ReduceMessage::AllDone | ReduceMessage::AllValues { .. } => {}
        }
    }
}

impl<O: Tag, V: Value> Distributable for ReductionGraph<O, V> {
    fn id(&self) -> usize { self.id }
    fn recv(&self, payload: &[u8]) { self.handle_message(payload) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnc_communication::generic::Generic;
    use cnc_communication::thread::Thread;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn single_process_node() -> Arc<Node> {
        Node::new(Generic::Thread(Thread::new()))
    }

    #[test]
    fn tree_topology_round_trips_for_every_root() {
        let n = 7;
        for r in 0..n {
            for p in 0..n {
                if let Some(parent) = tree_parent(p, r, n) {
                    assert!(tree_children(parent, r, n).contains(&p), "p={p} r={r} n={n}");
                } else {
                    assert_eq!(p, r);
                }
            }
        }
    }

    #[test]
    fn single_process_reduction_with_known_count() {
        let node = single_process_node();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let graph = ReductionGraph::new(node, 0i64, |a: &i64, b: &i64| a + b, move |_tag: u32, value: i64| {
            *result2.lock().unwrap() = Some(value);
        });

        for i in 0..16 {
            graph.contribute(0, i);
        }
        graph.set_count(0, 16);

        assert_eq!(*result.lock().unwrap(), Some((0..16).sum()));
    }

    #[test]
    fn single_process_late_flush_uses_whatever_arrived() {
        let node = single_process_node();
        let total = Arc::new(AtomicI64::new(-1));
        let total2 = total.clone();
        let graph = ReductionGraph::new(node, 0i64, |a: &i64, b: &i64| a + b, move |_tag: u32, value: i64| {
            total2.store(value, Ordering::SeqCst);
        });

        graph.contribute(0, 3);
        graph.contribute(0, 4);
        graph.flush();

        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn contributions_arriving_after_set_count_still_complete() {
        let node = single_process_node();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let graph = ReductionGraph::new(node, 0i64, |a: &i64, b: &i64| a + b, move |_tag: u32, value: i64| {
            *result2.lock().unwrap() = Some(value);
        });

        // The count is known before any contribution arrives, unlike
        // `single_process_reduction_with_known_count` above.
        graph.set_count(0, 16);
        assert_eq!(*result.lock().unwrap(), None, "nothing contributed yet");

        for i in 0..16 {
            graph.contribute(0, i);
        }

        assert_eq!(*result.lock().unwrap(), Some((0..16).sum()));
    }

    /// The non-owner side of the ordering above: a contribution lands on a
    /// process that already knows the count, so it must forward a delta
    /// `GATHERCOUNT` straight to the owner instead of waiting for another
    /// tree round.
    #[test]
    fn non_owner_contribution_after_count_known_forwards_delta_to_owner() {
        use cnc_communication::process::Process;

        let mut procs = Process::new_vector(2).into_iter();
        let node0 = Node::new(Generic::Process(procs.next().unwrap()));
        let node1 = Node::new(Generic::Process(procs.next().unwrap()));

        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        let graph0 = ReductionGraph::new(node0.clone(), 0i64, |a: &i64, b: &i64| a + b, move |_tag: u32, value: i64| {
            *result2.lock().unwrap() = Some(value);
        });
        let graph1 = ReductionGraph::new(node1.clone(), 0i64, |a: &i64, b: &i64| a + b, |_tag: u32, _value: i64| {});

        graph0.set_count(0u32, 2); // process 0 is the owner, expects 2 contributions total
        node1.poll(); // process 1 gets BCASTCOUNT, replies GATHERCOUNT(0): nothing contributed yet
        node0.poll(); // process 0 folds that in: counts_total == 0, short of 2

        graph1.contribute(0, 5); // arrives on process 1 after the count is already known there
        node0.poll(); // process 0 receives the delta GATHERCOUNT(1): counts_total == 1, still short

        graph0.contribute(0, 9); // the second and last contribution, made on the owner itself
        node1.poll(); // process 1 receives DONE, reports its own partial back
        node0.poll(); // process 0 folds the reply in and finishes

        assert_eq!(*result.lock().unwrap(), Some(14));
    }
}
