//! Step instance lifecycle and the suspend-group protocol (§4.2).
//!
//! A step instance's tag type and body closure vary per step collection,
//! so the scheduler (§4.3) can't hold them generically; it holds
//! `Arc<dyn Step>` instead, a type-erased handle over heterogeneous step
//! instances. This core's concurrency model (§5) runs steps across a shared
//! worker pool, so `Step` is `Send + Sync` and its mutable fields (`status`,
//! `suspend_count`, `successor`) use atomics and short-held mutexes rather
//! than `Rc<RefCell<_>>`.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Lifecycle states from §4.2's state diagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Prepared,
    Suspended,
    Pending,
    Sequentialized,
    Done,
    FromPending,
}

/// What `execute` tells the scheduler to do next (§9's replacement for the
/// source's `DataNotReady` exception: an explicit outcome enum).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step body ran to completion; puts are committed.
    Success,
    /// A `get` missed; the step is now registered in a suspend group and
    /// will be replayed once the corresponding `put` arrives.
    NeedsReplay,
    /// The tuner asked for serial execution; the step moves to the
    /// sequentialized queue instead of re-entering the ready queue.
    NeedsSequentialize,
}

/// Accumulates `(collection, tag)` decrements to run once a step instance
/// commits (§3 "get_list"). Each entry is a closure capturing the concrete
/// collection and tag, type-erasing the decrement across item collections
/// of different tag/value types.
#[derive(Default)]
pub struct GetList {
    entries: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl GetList {
    pub fn new() -> Self { GetList { entries: Mutex::new(Vec::new()) } }

    /// Records one `(collection, tag)` pair consumed during this attempt.
    pub fn record(&self, decrement: impl FnOnce() + Send + 'static) {
        self.entries.lock().expect("get-list mutex poisoned").push(Box::new(decrement));
    }

    /// Runs and clears every recorded decrement, in the order recorded.
    pub fn commit(&self) {
        let entries = std::mem::take(&mut *self.entries.lock().expect("get-list mutex poisoned"));
        for decrement in entries {
            decrement();
        }
    }
}

impl fmt::Debug for GetList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GetList(..)")
    }
}

/// The set of step instances (and possibly the environment, represented as
/// `None`) waiting on one item cell's value (§3 "Suspend group").
///
/// Appending is lock-protected by the cell's own accessor (callers already
/// hold it); `resume` walks the group exactly once, which is why the group
/// is consumed (`Vec::new()` swapped in) rather than borrowed.
#[derive(Default)]
pub struct SuspendGroup {
    members: Vec<SuspendMember>,
}

/// One member of a suspend group.
pub enum SuspendMember {
    /// A suspended step instance.
    Step(Arc<dyn Step>),
    /// The blocking environment/main-thread caller.
    Environment(Arc<crate::context::EnvWaiter>),
}

impl SuspendGroup {
    pub fn is_empty(&self) -> bool { self.members.is_empty() }

    /// Appends a member; called while holding the cell's accessor.
    pub fn append(&mut self, member: SuspendMember) {
        self.members.push(member);
    }

    /// Drains every member, resuming each. Returns `true` if an environment
    /// waiter was among them (§4.2 "resume").
    pub fn resume(&mut self) -> bool {
        let mut released_env = false;
        for member in self.members.drain(..) {
            match member {
                SuspendMember::Step(step) => step.on_dependency_ready(),
                SuspendMember::Environment(waiter) => {
                    waiter.signal();
                    released_env = true;
                }
            }
        }
        released_env
    }
}

/// The scheduler-visible surface of one step instance, independent of its
/// tag type and body closure.
pub trait Step: Send + Sync {
    /// The id of the step collection this instance belongs to, for logging.
    fn collection_id(&self) -> usize;
    /// A human-readable rendering of the tag, for logging only.
    fn tag_label(&self) -> String;
    /// Runs the user body to its next suspension point.
    ///
    /// Called by the scheduler on a worker thread. `get` misses inside the
    /// body register this instance in the relevant cell's suspend group
    /// before returning [`StepOutcome::NeedsReplay`] up through this call.
    fn execute(self: Arc<Self>) -> StepOutcome;
    /// Whether the tuner marked this tag's step for sequentialized
    /// (serial) execution.
    fn sequentialize(&self) -> bool;
    /// Best-effort cancellation check, consulted before `execute`.
    fn was_canceled(&self) -> bool;
    /// The current lifecycle status.
    fn status(&self) -> StepStatus;
    fn set_status(&self, status: StepStatus);
    /// The outstanding-dependency counter a suspend-group resume
    /// decrements (§4.2 "resume").
    fn suspend_count(&self) -> &AtomicI64;
    /// Called by [`SuspendGroup::resume`] when one dependency of this
    /// instance becomes available: decrements the suspend count and, if it
    /// reaches zero, re-enqueues the instance onto the scheduler's ready
    /// queue. The scheduler handle needed to do the re-enqueue is supplied
    /// at construction time by the step collection that built this
    /// instance, so `Step` itself doesn't need to know about `Scheduler`.
    fn on_dependency_ready(self: Arc<Self>);
    /// The successor step bypass-dispatch should run next, if this
    /// instance's body prescribed exactly one ready successor (§4.2
    /// "Bypass dispatch").
    fn successor(&self) -> Option<Arc<dyn Step>>;
    /// Sets the successor step bypass-dispatch should run next.
    fn set_successor(&self, successor: Option<Arc<dyn Step>>);
    /// The ordered set of `(item_collection, tag)` decrements to run once
    /// this instance's latest execution attempt commits (§3 "get_list").
    fn get_list(&self) -> &GetList;
}

/// Bumps `counter` by one and returns the new value.
pub fn bump_suspend_count(counter: &AtomicI64) -> i64 {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

/// Decrements `counter` by one and returns the new value.
pub fn release_suspend_count(counter: &AtomicI64) -> i64 {
    counter.fetch_sub(1, Ordering::SeqCst) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_list_commits_in_order() {
        let list = GetList::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            list.record(move || order.lock().unwrap().push(i));
        }
        list.commit();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn suspend_count_round_trips() {
        let counter = AtomicI64::new(0);
        assert_eq!(bump_suspend_count(&counter), 1);
        assert_eq!(bump_suspend_count(&counter), 2);
        assert_eq!(release_suspend_count(&counter), 1);
        assert_eq!(release_suspend_count(&counter), 0);
    }
}
