//! Policy hooks the core consumes but never defines (§6 "Tuner interface").
//!
//! Each policy decision is a small closed `enum` rather than a sentinel
//! integer alongside a pid — the wire protocol is the only place literal
//! byte values still matter, and tuners never cross the wire.

use std::fmt;
use std::sync::Arc;

use crate::step::Step;

/// Where `get_count(tag)` says an item's references come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetCount {
    /// Tracked, with the given non-negative count of expected `get`s.
    Tracked(u32),
    /// Never collected: the cell lives until its collection resets.
    NoGetCount,
}

/// Where `consumed_on(tag)` says an item's consumers live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Consumer {
    /// No consumer is known; keep the item locally and serve `REQUEST`s.
    Unknown,
    /// Consumed only on the producing process.
    Local,
    /// Every process consumes it; broadcast, owner is the producer.
    All,
    /// Every process but the producer consumes it; broadcast, ownership
    /// rotates away from the producer.
    AllOthers,
    /// Exactly one remote process consumes it; unicast, that pid becomes
    /// owner.
    Pid(usize),
    /// An explicit set of consumers; multicast, the first pid becomes
    /// owner.
    Pids(Vec<usize>),
}

/// Where `produced_on(tag)` says an item's producer lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Producer {
    /// No producer is known; a `REQUEST` for a missing item is broadcast.
    Unknown,
    /// Produced on the requesting process itself.
    Local,
    /// Produced on a specific, known process.
    Pid(usize),
}

/// Where `compute_on(tag)` says a step instance should execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComputeOn {
    /// Execute on whichever process creates the instance.
    Local,
    /// Distribute round-robin across all processes.
    RoundRobin,
    /// Every process computes this instance.
    ///
    /// Combined with `consumed_on` returning a single remote pid, this
    /// implementation has every process execute while ownership of any
    /// produced item still follows `consumed_on`.
    All,
    /// Every process but the one that would otherwise own it computes.
    AllOthers,
    /// Execute on one specific process.
    Pid(usize),
}

/// Where `affinity(tag)` says a step instance should be scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    /// No preference; the work-stealing pool picks a worker.
    Here,
    /// Pin to a specific worker thread index.
    Thread(usize),
}

/// A probe the scheduler runs during `prepare` to check whether a declared
/// dependency is already satisfied, without running the step body.
///
/// `depends` (below) registers one of these per dependency; `prepare` calls
/// each and, on a miss, lets the owning item cell register the step in its
/// suspend group the same way an in-body `get` miss would (§4.2's "prepare"
/// paragraph).
pub trait DependencyProbe: Send + Sync {
    /// Returns `true` if the dependency is present, registering the current
    /// step for a wakeup as a side effect if it is not.
    fn probe(&self) -> bool;
}

impl<F: Fn() -> bool + Send + Sync> DependencyProbe for F {
    fn probe(&self) -> bool { self() }
}

/// Accumulates the dependency probes a `depends` call declares for one tag.
pub struct DependencyConsumer {
    pub(crate) probes: Vec<Box<dyn DependencyProbe>>,
}

impl DependencyConsumer {
    pub(crate) fn new() -> Self { DependencyConsumer { probes: Vec::new() } }

    /// Declares that the step being prepared depends on whatever `probe`
    /// checks.
    pub fn depends_on(&mut self, probe: impl DependencyProbe + 'static) {
        self.probes.push(Box::new(probe));
    }
}

impl fmt::Debug for DependencyConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DependencyConsumer({} probes)", self.probes.len())
    }
}

/// Policy object supplying per-tag decisions for a step collection.
///
/// One instance is constructed per collection at collection-creation time;
/// [`DefaultTuner`] below is what a collection gets if the caller doesn't
/// supply one.
pub trait StepTuner<T>: Send + Sync {
    /// Relative scheduling priority; higher runs first among ready steps.
    fn priority(&self, _tag: &T) -> i32 { 0 }

    /// Declares the step's data dependencies by registering probes on
    /// `consumer`. Called once, during `prepare`, before `execute`.
    ///
    /// `step` is the instance being prepared, passed through so a probe
    /// closure can register it in an item cell's suspend group on a miss the
    /// same way an in-body `get` would (§4.2 "prepare": pass it as
    /// `GetContext::Step(step)` to `unsafe_get`), instead of relying on an
    /// implicit thread-local "current step" pointer.
    fn depends(&self, _tag: &T, _step: &Arc<dyn Step>, _consumer: &mut DependencyConsumer) {}

    /// Whether dependencies should be (re-)probed even when other state
    /// suggests they're already known to be ready. An instance method
    /// rather than an associated constant since Rust trait objects can't
    /// carry a `const` default overridable per-impl as cleanly.
    fn check_deps_in_ranges(&self) -> bool { false }

    /// Where this tag's step instance should be scheduled.
    fn affinity(&self, _tag: &T) -> Affinity { Affinity::Here }

    /// Where this tag's step instance should execute.
    fn compute_on(&self, _tag: &T) -> ComputeOn { ComputeOn::Local }

    /// Best-effort cancellation check, consulted immediately before
    /// `execute`. No preemption mid-step (§5).
    fn was_canceled(&self, _tag: &T) -> bool { false }

    /// Whether this tag's step instance must run serially with other
    /// sequentialized steps, off the ready queue (§4.2 "Sequentialization").
    fn sequentialize(&self, _tag: &T) -> bool { false }

    /// Whether the scheduler should attempt to prepare steps eagerly before
    /// they're strictly needed.
    fn preschedule(&self) -> bool { false }
}

/// Policy object supplying per-tag decisions for an item collection.
pub trait ItemTuner<T>: Send + Sync {
    /// How many successful `get`s this tag's value should survive before
    /// its owning cell is garbage-collected.
    fn get_count(&self, _tag: &T) -> GetCount { GetCount::NoGetCount }

    /// Where this tag's consumers live, for routed delivery on `put`.
    fn consumed_on(&self, _tag: &T) -> Consumer { Consumer::Unknown }

    /// Where this tag's producer lives, to target a `REQUEST` on miss.
    fn produced_on(&self, _tag: &T) -> Producer { Producer::Unknown }
}

/// The tuner a collection gets when the caller doesn't supply one: every
/// item kept locally with no tracked get-count, every step computed and
/// scheduled locally with default priority.
#[derive(Default)]
pub struct DefaultTuner;

impl<T> StepTuner<T> for DefaultTuner {}
impl<T> ItemTuner<T> for DefaultTuner {}
