//! A coordination core for declarative dataflow graphs of item collections
//! and steps: single-assignment tag/value storage with distributed
//! ownership and garbage collection (§4.1), a step-instance scheduler with
//! suspension, sequentialization and bypass dispatch (§4.2-4.3), and
//! asynchronous tree-shaped reduction (§4.4).
//!
//! A thin `context`/`Worker` entry point sits over a transport-agnostic
//! communication layer, the same split this crate keeps between
//! `cnc-communication` (transport + dispatch) and `cnc` (the coordination
//! semantics built on top of it).

pub mod context;
pub mod item;
pub mod logging;
pub mod reduction;
pub mod scheduler;
pub mod step;
pub mod tag;
pub mod tuner;
pub mod wire;

pub use context::{EnvWaiter, Node, StepCollection, StepHandle, Worker};
pub use item::{GatherTimeout, GetContext, GetOutcome, ItemCollection};
pub use reduction::ReductionGraph;
pub use scheduler::{parallel_for, QuiescenceHook, Scheduler};
pub use step::{Step, StepOutcome, StepStatus};
pub use tag::{Tag, Value};
pub use tuner::{
    Affinity, ComputeOn, Consumer, DefaultTuner, DependencyConsumer, DependencyProbe, GetCount, ItemTuner, Producer,
    StepTuner,
};

pub use cnc_communication::{initialize, initialize_from, Configuration, Generic, WorkerGuards};
