//! Formation engine — the provisioning state machines.
//!
//! Two cooperating machines drive a run:
//!
//! - **[`node`]** — one machine per node: create, wait for reachability,
//!   apply configuration
//! - **[`system`]** — the system-wide machine: spawns node machines,
//!   provisions load balancers, walks the dependency graph in weight
//!   order, and owns the single teardown-or-halt error decision
//!
//! Every wait goes through the **[`poll`]** primitive: sample an
//! observable predicate on a fixed interval, give up at a deadline.
//! Transitions are declared in explicit tables; firing an undeclared
//! (state, event) pair is an error, never a silent no-op.

pub mod error;
pub mod node;
pub mod poll;
pub mod system;

pub use error::{EngineError, EngineResult};
pub use node::{NodeEvent, NodeProvisioner, NodeState, node_transition};
pub use poll::{PollOutcome, PollTiming, poll};
pub use system::{
    Collaborators, CompletionTally, SystemEvent, SystemProvisioner, SystemState,
    system_transition,
};
