//! A plan-execution engine for hierarchical reactive plans.
//!
//! A *plan* is a tree of nodes, each a small state machine whose transitions
//! are gated by Boolean conditions over plan and world state. The engine
//! walks that tree concurrently with the external world: conditions react to
//! variable and lookup changes through a change-notification graph, the
//! executive picks up affected nodes, computes their destination states and
//! commits transitions in priority order, and nodes entering execution
//! publish their effects (assignments, commands, world-model updates) to an
//! external interface.
//!
//! The crate is organized bottom up:
//!  - [collections]: typed index types and index-keyed stores,
//!  - [core]: the value model (known/unknown tri-state, arrays) and the
//!    engine enumerations,
//!  - [expr]: the expression graph with activation counting and push-based
//!    change notification,
//!  - [plan]: nodes, condition slots, variable scoping, action bodies,
//!    mutexes and the plan builder,
//!  - [exec]: the node state machine, the executive loop, resource
//!    arbitration and the external-interface contract.

pub mod collections;
pub mod core;
pub mod exec;
pub mod expr;
pub mod plan;

pub mod prelude {
    pub use crate::core::{CommandHandle, FailureType, NodeOutcome, NodeState, Value, ValueType};
    pub use crate::exec::{Executive, ExternalInterface, InputEvent};
    pub use crate::expr::{ExprId, Op};
    pub use crate::plan::{NodeId, NodeType, PlanBuilder};
}
