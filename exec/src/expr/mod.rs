//! The expression graph.
//!
//! Expressions form a DAG stored in a single arena ([crate::plan::Plan] owns
//! it); every cross reference is an [ExprId]. Three mechanisms live here:
//!
//!  - *activation counting*: an expression is live while at least one holder
//!    keeps it activated. Activating an interior expression activates
//!    everything it reads. An inactive expression reads as Unknown and
//!    publishes nothing.
//!  - *change notification*: leaves that can change on their own (variables,
//!    lookups, node-backed expressions) push a change pulse through the
//!    listener graph to the nodes whose conditions depend on them.
//!  - *pull evaluation*: interior expressions recompute from their children
//!    on every read, propagating unknown per the operator catalog.

pub use ops::Op;

mod ops;

mod eval;

use crate::core::{NodeState, Value, ValueType};
use crate::create_ref_type;
use crate::plan::NodeId;
use smallvec::SmallVec;

create_ref_type!(ExprId);

/// Downstream party interested in an expression's changes: either an interior
/// expression that reads it, or a node whose conditions read it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Listener {
    Expr(ExprId),
    Node(NodeId),
}

/// Which internal attribute of a node a [ExprKind::NodeRef] reads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeField {
    State,
    Outcome,
    Failure,
    /// Command handle of a Command node; referencing any other node type is
    /// rejected during plan checking.
    Handle,
}

/// Node functions: Boolean predicates over the children of a node. Always
/// known. Change notification is installed on every child.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeFn {
    AllChildrenFinished,
    AllChildrenWaitingOrFinished,
}

/// Storage of a plan variable.
#[derive(Clone, Debug)]
pub struct VarData {
    /// Declared name, kept for diagnostics. Anonymous internals (acks,
    /// command handles) carry a synthesized name.
    pub name: String,
    pub decl_type: ValueType,
    /// Evaluated on each activation to (re)establish the initial value.
    pub init: Option<ExprId>,
    pub value: Value,
}

/// Cached mirror of an external state reading.
#[derive(Clone, Debug)]
pub struct LookupData {
    pub state_name: String,
    pub args: SmallVec<[ExprId; 2]>,
    pub tolerance: Option<f64>,
    pub decl_type: ValueType,
    pub value: Value,
}

#[derive(Clone, Debug)]
pub enum ExprKind {
    /// Leaf; always active, never changes.
    Const(Value),
    /// Leaf propagation source; writable while active.
    Var(VarData),
    /// Transparent wrapper over another expression. Read-only aliases refuse
    /// writes; writable ones forward them.
    Alias { target: ExprId, writable: bool },
    /// Interior operator application.
    Apply { op: Op, args: SmallVec<[ExprId; 2]> },
    /// State, outcome or failure type of a node. Notification is installed on
    /// the owning node rather than on subexpressions.
    NodeRef { node: NodeId, field: NodeField },
    /// Predicate over the children of a node.
    NodeFn { op: NodeFn, node: NodeId },
    /// Time at which `node` entered (`end == false`) or left (`end == true`)
    /// `state` in the current iteration; unknown before that happens.
    Timepoint {
        node: NodeId,
        state: NodeState,
        end: bool,
    },
    /// Mirror of external world state.
    Lookup(LookupData),
}

/// An expression node: kind, activation count and listeners.
#[derive(Clone, Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub(crate) active_count: u32,
    pub(crate) listeners: SmallVec<[Listener; 2]>,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Expr {
        Expr {
            kind,
            active_count: 0,
            listeners: SmallVec::new(),
        }
    }

    /// Constants and node-backed expressions are always active; everything
    /// else is live only while some holder keeps its activation count up.
    pub fn is_active(&self) -> bool {
        match self.kind {
            ExprKind::Const(_)
            | ExprKind::NodeRef { .. }
            | ExprKind::NodeFn { .. }
            | ExprKind::Timepoint { .. } => true,
            _ => self.active_count > 0,
        }
    }

    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// True if this expression can change value without any of its
    /// subexpressions changing first.
    pub fn is_propagation_source(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Var(_)
                | ExprKind::Lookup(_)
                | ExprKind::NodeRef { .. }
                | ExprKind::NodeFn { .. }
                | ExprKind::Timepoint { .. }
        )
    }

    /// The declared type where one is known statically.
    pub fn static_type(&self) -> Option<ValueType> {
        match &self.kind {
            ExprKind::Const(v) => v.value_type(),
            ExprKind::Var(v) => Some(v.decl_type),
            ExprKind::Alias { .. } => None, // the target's type; resolved by the graph
            ExprKind::Apply { .. } => None, // derived from the operator
            ExprKind::NodeRef { field, .. } => Some(match field {
                NodeField::State => ValueType::NodeState,
                NodeField::Outcome => ValueType::NodeOutcome,
                NodeField::Failure => ValueType::FailureType,
                NodeField::Handle => ValueType::CommandHandle,
            }),
            ExprKind::NodeFn { .. } => Some(ValueType::Boolean),
            ExprKind::Timepoint { .. } => Some(ValueType::Real),
            ExprKind::Lookup(l) => Some(l.decl_type),
        }
    }
}
