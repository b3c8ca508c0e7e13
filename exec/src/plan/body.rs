use crate::core::Value;
use crate::expr::ExprId;
use crate::plan::{MutexId, NodeId};
use smallvec::SmallVec;

/// A declared claim on a mutex by a Command body.
///
/// `release_at_termination` is parsed and stored, but release currently
/// happens on every termination; see the design notes. Legacy
/// `lower_bound`/`priority` fields of the wire format are accepted by the
/// builder and dropped here.
#[derive(Clone, Debug)]
pub struct ResourceSpec {
    pub mutex: MutexId,
    pub upper_bound: Option<f64>,
    pub release_at_termination: bool,
}

/// Body of an Assignment node: write `rhs` to `dest` once resources are
/// granted.
///
/// Created at plan load; its expressions are activated while the owning node
/// executes. The RHS is evaluated exactly once on execution and the snapshot
/// applied in the executive's assignment sub-phase.
#[derive(Clone, Debug)]
pub struct AssignmentBody {
    pub dest: ExprId,
    pub rhs: ExprId,
    /// Boolean variable; true once the write has been applied.
    pub ack: ExprId,
    /// Boolean variable; true once an abort has discarded the write.
    pub abort_ack: ExprId,
    /// RHS snapshot taken on execution, consumed by the apply sub-phase.
    pub value: Option<Value>,
    /// True while the snapshot sits in the executive's assignment queue.
    pub queued: bool,
}

/// Body of a Command node.
#[derive(Clone, Debug)]
pub struct CommandBody {
    pub node: NodeId,
    pub name: ExprId,
    pub args: SmallVec<[ExprId; 4]>,
    /// Destination for the command's return value, if declared.
    pub dest: Option<ExprId>,
    pub resources: Vec<ResourceSpec>,
    /// CommandHandle-typed variable driven by the external interface.
    pub handle: ExprId,
    /// Boolean variable set by the abort acknowledgement.
    pub abort_complete: ExprId,
    /// True from dispatch until the handle goes terminal or the node stops
    /// executing; interface events for non-pending commands are ignored.
    pub pending: bool,
    /// True while an abort request is outstanding.
    pub abort_pending: bool,
}

/// Body of an Update node: a name -> value report to the planner.
#[derive(Clone, Debug)]
pub struct UpdateBody {
    pub pairs: Vec<(String, ExprId)>,
    /// Boolean variable; true once the interface acknowledged the update.
    pub ack: ExprId,
    pub pending: bool,
}
