use crate::core::{FailureType, NodeOutcome, NodeState, QueueStatus};
use crate::expr::ExprId;
use crate::plan::{CommandId, Condition, MutexId, NodeId};
use hashbrown::HashMap;
use smallvec::SmallVec;

/// Lowest-urgency priority; smaller values win arbitration.
pub const WORST_PRIORITY: i32 = 100_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Empty,
    List,
    LibraryCall,
    Assignment,
    Command,
    Update,
}

impl NodeType {
    pub fn has_children(self) -> bool {
        matches!(self, NodeType::List | NodeType::LibraryCall)
    }

    /// The states this node type may legally occupy.
    pub fn allows_state(self, state: NodeState) -> bool {
        match state {
            NodeState::Finishing => self.has_children(),
            NodeState::Failing => !matches!(self, NodeType::Empty),
            _ => true,
        }
    }
}

/// Per-type payload. Assignment and Update bodies are small and live inline;
/// Command bodies are interned in the plan's command arena because the
/// external interface refers to them by id across steps.
#[derive(Clone, Debug)]
pub enum NodeBody {
    Empty,
    List,
    /// The alias map is the *entire* non-local scope of the callee subtree.
    LibraryCall { aliases: HashMap<String, ExprId> },
    Assignment(Box<crate::plan::AssignmentBody>),
    Command(CommandId),
    Update(Box<crate::plan::UpdateBody>),
}

/// A condition slot entry: the expression plus whether this node owns it
/// (owned slots are torn down with the node; borrowed ones belong to the
/// parent or to another slot).
#[derive(Copy, Clone, Debug)]
pub struct CondSlot {
    pub expr: ExprId,
    pub owned: bool,
}

/// Entry/exit times per state for the current iteration.
///
/// Reset whenever the node re-enters INACTIVE.
#[derive(Clone, Debug, Default)]
pub struct TimepointRecord {
    times: [[Option<f64>; 2]; NodeState::COUNT],
}

impl TimepointRecord {
    pub fn record_entry(&mut self, state: NodeState, t: f64) {
        self.times[state.index()][0] = Some(t);
    }

    pub fn record_exit(&mut self, state: NodeState, t: f64) {
        self.times[state.index()][1] = Some(t);
    }

    pub fn get(&self, state: NodeState, end: bool) -> Option<f64> {
        self.times[state.index()][end as usize]
    }

    pub fn reset(&mut self) {
        self.times = Default::default();
    }
}

/// A plan node: one state machine in the tree.
pub struct Node {
    /// Non-empty, unique among siblings, stable for the node's lifetime.
    pub node_id: String,
    pub typ: NodeType,
    pub parent: Option<NodeId>,
    /// Populated for List/LibraryCall only.
    pub children: Vec<NodeId>,

    /// Variables declared here, by name. `local_decls` preserves declaration
    /// order for activation.
    pub locals: HashMap<String, ExprId>,
    pub local_decls: Vec<ExprId>,
    /// Mutexes declared here.
    pub mutexes: HashMap<String, MutexId>,
    /// Mutexes this node's body must acquire before executing.
    pub requested: Vec<MutexId>,
    /// Granted mutexes, in grant order; released in reverse.
    pub using: Vec<MutexId>,

    pub conds: [Option<CondSlot>; Condition::COUNT],

    pub state: NodeState,
    pub outcome: Option<NodeOutcome>,
    pub failure: Option<FailureType>,
    /// Destination decided in the check phase, committed later in the same
    /// step. Cleared after commit.
    pub next_state: Option<NodeState>,
    pub next_outcome: Option<NodeOutcome>,
    pub next_failure: Option<FailureType>,

    pub priority: i32,
    pub queue_status: QueueStatus,

    pub state_start_time: f64,
    pub timepoints: TimepointRecord,

    /// Expressions reading this node's state/outcome/failure/timepoints or
    /// child-state predicates; notified on every node change.
    pub change_listeners: SmallVec<[ExprId; 2]>,

    pub body: NodeBody,
}

impl Node {
    pub fn new(node_id: impl Into<String>, typ: NodeType, parent: Option<NodeId>) -> Node {
        Node {
            node_id: node_id.into(),
            typ,
            parent,
            children: Vec::new(),
            locals: HashMap::new(),
            local_decls: Vec::new(),
            mutexes: HashMap::new(),
            requested: Vec::new(),
            using: Vec::new(),
            conds: [None; Condition::COUNT],
            state: NodeState::Inactive,
            outcome: None,
            failure: None,
            next_state: None,
            next_outcome: None,
            next_failure: None,
            priority: WORST_PRIORITY,
            queue_status: QueueStatus::None,
            state_start_time: 0.0,
            timepoints: TimepointRecord::default(),
            change_listeners: SmallVec::new(),
            body: match typ {
                NodeType::List => NodeBody::List,
                _ => NodeBody::Empty, // bodies are attached by the builder
            },
        }
    }

    pub fn cond(&self, which: Condition) -> Option<ExprId> {
        self.conds[which.index()].map(|s| s.expr)
    }

    /// Clears outcome and failure ahead of a new iteration or reactivation.
    pub fn reset(&mut self) {
        self.outcome = None;
        self.failure = None;
        self.next_state = None;
        self.next_outcome = None;
        self.next_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_states_per_type() {
        assert!(NodeType::List.allows_state(NodeState::Finishing));
        assert!(NodeType::LibraryCall.allows_state(NodeState::Finishing));
        assert!(!NodeType::Command.allows_state(NodeState::Finishing));
        assert!(NodeType::Command.allows_state(NodeState::Failing));
        assert!(!NodeType::Empty.allows_state(NodeState::Failing));
        assert!(NodeType::Empty.allows_state(NodeState::IterationEnded));
    }

    #[test]
    fn timepoints_reset() {
        let mut tp = TimepointRecord::default();
        tp.record_entry(NodeState::Waiting, 1.0);
        tp.record_exit(NodeState::Waiting, 2.0);
        assert_eq!(tp.get(NodeState::Waiting, false), Some(1.0));
        assert_eq!(tp.get(NodeState::Waiting, true), Some(2.0));
        assert_eq!(tp.get(NodeState::Executing, false), None);
        tp.reset();
        assert_eq!(tp.get(NodeState::Waiting, false), None);
    }
}
