use std::fmt::{Display, Formatter};

/// The seven states of the node automaton.
///
/// FINISHING is legal only for List and LibraryCall nodes; FAILING for every
/// type except Empty.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Inactive,
    Waiting,
    Executing,
    Finishing,
    Finished,
    Failing,
    IterationEnded,
}

impl NodeState {
    pub const COUNT: usize = 7;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<NodeState> {
        use NodeState::*;
        [Inactive, Waiting, Executing, Finishing, Finished, Failing, IterationEnded]
            .get(i)
            .copied()
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Inactive => "INACTIVE",
            NodeState::Waiting => "WAITING",
            NodeState::Executing => "EXECUTING",
            NodeState::Finishing => "FINISHING",
            NodeState::Finished => "FINISHED",
            NodeState::Failing => "FAILING",
            NodeState::IterationEnded => "ITERATION_ENDED",
        };
        write!(f, "{name}")
    }
}

/// Why a node finished (or ended an iteration).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeOutcome {
    Success,
    Failure,
    Skipped,
    Interrupted,
}

impl Display for NodeOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeOutcome::Success => "SUCCESS",
            NodeOutcome::Failure => "FAILURE",
            NodeOutcome::Skipped => "SKIPPED",
            NodeOutcome::Interrupted => "INTERRUPTED",
        };
        write!(f, "{name}")
    }
}

/// Refinement of a FAILURE or INTERRUPTED outcome.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FailureType {
    PreConditionFailed,
    PostConditionFailed,
    InvariantConditionFailed,
    ParentFailed,
    Exited,
    ParentExited,
    /// An Assignment lost same-variable priority arbitration.
    ResourceContention,
}

impl FailureType {
    /// True for the failure types that are inflicted by an ancestor rather
    /// than by the node itself; they route FAILING to FINISHED instead of
    /// ITERATION_ENDED.
    pub fn is_inherited(self) -> bool {
        matches!(self, FailureType::ParentFailed | FailureType::ParentExited)
    }
}

impl Display for FailureType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureType::PreConditionFailed => "PRE_CONDITION_FAILED",
            FailureType::PostConditionFailed => "POST_CONDITION_FAILED",
            FailureType::InvariantConditionFailed => "INVARIANT_CONDITION_FAILED",
            FailureType::ParentFailed => "PARENT_FAILED",
            FailureType::Exited => "EXITED",
            FailureType::ParentExited => "PARENT_EXITED",
            FailureType::ResourceContention => "RESOURCE_CONTENTION",
        };
        write!(f, "{name}")
    }
}

/// Progress of a command through the external interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandHandle {
    Sent,
    Received,
    Accepted,
    RcvdExec,
    Success,
    Denied,
    Failed,
    InterfaceError,
}

impl CommandHandle {
    /// Terminal values end the command's execution.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandHandle::Success | CommandHandle::Denied | CommandHandle::Failed | CommandHandle::InterfaceError
        )
    }

    /// The interface protocol: SENT -> {RECEIVED, DENIED, FAILED,
    /// INTERFACE_ERROR}; RECEIVED -> ACCEPTED; ACCEPTED -> {SUCCESS, FAILED}.
    /// RCVD_EXEC is interchangeable with RECEIVED. A value outside this order
    /// is a protocol violation and the command degrades to INTERFACE_ERROR.
    pub fn may_follow(self, prev: CommandHandle) -> bool {
        use CommandHandle::*;
        match prev {
            Sent => matches!(self, Received | RcvdExec | Accepted | Denied | Failed | InterfaceError | Success),
            Received | RcvdExec => matches!(self, Accepted | Success | Failed | InterfaceError),
            Accepted => matches!(self, Success | Failed | InterfaceError),
            _ => false, // terminal
        }
    }
}

impl Display for CommandHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandHandle::Sent => "COMMAND_SENT_TO_SYSTEM",
            CommandHandle::Received => "COMMAND_RCVD_BY_SYSTEM",
            CommandHandle::Accepted => "COMMAND_ACCEPTED",
            CommandHandle::RcvdExec => "COMMAND_RCVD_BY_EXEC",
            CommandHandle::Success => "COMMAND_SUCCESS",
            CommandHandle::Denied => "COMMAND_DENIED",
            CommandHandle::Failed => "COMMAND_FAILED",
            CommandHandle::InterfaceError => "COMMAND_INTERFACE_ERROR",
        };
        write!(f, "{name}")
    }
}

/// A node's relationship to the executive's work queues.
///
/// The enum both prevents double-enqueueing and coalesces condition-change
/// notifications within a step: a node already scheduled for a check is not
/// scheduled again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum QueueStatus {
    /// Not in any queue.
    #[default]
    None,
    /// In the candidate queue awaiting a condition check.
    Check,
    /// In the transition queue with a committed destination.
    Transition,
    /// In the transition queue, and a condition changed during commit.
    TransitionCheck,
    /// Blocked on resource arbitration.
    Pending,
    /// Blocked, and a requested mutex has since been released.
    PendingTry,
    /// Blocked, and a condition changed while blocked.
    PendingCheck,
    /// Blocked, a mutex released, and a condition changed.
    PendingTryCheck,
    /// Root node finished, awaiting removal.
    Finished,
    /// Terminal: the scheduler is releasing the node.
    Delete,
}

impl QueueStatus {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            QueueStatus::Pending | QueueStatus::PendingTry | QueueStatus::PendingCheck | QueueStatus::PendingTryCheck
        )
    }
}
