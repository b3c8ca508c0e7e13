//! Destination-state computation for the seven-state node automaton.
//!
//! Pure reads over the plan: in each state only the conditions active in
//! that state are consulted, in a fixed priority order, first match wins.
//! Committing the chosen transition (and the condition activation deltas
//! that go with it) is the executive's job.

use crate::core::{FailureType, NodeOutcome, NodeState};
use crate::plan::{Condition, NodeId, NodeType, Plan};

/// A decided transition: destination state plus the outcome/failure to
/// record on commit.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: NodeState,
    pub outcome: Option<NodeOutcome>,
    pub failure: Option<FailureType>,
}

impl Transition {
    fn to(state: NodeState) -> Transition {
        Transition {
            state,
            outcome: None,
            failure: None,
        }
    }

    fn with(state: NodeState, outcome: NodeOutcome) -> Transition {
        Transition {
            state,
            outcome: Some(outcome),
            failure: None,
        }
    }

    fn failed(state: NodeState, outcome: NodeOutcome, failure: FailureType) -> Transition {
        Transition {
            state,
            outcome: Some(outcome),
            failure: Some(failure),
        }
    }
}

/// A node's ancestor conditions live in its parent's combined slots.
fn ancestor_cond(plan: &Plan, n: NodeId, which: Condition) -> Option<crate::expr::ExprId> {
    let parent = plan.nodes[n].parent?;
    plan.nodes[parent].cond(which)
}

/// Condition is present and known true. An absent condition never matches.
fn cond_true(plan: &Plan, e: Option<crate::expr::ExprId>) -> bool {
    e.map(|e| plan.eval_bool(e) == Some(true)).unwrap_or(false)
}

/// Condition is present and known false.
fn cond_false(plan: &Plan, e: Option<crate::expr::ExprId>) -> bool {
    e.map(|e| plan.eval_bool(e) == Some(false)).unwrap_or(false)
}

/// Condition is present and not known true (false or unknown). Used for the
/// guards whose default is true when the slot is empty.
fn cond_not_true(plan: &Plan, e: Option<crate::expr::ExprId>) -> bool {
    e.map(|e| plan.eval_bool(e) != Some(true)).unwrap_or(false)
}

/// Computes the node's destination, or None when no transition applies.
pub fn destination(plan: &Plan, n: NodeId) -> Option<Transition> {
    match plan.nodes[n].state {
        NodeState::Inactive => from_inactive(plan, n),
        NodeState::Waiting => from_waiting(plan, n),
        NodeState::Executing => from_executing(plan, n),
        NodeState::Finishing => from_finishing(plan, n),
        NodeState::Finished => from_finished(plan, n),
        NodeState::Failing => from_failing(plan, n),
        NodeState::IterationEnded => from_iteration_ended(plan, n),
    }
}

// Legal successor states: WAITING, FINISHED.
// A root node goes straight to WAITING on activation.
fn from_inactive(plan: &Plan, n: NodeId) -> Option<Transition> {
    let parent = match plan.nodes[n].parent {
        None => return Some(Transition::to(NodeState::Waiting)),
        Some(p) => p,
    };
    match plan.nodes[parent].state {
        NodeState::Finished => Some(Transition::with(NodeState::Finished, NodeOutcome::Skipped)),
        NodeState::Executing => {
            if cond_true(plan, ancestor_cond(plan, n, Condition::AncestorExit))
                || cond_false(plan, ancestor_cond(plan, n, Condition::AncestorInvariant))
                || cond_true(plan, ancestor_cond(plan, n, Condition::AncestorEnd))
            {
                Some(Transition::with(NodeState::Finished, NodeOutcome::Skipped))
            } else {
                Some(Transition::to(NodeState::Waiting))
            }
        }
        _ => None,
    }
}

// Legal successor states: EXECUTING, FINISHED, ITERATION_ENDED.
fn from_waiting(plan: &Plan, n: NodeId) -> Option<Transition> {
    let node = &plan.nodes[n];
    if cond_true(plan, ancestor_cond(plan, n, Condition::AncestorExit))
        || cond_true(plan, node.cond(Condition::Exit))
        || cond_false(plan, ancestor_cond(plan, n, Condition::AncestorInvariant))
        || cond_true(plan, ancestor_cond(plan, n, Condition::AncestorEnd))
        || cond_true(plan, node.cond(Condition::Skip))
    {
        return Some(Transition::with(NodeState::Finished, NodeOutcome::Skipped));
    }
    if cond_not_true(plan, node.cond(Condition::Start)) {
        return None;
    }
    if cond_not_true(plan, node.cond(Condition::Pre)) {
        return Some(Transition::failed(
            NodeState::IterationEnded,
            NodeOutcome::Failure,
            FailureType::PreConditionFailed,
        ));
    }
    Some(Transition::to(NodeState::Executing))
}

fn from_executing(plan: &Plan, n: NodeId) -> Option<Transition> {
    let node = &plan.nodes[n];
    // where an interruption sends this node type
    let (exit_dest, fail_dest) = match node.typ {
        NodeType::Empty => (NodeState::Finished, NodeState::IterationEnded),
        _ => (NodeState::Failing, NodeState::Failing),
    };
    if cond_true(plan, ancestor_cond(plan, n, Condition::AncestorExit)) {
        return Some(Transition::failed(
            exit_dest,
            NodeOutcome::Interrupted,
            FailureType::ParentExited,
        ));
    }
    if cond_true(plan, node.cond(Condition::Exit)) {
        let dest = match node.typ {
            NodeType::Empty => NodeState::IterationEnded,
            _ => NodeState::Failing,
        };
        return Some(Transition::failed(dest, NodeOutcome::Interrupted, FailureType::Exited));
    }
    if cond_false(plan, ancestor_cond(plan, n, Condition::AncestorInvariant)) {
        let dest = match node.typ {
            NodeType::Empty => NodeState::Finished,
            _ => fail_dest,
        };
        return Some(Transition::failed(dest, NodeOutcome::Failure, FailureType::ParentFailed));
    }
    if cond_false(plan, node.cond(Condition::Invariant)) {
        let dest = match node.typ {
            NodeType::Empty => NodeState::IterationEnded,
            _ => fail_dest,
        };
        return Some(Transition::failed(
            dest,
            NodeOutcome::Failure,
            FailureType::InvariantConditionFailed,
        ));
    }
    // A protocol-violating interface degrades the handle to INTERFACE_ERROR
    // and the command fails out rather than reporting success.
    if let crate::plan::NodeBody::Command(cid) = &node.body {
        if plan.eval(plan.commands[*cid].handle).as_command_handle() == Some(crate::core::CommandHandle::InterfaceError)
        {
            return Some(Transition::failed(
                NodeState::IterationEnded,
                NodeOutcome::Interrupted,
                FailureType::Exited,
            ));
        }
    }
    if cond_not_true(plan, node.cond(Condition::End)) {
        return None;
    }
    match node.typ {
        NodeType::List | NodeType::LibraryCall => Some(Transition::to(NodeState::Finishing)),
        _ => Some(post_outcome(plan, n, NodeState::IterationEnded)),
    }
}

// List/LibraryCall only.
fn from_finishing(plan: &Plan, n: NodeId) -> Option<Transition> {
    let node = &plan.nodes[n];
    debug_assert!(node.typ.has_children(), "FINISHING is illegal for {:?}", node.typ);
    if cond_true(plan, ancestor_cond(plan, n, Condition::AncestorExit)) {
        return Some(Transition::failed(
            NodeState::Failing,
            NodeOutcome::Interrupted,
            FailureType::ParentExited,
        ));
    }
    if cond_true(plan, node.cond(Condition::Exit)) {
        return Some(Transition::failed(
            NodeState::Failing,
            NodeOutcome::Interrupted,
            FailureType::Exited,
        ));
    }
    if cond_false(plan, ancestor_cond(plan, n, Condition::AncestorInvariant)) {
        return Some(Transition::failed(
            NodeState::Failing,
            NodeOutcome::Failure,
            FailureType::ParentFailed,
        ));
    }
    if cond_false(plan, node.cond(Condition::Invariant)) {
        return Some(Transition::failed(
            NodeState::Failing,
            NodeOutcome::Failure,
            FailureType::InvariantConditionFailed,
        ));
    }
    if cond_true(plan, node.cond(Condition::ActionComplete)) {
        return Some(post_outcome(plan, n, NodeState::IterationEnded));
    }
    None
}

fn from_failing(plan: &Plan, n: NodeId) -> Option<Transition> {
    let node = &plan.nodes[n];
    debug_assert!(node.typ != NodeType::Empty, "FAILING is illegal for Empty nodes");
    // Commands monitor the abort acknowledgement; everything else waits for
    // its action to complete.
    let gate = match node.typ {
        NodeType::Command => node.cond(Condition::AbortComplete),
        _ => node.cond(Condition::ActionComplete),
    };
    if !cond_true(plan, gate) {
        return None;
    }
    let dest = if node.failure.map(FailureType::is_inherited).unwrap_or(false) {
        NodeState::Finished
    } else {
        NodeState::IterationEnded
    };
    // outcome and failure type were recorded on the way into FAILING
    Some(Transition::to(dest))
}

// Legal successor states: FINISHED, WAITING.
fn from_iteration_ended(plan: &Plan, n: NodeId) -> Option<Transition> {
    let node = &plan.nodes[n];
    if cond_true(plan, ancestor_cond(plan, n, Condition::AncestorExit)) {
        return Some(Transition::failed(
            NodeState::Finished,
            NodeOutcome::Interrupted,
            FailureType::ParentExited,
        ));
    }
    if cond_false(plan, ancestor_cond(plan, n, Condition::AncestorInvariant)) {
        return Some(Transition::failed(
            NodeState::Finished,
            NodeOutcome::Failure,
            FailureType::ParentFailed,
        ));
    }
    if cond_true(plan, ancestor_cond(plan, n, Condition::AncestorEnd)) {
        // outcome and failure type are preserved
        return Some(Transition::to(NodeState::Finished));
    }
    match node.cond(Condition::Repeat) {
        Some(repeat) => match plan.eval_bool(repeat) {
            None => None,
            Some(true) => Some(Transition::to(NodeState::Waiting)),
            Some(false) => Some(Transition::to(NodeState::Finished)),
        },
        None => Some(Transition::to(NodeState::Finished)),
    }
}

// Terminal unless the parent starts a new iteration.
fn from_finished(plan: &Plan, n: NodeId) -> Option<Transition> {
    match plan.nodes[n].parent {
        Some(p) if plan.nodes[p].state == NodeState::Waiting => Some(Transition::to(NodeState::Inactive)),
        _ => None,
    }
}

/// SUCCESS, or FAILURE/POST_CONDITION_FAILED when Post is not known true.
fn post_outcome(plan: &Plan, n: NodeId, dest: NodeState) -> Transition {
    if cond_not_true(plan, plan.nodes[n].cond(Condition::Post)) {
        Transition::failed(dest, NodeOutcome::Failure, FailureType::PostConditionFailed)
    } else {
        Transition::with(dest, NodeOutcome::Success)
    }
}
