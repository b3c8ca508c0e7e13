//! The executive: a single-threaded cooperative scheduler that owns the plan
//! and drives node transitions to quiescence.
//!
//! Each [Executive::step] drains the external input queue, then runs
//! microsteps until no candidate wants to transition: the candidate queue is
//! drained in priority order and destinations are computed for every
//! candidate *before* any transition commits, resource arbitration settles
//! who may enter EXECUTING, the batch commits in order, and queued
//! assignments apply in a dedicated sub-phase so that no transition decision
//! ever sees a half-applied write.

pub mod interface;
pub mod transition;

mod arbiter;
mod queue;

pub use arbiter::Arbiter;
pub use interface::{
    input_channel, AssignmentRequest, CommandRequest, ExternalInterface, InputEvent, LookupRequest, NullInterface,
    UpdateRequest,
};
pub use transition::{destination, Transition};

use crate::core::{CommandHandle, NodeState, QueueStatus, Value};
use crate::expr::ExprId;
use crate::plan::{CommandId, Condition, NodeBody, NodeId, NodeType, Plan};
use crossbeam_channel::{Receiver, Sender};
use env_param::EnvParam;
use itertools::Itertools;
use tracing::{debug, trace, warn};

/// Backstop against a plan that never quiesces within one step.
static MAX_MICROSTEPS: EnvParam<usize> = EnvParam::new("KESTREL_MAX_MICROSTEPS", "10000");

/// If true, every committed transition is logged at debug level.
static LOG_TRANSITIONS: EnvParam<bool> = EnvParam::new("KESTREL_LOG_TRANSITIONS", "true");

pub struct Executive {
    pub plan: Plan,
    io: Box<dyn ExternalInterface>,
    rx: Receiver<InputEvent>,
    /// Candidate queue: (enqueue sequence, node). Drained each microstep in
    /// (priority, sequence) order.
    candidates: Vec<(u64, NodeId)>,
    seq: u64,
    /// Assignments queued by executing nodes, applied in the sub-phase.
    assignment_queue: Vec<(u64, NodeId)>,
    arbiter: Arbiter,
    finished_roots: Vec<NodeId>,
    steps: u64,
}

impl Executive {
    /// Builds an executive over a finalized plan. The interface factory
    /// receives the sender on which acknowledgements and lookup updates are
    /// to be reported.
    pub fn new<F>(plan: Plan, make_io: F) -> Executive
    where
        F: FnOnce(Sender<InputEvent>) -> Box<dyn ExternalInterface>,
    {
        let (tx, rx) = input_channel();
        Executive {
            plan,
            io: make_io(tx),
            rx,
            candidates: Vec::new(),
            seq: 0,
            assignment_queue: Vec::new(),
            arbiter: Arbiter::new(),
            finished_roots: Vec::new(),
            steps: 0,
        }
    }

    /// Activates the root node. The first step after this walks it out of
    /// INACTIVE.
    pub fn start(&mut self) {
        let root = self.plan.root.expect("cannot start a plan without a root node");
        debug!(root = %self.plan.nodes[root].node_id, "plan activated");
        self.enqueue_check(root);
    }

    /// True once the root node has finished and been retired.
    pub fn done(&self) -> bool {
        match self.plan.root {
            Some(root) => matches!(
                self.plan.nodes[root].queue_status,
                QueueStatus::Finished | QueueStatus::Delete
            ),
            None => true,
        }
    }

    /// One scheduler step: drain inputs, microstep to quiescence, retire
    /// finished roots. Returns true if any transition committed or input
    /// arrived.
    pub fn step(&mut self) -> bool {
        self.steps += 1;
        let mut worked = self.drain_inputs();
        self.drain_changed();

        let mut microsteps = 0usize;
        loop {
            if self.candidates.is_empty() {
                break;
            }
            microsteps += 1;
            assert!(
                microsteps <= MAX_MICROSTEPS.get(),
                "step {} exceeded {} microsteps without quiescing",
                self.steps,
                MAX_MICROSTEPS.get()
            );
            worked |= self.microstep();
        }

        self.retire_finished_roots();
        worked
    }

    /// Runs steps until the executive quiesces with an empty input queue, or
    /// `max_steps` elapse. Returns the number of steps taken.
    pub fn run_until_quiescent(&mut self, max_steps: usize) -> usize {
        for i in 0..max_steps {
            let worked = self.step();
            if !worked && self.candidates.is_empty() && self.rx.is_empty() {
                return i + 1;
            }
        }
        max_steps
    }

    // ----------------------------------------------------------- microstep

    fn microstep(&mut self) -> bool {
        // check phase: destinations for the whole batch, priority order
        let batch: Vec<_> = std::mem::take(&mut self.candidates)
            .into_iter()
            .sorted_by_key(|&(seq, n)| (self.plan.nodes[n].priority, seq))
            .collect();

        let mut decided: Vec<(NodeId, Transition)> = Vec::new();
        for (_, n) in batch {
            let was_pending = self.plan.nodes[n].queue_status.is_pending();
            match destination(&self.plan, n) {
                Some(t) => {
                    trace!(node = %self.plan.nodes[n].node_id, ?t, "destination");
                    if was_pending && t.state != NodeState::Executing {
                        // stopped wanting the resources it was parked on
                        self.arbiter.withdraw(&mut self.plan, n);
                    }
                    let node = &mut self.plan.nodes[n];
                    node.queue_status = QueueStatus::Transition;
                    node.next_state = Some(t.state);
                    node.next_outcome = t.outcome;
                    node.next_failure = t.failure;
                    decided.push((n, t));
                }
                None => {
                    self.plan.nodes[n].queue_status = if was_pending {
                        QueueStatus::Pending
                    } else {
                        QueueStatus::None
                    };
                }
            }
        }

        self.arbitrate(&mut decided);

        let worked = !decided.is_empty();
        for (n, t) in decided {
            self.commit(n, t);
        }
        self.drain_changed();

        self.apply_assignments();
        self.drain_changed();

        self.wake_resource_waiters();
        worked
    }

    /// Settle who may enter EXECUTING: same-variable Assignment conflicts go
    /// to the best priority, then each survivor acquires its resource set
    /// all-or-none. Losers are rejected with RESOURCE_CONTENTION; blocked
    /// nodes park as PENDING and do not transition.
    fn arbitrate(&mut self, decided: &mut Vec<(NodeId, Transition)>) {
        use crate::core::{FailureType, NodeOutcome};

        // same-destination conflicts between entering Assignments: lowest
        // priority value wins, ties break on node identity
        let mut winners: hashbrown::HashMap<ExprId, usize> = hashbrown::HashMap::new();
        let mut losers: Vec<usize> = Vec::new();
        for i in 0..decided.len() {
            let (n, t) = decided[i];
            if t.state != NodeState::Executing {
                continue;
            }
            if let Some(var) = self.assignment_dest(n) {
                match winners.get(&var).copied() {
                    None => {
                        winners.insert(var, i);
                    }
                    Some(w) => {
                        let (wn, _) = decided[w];
                        let beats = (self.plan.nodes[n].priority, n) < (self.plan.nodes[wn].priority, wn);
                        if beats {
                            winners.insert(var, i);
                            losers.push(w);
                        } else {
                            losers.push(i);
                        }
                    }
                }
            }
        }
        for i in losers {
            let n = decided[i].0;
            debug!(node = %self.plan.nodes[n].node_id, "lost same-variable arbitration");
            let rejected = Transition {
                state: NodeState::IterationEnded,
                outcome: Some(NodeOutcome::Failure),
                failure: Some(FailureType::ResourceContention),
            };
            decided[i].1 = rejected;
            self.arbiter.withdraw(&mut self.plan, n);
            let node = &mut self.plan.nodes[n];
            node.next_state = Some(rejected.state);
            node.next_outcome = rejected.outcome;
            node.next_failure = rejected.failure;
        }

        // all-or-none acquisition for the survivors
        let mut blocked: Vec<usize> = Vec::new();
        for i in 0..decided.len() {
            let (n, t) = decided[i];
            if t.state != NodeState::Executing || !self.needs_resources(n) {
                continue;
            }
            let mutexes = self.plan.nodes[n].requested.clone();
            let var = self.assignment_dest(n);
            if !self.arbiter.try_acquire(&mut self.plan, n, &mutexes, var) {
                let node = &mut self.plan.nodes[n];
                node.queue_status = QueueStatus::Pending;
                node.next_state = None;
                node.next_outcome = None;
                node.next_failure = None;
                blocked.push(i);
            }
        }
        for i in blocked.into_iter().rev() {
            decided.remove(i);
        }
    }

    fn needs_resources(&self, n: NodeId) -> bool {
        match self.plan.nodes[n].typ {
            NodeType::Assignment => true, // the destination variable is itself a resource
            NodeType::Command => !self.plan.nodes[n].requested.is_empty(),
            _ => false,
        }
    }

    /// Alias-resolved destination variable of an Assignment node.
    fn assignment_dest(&self, n: NodeId) -> Option<ExprId> {
        match &self.plan.nodes[n].body {
            NodeBody::Assignment(a) => Some(self.plan.resolve_alias(a.dest).0),
            _ => None,
        }
    }

    // -------------------------------------------------------------- commit

    fn commit(&mut self, n: NodeId, t: Transition) {
        let from = self.plan.nodes[n].state;
        if from == t.state {
            self.plan.nodes[n].queue_status = QueueStatus::None;
            return;
        }
        assert!(
            self.plan.nodes[n].typ.allows_state(t.state),
            "illegal state {} for node {} of type {:?}",
            t.state,
            self.plan.nodes[n].node_id,
            self.plan.nodes[n].typ
        );
        if LOG_TRANSITIONS.get() {
            debug!(
                node = %self.plan.nodes[n].node_id,
                "{from} -> {} {}{}",
                t.state,
                t.outcome.map(|o| o.to_string()).unwrap_or_default(),
                t.failure.map(|f| format!("/{f}")).unwrap_or_default(),
            );
        }

        self.transition_from(n, from, t.state);

        let time = self.io.current_time();
        {
            let node = &mut self.plan.nodes[n];
            if t.state == NodeState::Inactive {
                node.timepoints.reset();
            }
            node.timepoints.record_exit(from, time);
            node.timepoints.record_entry(t.state, time);
            node.state = t.state;
            node.state_start_time = time;
            if let Some(o) = t.outcome {
                node.outcome = Some(o);
                if let Some(f) = t.failure {
                    node.failure = Some(f);
                }
            }
            node.next_state = None;
            node.next_outcome = None;
            node.next_failure = None;
        }

        self.transition_to(n, t.state);
        self.plan.publish_node_change(n);
        if t.state == NodeState::Executing {
            self.execute(n);
        }

        // a List parent wakes the children that care about its new state
        if self.plan.nodes[n].typ.has_children() {
            let interesting: &[NodeState] = match t.state {
                NodeState::Waiting => &[NodeState::Finished],
                NodeState::Executing | NodeState::Finished => &[NodeState::Inactive],
                _ => &[],
            };
            if !interesting.is_empty() {
                let children: Vec<NodeId> = self.plan.nodes[n].children.clone();
                for c in children {
                    if interesting.contains(&self.plan.nodes[c].state) {
                        self.enqueue_check(c);
                    }
                }
            }
        }

        self.plan.nodes[n].queue_status = QueueStatus::None;
        if t.state == NodeState::Finished && self.plan.nodes[n].parent.is_none() {
            // no parent, no reset: this tree is done for good
            self.plan.nodes[n].queue_status = QueueStatus::Finished;
            self.finished_roots.push(n);
        } else {
            // the new state may already satisfy a guard
            self.enqueue_check(n);
        }
    }

    // -------------------------------------- condition choreography helpers

    fn act(&mut self, n: NodeId, which: Condition) {
        if let Some(slot) = self.plan.nodes[n].conds[which.index()] {
            self.plan.activate_expr(slot.expr, &mut *self.io);
        }
    }

    fn deact(&mut self, n: NodeId, which: Condition) {
        if let Some(slot) = self.plan.nodes[n].conds[which.index()] {
            self.plan.deactivate_expr(slot.expr, &mut *self.io);
        }
    }

    /// A node's ancestor conditions are its parent's combined slots.
    fn act_ancestor(&mut self, n: NodeId, which: Condition) {
        if let Some(p) = self.plan.nodes[n].parent {
            if let Some(e) = self.plan.nodes[p].cond(which) {
                self.plan.activate_expr(e, &mut *self.io);
            }
        }
    }

    fn deact_ancestor(&mut self, n: NodeId, which: Condition) {
        if let Some(p) = self.plan.nodes[n].parent {
            if let Some(e) = self.plan.nodes[p].cond(which) {
                self.plan.deactivate_expr(e, &mut *self.io);
            }
        }
    }

    fn act_local_variables(&mut self, n: NodeId) {
        let locals = self.plan.nodes[n].local_decls.clone();
        for v in locals {
            self.plan.activate_expr(v, &mut *self.io);
        }
    }

    fn deact_local_variables(&mut self, n: NodeId) {
        let locals = self.plan.nodes[n].local_decls.clone();
        for v in locals {
            self.plan.deactivate_expr(v, &mut *self.io);
        }
    }

    /// Deactivations on leaving `from`, plus the activations that prepare
    /// `to` where the original choreography ties them to the exit edge.
    fn transition_from(&mut self, n: NodeId, from: NodeState, to: NodeState) {
        use Condition::*;
        let typ = self.plan.nodes[n].typ;
        match from {
            NodeState::Inactive => {
                if to == NodeState::Waiting {
                    self.act_ancestor(n, AncestorExit);
                    self.act_ancestor(n, AncestorInvariant);
                    self.act_ancestor(n, AncestorEnd);
                }
            }
            NodeState::Waiting => {
                self.deact(n, Pre);
                self.deact(n, Skip);
                self.deact(n, Start);
                match to {
                    NodeState::Executing => self.deact_ancestor(n, AncestorEnd),
                    NodeState::Finished => {
                        self.deact_ancestor(n, AncestorExit);
                        self.deact_ancestor(n, AncestorInvariant);
                        self.deact_ancestor(n, AncestorEnd);
                        self.deact(n, Exit);
                    }
                    NodeState::IterationEnded => self.deact(n, Exit),
                    _ => unreachable!("WAITING cannot reach {to}"),
                }
            }
            NodeState::Executing => match typ {
                NodeType::Empty => {
                    self.deact(n, Exit);
                    self.deact(n, Invariant);
                    self.deact(n, End);
                    self.deact(n, Post);
                    match to {
                        NodeState::Finished => {
                            self.deact_ancestor(n, AncestorExit);
                            self.deact_ancestor(n, AncestorInvariant);
                        }
                        NodeState::IterationEnded => self.act_ancestor(n, AncestorEnd),
                        _ => unreachable!("Empty node cannot reach {to} from EXECUTING"),
                    }
                    self.deactivate_executable(n);
                }
                NodeType::List | NodeType::LibraryCall => {
                    self.deact(n, End);
                    match to {
                        NodeState::Failing => {
                            self.deact_ancestor(n, AncestorExit);
                            self.deact_ancestor(n, AncestorInvariant);
                            self.deact(n, Exit);
                            self.deact(n, Invariant);
                            self.act(n, ActionComplete);
                        }
                        NodeState::Finishing => self.act(n, ActionComplete),
                        _ => unreachable!("List node cannot reach {to} from EXECUTING"),
                    }
                }
                NodeType::Assignment | NodeType::Command | NodeType::Update => {
                    self.deact(n, Exit);
                    self.deact(n, Invariant);
                    self.deact(n, End);
                    self.deact(n, Post);
                    match to {
                        NodeState::Failing => {
                            self.deact_ancestor(n, AncestorExit);
                            self.deact_ancestor(n, AncestorInvariant);
                            if typ == NodeType::Command {
                                self.act(n, AbortComplete);
                            } else {
                                self.act(n, ActionComplete);
                            }
                        }
                        NodeState::IterationEnded => {
                            self.deactivate_executable(n);
                            self.act_ancestor(n, AncestorEnd);
                        }
                        _ => unreachable!("action node cannot reach {to} from EXECUTING"),
                    }
                }
            },
            NodeState::Finishing => {
                self.deact(n, Exit);
                self.deact(n, Invariant);
                self.deact(n, Post);
                match to {
                    NodeState::IterationEnded => {
                        // these are the children's conditions
                        self.deact(n, AncestorExit);
                        self.deact(n, AncestorInvariant);
                        self.deact(n, AncestorEnd);
                        self.deact(n, ActionComplete);
                        self.deactivate_executable(n);
                        self.act_ancestor(n, AncestorEnd);
                    }
                    NodeState::Failing => {
                        self.deact_ancestor(n, AncestorExit);
                        self.deact_ancestor(n, AncestorInvariant);
                    }
                    _ => unreachable!("List node cannot reach {to} from FINISHING"),
                }
            }
            NodeState::Failing => {
                match typ {
                    NodeType::List | NodeType::LibraryCall => {
                        self.deact(n, Condition::AncestorExit);
                        self.deact(n, Condition::AncestorInvariant);
                        self.deact(n, Condition::AncestorEnd);
                        self.deact(n, ActionComplete);
                    }
                    NodeType::Command => self.deact(n, AbortComplete),
                    _ => self.deact(n, ActionComplete),
                }
                self.deactivate_executable(n);
                if to == NodeState::IterationEnded {
                    self.act_ancestor(n, AncestorExit);
                    self.act_ancestor(n, AncestorInvariant);
                    self.act_ancestor(n, AncestorEnd);
                }
            }
            NodeState::IterationEnded => {
                self.deact(n, Repeat);
                match to {
                    NodeState::Finished => {
                        self.deact_ancestor(n, AncestorExit);
                        self.deact_ancestor(n, AncestorInvariant);
                        self.deact_ancestor(n, AncestorEnd);
                    }
                    NodeState::Waiting => self.plan.nodes[n].reset(),
                    _ => unreachable!("ITERATION_ENDED cannot reach {to}"),
                }
            }
            NodeState::Finished => self.plan.nodes[n].reset(),
        }
    }

    /// Activations and entry actions on arriving in `to`.
    fn transition_to(&mut self, n: NodeId, to: NodeState) {
        use Condition::*;
        let typ = self.plan.nodes[n].typ;
        match to {
            NodeState::Inactive => {
                // timepoints were reset in commit; nothing to activate
            }
            NodeState::Waiting => {
                self.act(n, Exit);
                self.act(n, Pre);
                self.act(n, Skip);
                self.act(n, Start);
            }
            NodeState::Executing => {
                self.act_local_variables(n);
                self.act(n, Invariant);
                self.act(n, End);
                match typ {
                    NodeType::List | NodeType::LibraryCall => {
                        // combined conditions for the children
                        self.act(n, AncestorExit);
                        self.act(n, AncestorInvariant);
                        self.act(n, AncestorEnd);
                    }
                    _ => self.act(n, Post),
                }
            }
            NodeState::Finishing => self.act(n, Post),
            NodeState::Failing => match typ {
                NodeType::Command => {
                    let cid = self.command_id(n);
                    self.plan.commands[cid].abort_pending = true;
                    self.io.abort_command(cid);
                }
                NodeType::Assignment => self.abort_assignment(n),
                _ => {}
            },
            NodeState::IterationEnded => self.act(n, Repeat),
            NodeState::Finished => {
                debug_assert!(
                    self.plan.nodes[n].using.is_empty(),
                    "node {} finished while holding resources",
                    self.plan.nodes[n].node_id
                );
            }
        }
    }

    // ---------------------------------------------------- body execution

    fn command_id(&self, n: NodeId) -> CommandId {
        match self.plan.nodes[n].body {
            NodeBody::Command(cid) => cid,
            _ => panic!("node {} has no command body", self.plan.nodes[n].node_id),
        }
    }

    /// Entry actions of EXECUTING: activate the body and publish its effect.
    fn execute(&mut self, n: NodeId) {
        match self.plan.nodes[n].typ {
            NodeType::Empty | NodeType::List | NodeType::LibraryCall => {}
            NodeType::Assignment => {
                let (dest, rhs, ack, abort_ack) = match &self.plan.nodes[n].body {
                    NodeBody::Assignment(a) => (a.dest, a.rhs, a.ack, a.abort_ack),
                    _ => unreachable!(),
                };
                for e in [dest, rhs, ack, abort_ack] {
                    self.plan.activate_expr(e, &mut *self.io);
                }
                // the RHS is evaluated exactly once, here
                let value = self.plan.eval(rhs);
                if let NodeBody::Assignment(a) = &mut self.plan.nodes[n].body {
                    a.value = Some(value);
                    a.queued = true;
                }
                self.assignment_queue.push((self.seq, n));
                self.seq += 1;
            }
            NodeType::Command => {
                let cid = self.command_id(n);
                let (name, args, dest, handle, abort_complete) = {
                    let c = &self.plan.commands[cid];
                    (c.name, c.args.clone(), c.dest, c.handle, c.abort_complete)
                };
                self.plan.activate_expr(name, &mut *self.io);
                for a in &args {
                    self.plan.activate_expr(*a, &mut *self.io);
                }
                if let Some(d) = dest {
                    self.plan.activate_expr(d, &mut *self.io);
                }
                self.plan.activate_expr(handle, &mut *self.io);
                self.plan.activate_expr(abort_complete, &mut *self.io);

                let name_value = self.plan.eval(name);
                match name_value.as_str() {
                    Some(cmd_name) => {
                        let request = CommandRequest {
                            name: cmd_name.to_string(),
                            args: args.iter().map(|a| self.plan.eval(*a)).collect(),
                            resources: self.plan.commands[cid]
                                .resources
                                .iter()
                                .map(|r| self.plan.mutexes[r.mutex].name.clone())
                                .collect(),
                        };
                        self.plan.commands[cid].pending = true;
                        debug!(node = %self.plan.nodes[n].node_id, command = %request.name, "command dispatched");
                        self.io.execute_command(cid, &request);
                    }
                    None => {
                        warn!(node = %self.plan.nodes[n].node_id, "command name evaluated to {name_value}, not a String");
                        self.plan.write_var(handle, Value::CommandHandle(CommandHandle::InterfaceError));
                    }
                }
            }
            NodeType::Update => {
                let (pairs, ack) = match &self.plan.nodes[n].body {
                    NodeBody::Update(u) => (u.pairs.clone(), u.ack),
                    _ => unreachable!(),
                };
                for (_, e) in &pairs {
                    self.plan.activate_expr(*e, &mut *self.io);
                }
                self.plan.activate_expr(ack, &mut *self.io);
                let request = UpdateRequest {
                    pairs: pairs.iter().map(|(k, e)| (k.clone(), self.plan.eval(*e))).collect(),
                };
                if let NodeBody::Update(u) = &mut self.plan.nodes[n].body {
                    u.pending = true;
                }
                debug!(node = %self.plan.nodes[n].node_id, "update dispatched");
                self.io.execute_update(n, &request);
            }
        }
    }

    /// Undo of [Executive::execute]: deactivate the body and the local
    /// variables, release anything still held.
    fn deactivate_executable(&mut self, n: NodeId) {
        match self.plan.nodes[n].typ {
            NodeType::Empty | NodeType::List | NodeType::LibraryCall => {}
            NodeType::Assignment => {
                let (dest, rhs, ack, abort_ack, queued) = match &self.plan.nodes[n].body {
                    NodeBody::Assignment(a) => (a.dest, a.rhs, a.ack, a.abort_ack, a.queued),
                    _ => unreachable!(),
                };
                debug_assert!(!queued, "assignment of node {} still queued", self.plan.nodes[n].node_id);
                for e in [dest, rhs, ack, abort_ack] {
                    self.plan.deactivate_expr(e, &mut *self.io);
                }
                self.arbiter.release_all(&mut self.plan, n);
            }
            NodeType::Command => {
                let cid = self.command_id(n);
                let (name, args, dest, handle, abort_complete) = {
                    let c = &self.plan.commands[cid];
                    (c.name, c.args.clone(), c.dest, c.handle, c.abort_complete)
                };
                self.plan.commands[cid].pending = false;
                self.plan.commands[cid].abort_pending = false;
                self.plan.deactivate_expr(name, &mut *self.io);
                for a in args {
                    self.plan.deactivate_expr(a, &mut *self.io);
                }
                if let Some(d) = dest {
                    self.plan.deactivate_expr(d, &mut *self.io);
                }
                self.plan.deactivate_expr(handle, &mut *self.io);
                self.plan.deactivate_expr(abort_complete, &mut *self.io);
                self.arbiter.release_all(&mut self.plan, n);
            }
            NodeType::Update => {
                let (pairs, ack) = match &self.plan.nodes[n].body {
                    NodeBody::Update(u) => (u.pairs.clone(), u.ack),
                    _ => unreachable!(),
                };
                if let NodeBody::Update(u) = &mut self.plan.nodes[n].body {
                    u.pending = false;
                }
                for (_, e) in pairs {
                    self.plan.deactivate_expr(e, &mut *self.io);
                }
                self.plan.deactivate_expr(ack, &mut *self.io);
            }
        }
        self.deact_local_variables(n);
    }

    // ------------------------------------------------ assignment sub-phase

    /// Applies queued assignments in priority order (ties by queue order).
    /// The destination write, the ack, and the resource release happen here,
    /// after every transition decision of the microstep.
    fn apply_assignments(&mut self) {
        if self.assignment_queue.is_empty() {
            return;
        }
        let queue: Vec<_> = std::mem::take(&mut self.assignment_queue)
            .into_iter()
            .sorted_by_key(|&(seq, n)| (self.plan.nodes[n].priority, seq))
            .collect();
        for (_, n) in queue {
            let (dest, ack, value) = match &mut self.plan.nodes[n].body {
                NodeBody::Assignment(a) => {
                    if !a.queued {
                        continue; // aborted before application
                    }
                    a.queued = false;
                    (a.dest, a.ack, a.value.take().expect("queued assignment without snapshot"))
                }
                _ => unreachable!(),
            };
            let (root, _) = self.plan.resolve_alias(dest);
            let variable = match &self.plan.exprs[root].kind {
                crate::expr::ExprKind::Var(v) => v.name.clone(),
                _ => unreachable!("builder guarantees a variable destination"),
            };
            debug!(node = %self.plan.nodes[n].node_id, %variable, %value, "assignment applied");
            self.io.execute_assignment(&AssignmentRequest {
                node: n,
                variable,
                value: value.clone(),
            });
            self.plan.write_var(dest, value);
            self.plan.write_var(ack, Value::Boolean(true));
            self.arbiter.release_all(&mut self.plan, n);
        }
    }

    /// Discard a queued-but-unapplied assignment; both acks go true and the
    /// resources return to the pool.
    fn abort_assignment(&mut self, n: NodeId) {
        let (ack, abort_ack) = match &mut self.plan.nodes[n].body {
            NodeBody::Assignment(a) => {
                a.queued = false;
                a.value = None;
                (a.ack, a.abort_ack)
            }
            _ => unreachable!(),
        };
        debug!(node = %self.plan.nodes[n].node_id, "assignment aborted");
        self.plan.write_var(abort_ack, Value::Boolean(true));
        self.plan.write_var(ack, Value::Boolean(true));
        self.arbiter.release_all(&mut self.plan, n);
    }

    // ------------------------------------------------------------- inputs

    /// Applies queued acknowledgements and lookup updates. Writes publish
    /// through the expression graph; affected nodes queue up for the
    /// microstep loop.
    fn drain_inputs(&mut self) -> bool {
        let mut any = false;
        while let Ok(ev) = self.rx.try_recv() {
            any = true;
            trace!(?ev, "input event");
            match ev {
                InputEvent::CommandHandle { command, handle } => self.apply_command_handle(command, handle),
                InputEvent::CommandReturn { command, value } => {
                    let c = &self.plan.commands[command];
                    if !c.pending {
                        warn!(command = ?command, "return value for a command that is not pending");
                        continue;
                    }
                    match c.dest {
                        Some(d) => self.plan.write_var(d, value),
                        None => warn!(command = ?command, "return value for a command without destination"),
                    }
                }
                InputEvent::CommandAbortAck { command, success } => {
                    let c = &mut self.plan.commands[command];
                    if !c.abort_pending {
                        warn!(command = ?command, "abort acknowledgement without outstanding abort");
                        continue;
                    }
                    c.abort_pending = false;
                    let flag = c.abort_complete;
                    debug!(command = ?command, success, "abort acknowledged");
                    self.plan.write_var(flag, Value::Boolean(true));
                }
                InputEvent::UpdateAck { node, success } => {
                    let ack = match &mut self.plan.nodes[node].body {
                        NodeBody::Update(u) if u.pending => {
                            u.pending = false;
                            Some(u.ack)
                        }
                        _ => {
                            warn!(node = %self.plan.nodes[node].node_id, "update acknowledgement without outstanding update");
                            None
                        }
                    };
                    if let Some(ack) = ack {
                        debug!(node = %self.plan.nodes[node].node_id, success, "update acknowledged");
                        self.plan.write_var(ack, Value::Boolean(true));
                    }
                }
                InputEvent::LookupUpdate { lookup, value } => self.plan.write_lookup(lookup, value),
            }
        }
        any
    }

    /// Handle writes follow the interface protocol; a violating value
    /// degrades to INTERFACE_ERROR and the node fails out of EXECUTING.
    fn apply_command_handle(&mut self, command: CommandId, handle: CommandHandle) {
        let c = &self.plan.commands[command];
        if !c.pending {
            warn!(command = ?command, ?handle, "handle value for a command that is not pending");
            return;
        }
        let handle_var = c.handle;
        let previous = self.plan.eval(handle_var).as_command_handle();
        let effective = match previous {
            None => handle,
            Some(prev) if handle.may_follow(prev) => handle,
            Some(prev) => {
                warn!(command = ?command, ?prev, ?handle, "command handle protocol violation");
                CommandHandle::InterfaceError
            }
        };
        self.plan.write_var(handle_var, Value::CommandHandle(effective));
        if effective.is_terminal() {
            self.plan.commands[command].pending = false;
        }
    }

    // ------------------------------------------------------------ cleanup

    /// DELETE is terminal: the node leaves every queue and will never be
    /// enqueued again.
    fn retire_finished_roots(&mut self) {
        for n in std::mem::take(&mut self.finished_roots) {
            debug!(node = %self.plan.nodes[n].node_id, "root finished, retiring");
            self.plan.nodes[n].queue_status = QueueStatus::Delete;
            self.candidates.retain(|(_, c)| *c != n);
        }
    }

    // --------------------------------------------------------- invariants

    /// Structural invariants checked by tests after every step.
    pub fn check_consistency(&self) {
        for (n, node) in self.plan.nodes.entries() {
            assert!(
                node.typ.allows_state(node.state),
                "node {} of type {:?} is in illegal state {}",
                node.node_id,
                node.typ,
                node.state
            );
            if node.typ.has_children() && node.state == NodeState::Finished {
                for c in &node.children {
                    assert_eq!(
                        self.plan.nodes[*c].state,
                        NodeState::Finished,
                        "finished parent {} has unfinished child {}",
                        node.node_id,
                        self.plan.nodes[*c].node_id
                    );
                }
            }
            if node.queue_status.is_pending() {
                assert!(
                    self.arbiter.is_waiting(&self.plan, n),
                    "pending node {} is on no wait list",
                    node.node_id
                );
            }
        }
        for (mid, m) in self.plan.mutexes.entries() {
            if let Some(h) = m.holder {
                assert!(
                    self.plan.nodes[h].using.contains(&mid),
                    "mutex {} held by {} but absent from its using list",
                    m.name,
                    self.plan.nodes[h].node_id
                );
            }
        }
    }
}
