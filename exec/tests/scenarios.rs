//! End-to-end scenarios: whole plans run against a scripted interface.

use kestrel::core::{CommandHandle, FailureType, NodeOutcome, NodeState, Value, ValueType};
use kestrel::exec::{
    CommandRequest, Executive, ExternalInterface, InputEvent, LookupRequest, NullInterface, UpdateRequest,
};
use kestrel::expr::{ExprId, ExprKind, Op};
use kestrel::plan::{CommandDecl, CommandId, Condition, NodeId, NodeType, PlanBuilder, SymbolTable};
use crossbeam_channel::Sender;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Shared recording state of the scripted interface.
#[derive(Default)]
struct SimState {
    dispatched: Vec<(CommandId, CommandRequest)>,
    aborted: Vec<CommandId>,
    updates: Vec<(NodeId, UpdateRequest)>,
    lookups: HashMap<ExprId, String>,
    unsubscribed: Vec<ExprId>,
    /// Clone of the executive's input sender, for injecting world changes.
    tx: Option<Sender<InputEvent>>,
}

/// Scripted environment: answers command dispatches with a canned handle
/// sequence per command name, acknowledges aborts and updates immediately.
struct SimInterface {
    tx: Sender<InputEvent>,
    clock: f64,
    handle_scripts: HashMap<String, Vec<CommandHandle>>,
    state: Rc<RefCell<SimState>>,
}

impl ExternalInterface for SimInterface {
    fn current_time(&mut self) -> f64 {
        self.clock += 1.0;
        self.clock
    }

    fn execute_command(&mut self, command: CommandId, request: &CommandRequest) {
        self.state.borrow_mut().dispatched.push((command, request.clone()));
        if let Some(script) = self.handle_scripts.get(&request.name) {
            for handle in script {
                self.tx
                    .send(InputEvent::CommandHandle {
                        command,
                        handle: *handle,
                    })
                    .unwrap();
            }
        }
    }

    fn abort_command(&mut self, command: CommandId) {
        self.state.borrow_mut().aborted.push(command);
        self.tx
            .send(InputEvent::CommandAbortAck { command, success: true })
            .unwrap();
    }

    fn execute_update(&mut self, node: NodeId, request: &UpdateRequest) {
        self.state.borrow_mut().updates.push((node, request.clone()));
        self.tx.send(InputEvent::UpdateAck { node, success: true }).unwrap();
    }

    fn lookup_now(&mut self, _request: &LookupRequest) -> Value {
        Value::Unknown
    }

    fn subscribe_lookup(&mut self, lookup: ExprId, request: &LookupRequest, _tolerance: Option<f64>) {
        self.state.borrow_mut().lookups.insert(lookup, request.state_name.clone());
    }

    fn unsubscribe_lookup(&mut self, lookup: ExprId) {
        let mut state = self.state.borrow_mut();
        state.lookups.remove(&lookup);
        state.unsubscribed.push(lookup);
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn sim_executive(
    plan: kestrel::plan::Plan,
    scripts: &[(&str, &[CommandHandle])],
) -> (Executive, Rc<RefCell<SimState>>) {
    init_logging();
    let state = Rc::new(RefCell::new(SimState::default()));
    let shared = state.clone();
    let handle_scripts: HashMap<String, Vec<CommandHandle>> = scripts
        .iter()
        .map(|(name, seq)| (name.to_string(), seq.to_vec()))
        .collect();
    let exec = Executive::new(plan, move |tx| {
        shared.borrow_mut().tx = Some(tx.clone());
        Box::new(SimInterface {
            tx,
            clock: 0.0,
            handle_scripts,
            state: shared,
        })
    });
    (exec, state)
}

/// The last stored value of a variable, bypassing the activation gate.
fn peek_var(exec: &Executive, e: ExprId) -> Value {
    match &exec.plan.exprs[e].kind {
        ExprKind::Var(v) => v.value.clone(),
        other => panic!("not a variable: {other:?}"),
    }
}

fn run(exec: &mut Executive) {
    init_logging();
    exec.start();
    exec.run_until_quiescent(100);
    exec.check_consistency();
}

fn noop_symbols() -> SymbolTable {
    let mut symbols = SymbolTable::new();
    symbols
        .declare_command(
            "noop",
            CommandDecl {
                return_type: None,
                param_types: vec![],
                any_params: false,
            },
        )
        .unwrap();
    symbols
        .declare_command(
            "hold",
            CommandDecl {
                return_type: None,
                param_types: vec![],
                any_params: false,
            },
        )
        .unwrap();
    symbols
}

#[test]
fn empty_node_pre_failure() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::Empty, "root").unwrap();
    let f = b.const_value(false);
    b.set_condition(root, Condition::Pre, f).unwrap();
    let plan = b.finish().unwrap();

    let mut exec = Executive::new(plan, |_tx| Box::new(NullInterface));
    run(&mut exec);

    let node = &exec.plan.nodes[root];
    assert_eq!(node.state, NodeState::Finished);
    assert_eq!(node.outcome, Some(NodeOutcome::Failure));
    assert_eq!(node.failure, Some(FailureType::PreConditionFailed));
    // passed through WAITING and ITERATION_ENDED, never EXECUTING
    assert!(node.timepoints.get(NodeState::Waiting, false).is_some());
    assert!(node.timepoints.get(NodeState::IterationEnded, false).is_some());
    assert!(node.timepoints.get(NodeState::Executing, false).is_none());
    assert!(exec.done());
}

#[test]
fn skipped_child() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let child = b.add_node(Some(root), NodeType::Empty, "child").unwrap();
    let t = b.const_value(true);
    b.set_condition(child, Condition::Skip, t).unwrap();
    let plan = b.finish().unwrap();

    let mut exec = Executive::new(plan, |_tx| Box::new(NullInterface));
    run(&mut exec);

    let c = &exec.plan.nodes[child];
    assert_eq!(c.state, NodeState::Finished);
    assert_eq!(c.outcome, Some(NodeOutcome::Skipped));
    assert!(c.timepoints.get(NodeState::Executing, false).is_none(), "skipped child must not execute");

    let r = &exec.plan.nodes[root];
    assert_eq!(r.state, NodeState::Finished);
    assert_eq!(r.outcome, Some(NodeOutcome::Success));
}

#[test]
fn counted_loop() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let zero = b.const_value(0);
    let i = b.declare_variable(root, "i", ValueType::Integer, Some(zero)).unwrap();
    let three = b.const_value(3);
    let end = b.apply(Op::Ge, vec![i, three]).unwrap();
    b.set_condition(root, Condition::End, end).unwrap();

    let child = b.add_node(Some(root), NodeType::Assignment, "inc").unwrap();
    let i_ref = b.var_ref(child, "i").unwrap();
    let one = b.const_value(1);
    let rhs = b.apply(Op::Add, vec![i_ref, one]).unwrap();
    b.set_assignment(child, i_ref, rhs).unwrap();
    let t = b.const_value(true);
    b.set_condition(child, Condition::Repeat, t).unwrap();
    let plan = b.finish().unwrap();

    let mut exec = Executive::new(plan, |_tx| Box::new(NullInterface));
    run(&mut exec);

    assert_eq!(exec.plan.nodes[root].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
    assert_eq!(exec.plan.nodes[child].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[child].outcome, Some(NodeOutcome::Success));
    assert_eq!(peek_var(&exec, i), Value::Integer(3), "child must run exactly three times");
}

#[test]
fn command_with_handle() {
    let mut b = PlanBuilder::new(noop_symbols());
    let root = b.add_node(None, NodeType::Command, "cmd").unwrap();
    let name = b.const_value("noop");
    let cid = b.set_command(root, name, vec![], None, vec![]).unwrap();
    let plan = b.finish().unwrap();

    let (mut exec, state) = sim_executive(
        plan,
        &[("noop", &[CommandHandle::Sent, CommandHandle::Received, CommandHandle::Success])],
    );
    run(&mut exec);

    let node = &exec.plan.nodes[root];
    assert_eq!(node.state, NodeState::Finished);
    assert_eq!(node.outcome, Some(NodeOutcome::Success));
    assert!(node.timepoints.get(NodeState::Executing, false).is_some());
    let handle_var = exec.plan.commands[cid].handle;
    assert_eq!(peek_var(&exec, handle_var), Value::CommandHandle(CommandHandle::Success));
    assert_eq!(state.borrow().dispatched.len(), 1);
    assert_eq!(state.borrow().dispatched[0].1.name, "noop");
}

#[test]
fn exit_during_execution() {
    let mut b = PlanBuilder::new(noop_symbols());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let f = b.const_value(false);
    let exit_flag = b.declare_variable(root, "stop", ValueType::Boolean, Some(f)).unwrap();
    b.set_condition(root, Condition::Exit, exit_flag).unwrap();

    let child = b.add_node(Some(root), NodeType::Command, "c").unwrap();
    let name = b.const_value("hold");
    let cid = b.set_command(child, name, vec![], None, vec![]).unwrap();
    let plan = b.finish().unwrap();

    // "hold" has no script: the command stays in flight until aborted
    let (mut exec, state) = sim_executive(plan, &[]);
    exec.start();
    exec.run_until_quiescent(100);
    assert_eq!(exec.plan.nodes[child].state, NodeState::Executing);
    assert!(exec.plan.commands[cid].pending);

    exec.plan.write_var(exit_flag, Value::Boolean(true));
    exec.run_until_quiescent(100);
    exec.check_consistency();

    assert_eq!(state.borrow().aborted, vec![cid], "abort must be requested exactly once");
    let c = &exec.plan.nodes[child];
    assert_eq!(c.state, NodeState::Finished);
    assert_eq!(c.outcome, Some(NodeOutcome::Interrupted));
    assert_eq!(c.failure, Some(FailureType::ParentExited));
    assert!(c.timepoints.get(NodeState::Failing, false).is_some(), "command must pass through FAILING");

    let r = &exec.plan.nodes[root];
    assert_eq!(r.state, NodeState::Finished);
    assert_eq!(r.outcome, Some(NodeOutcome::Interrupted));
    assert_eq!(r.failure, Some(FailureType::Exited));
    assert!(r.timepoints.get(NodeState::IterationEnded, false).is_some());
    assert!(exec.done());
}

#[test]
fn mutex_contention() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    b.declare_mutex(root, "m").unwrap();
    let f = b.const_value(false);
    let go = b.declare_variable(root, "go", ValueType::Boolean, Some(f)).unwrap();
    let zero = b.const_value(0);
    let x = b.declare_variable(root, "x", ValueType::Integer, Some(zero)).unwrap();
    let zero2 = b.const_value(0);
    let y = b.declare_variable(root, "y", ValueType::Integer, Some(zero2)).unwrap();

    let mut assign = |b: &mut PlanBuilder, id: &str, dest: ExprId| -> NodeId {
        let n = b.add_node(Some(root), NodeType::Assignment, id).unwrap();
        let one = b.const_value(1);
        b.set_assignment(n, dest, one).unwrap();
        b.use_mutex(n, "m").unwrap();
        let start = b.var_ref(n, "go").unwrap();
        b.set_condition(n, Condition::Start, start).unwrap();
        n
    };
    let a = assign(&mut b, "a", x);
    let bb = assign(&mut b, "b", y);
    let plan = b.finish().unwrap();

    let (mut exec, _) = sim_executive(plan, &[]);
    exec.start();
    exec.run_until_quiescent(100);
    assert_eq!(exec.plan.nodes[a].state, NodeState::Waiting);
    assert_eq!(exec.plan.nodes[bb].state, NodeState::Waiting);

    // both start conditions become true in the same pulse
    exec.plan.write_var(go, Value::Boolean(true));
    exec.run_until_quiescent(100);
    exec.check_consistency();

    for n in [a, bb] {
        assert_eq!(exec.plan.nodes[n].state, NodeState::Finished);
        assert_eq!(exec.plan.nodes[n].outcome, Some(NodeOutcome::Success));
    }
    assert_eq!(peek_var(&exec, x), Value::Integer(1));
    assert_eq!(peek_var(&exec, y), Value::Integer(1));
    // the loser entered EXECUTING only after the winner released the mutex
    let ta = exec.plan.nodes[a].timepoints.get(NodeState::Executing, false).unwrap();
    let tb = exec.plan.nodes[bb].timepoints.get(NodeState::Executing, false).unwrap();
    assert_ne!(ta, tb, "one assignment must wait for the other");
    for (_, m) in exec.plan.mutexes.entries() {
        assert!(m.is_free());
        assert!(m.waiters.is_empty());
    }
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
}

#[test]
fn same_variable_priority_arbitration() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let zero = b.const_value(0);
    let x = b.declare_variable(root, "x", ValueType::Integer, Some(zero)).unwrap();

    let urgent = b.add_node(Some(root), NodeType::Assignment, "urgent").unwrap();
    let ten = b.const_value(10);
    b.set_assignment(urgent, x, ten).unwrap();
    b.set_priority(urgent, 1).unwrap();

    let casual = b.add_node(Some(root), NodeType::Assignment, "casual").unwrap();
    let twenty = b.const_value(20);
    b.set_assignment(casual, x, twenty).unwrap();
    b.set_priority(casual, 5).unwrap();
    let plan = b.finish().unwrap();

    let mut exec = Executive::new(plan, |_tx| Box::new(NullInterface));
    run(&mut exec);

    assert_eq!(peek_var(&exec, x), Value::Integer(10), "the lower priority value wins");
    assert_eq!(exec.plan.nodes[urgent].outcome, Some(NodeOutcome::Success));
    let loser = &exec.plan.nodes[casual];
    assert_eq!(loser.outcome, Some(NodeOutcome::Failure));
    assert_eq!(loser.failure, Some(FailureType::ResourceContention));
    assert_eq!(loser.state, NodeState::Finished);
}

#[test]
fn update_node_acknowledged() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let upd = b.add_node(Some(root), NodeType::Update, "report").unwrap();
    let alt = b.const_value(42.5);
    b.set_update(upd, vec![("altitude".to_string(), alt)]).unwrap();
    let plan = b.finish().unwrap();

    let (mut exec, state) = sim_executive(plan, &[]);
    run(&mut exec);

    assert_eq!(exec.plan.nodes[upd].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[upd].outcome, Some(NodeOutcome::Success));
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
    let updates = &state.borrow().updates;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.pairs, vec![("altitude".to_string(), Value::Real(42.5))]);
}

#[test]
fn library_call_scoping_barrier() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let t = b.const_value(true);
    let flag = b.declare_variable(root, "flag", ValueType::Boolean, Some(t)).unwrap();
    let f = b.const_value(false);
    b.declare_variable(root, "hidden", ValueType::Boolean, Some(f)).unwrap();

    let call = b.add_node(Some(root), NodeType::LibraryCall, "call").unwrap();
    b.set_library_aliases(call, vec![("go".to_string(), flag, false)]).unwrap();
    let callee = b.add_node(Some(call), NodeType::Empty, "lib").unwrap();
    let go_ref = b.var_ref(callee, "go").unwrap();
    b.set_condition(callee, Condition::Pre, go_ref).unwrap();
    // the caller's other locals are invisible behind the alias barrier
    assert!(b.var_ref(callee, "hidden").is_err());
    let plan = b.finish().unwrap();

    let mut exec = Executive::new(plan, |_tx| Box::new(NullInterface));
    run(&mut exec);

    assert_eq!(exec.plan.nodes[callee].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[callee].outcome, Some(NodeOutcome::Success));
    assert_eq!(exec.plan.nodes[call].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
}

#[test]
fn childless_list_finishes_immediately() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let plan = b.finish().unwrap();

    let mut exec = Executive::new(plan, |_tx| Box::new(NullInterface));
    run(&mut exec);

    // the synthesized all-children-finished End is vacuously true
    assert_eq!(exec.plan.nodes[root].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
}

#[test]
fn repeating_list_restores_locals_each_iteration() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::List, "root").unwrap();
    let zero = b.const_value(0);
    let j = b.declare_variable(root, "j", ValueType::Integer, Some(zero)).unwrap();

    let inner = b.add_node(Some(root), NodeType::List, "iter").unwrap();
    let zero2 = b.const_value(0);
    let k = b.declare_variable(inner, "k", ValueType::Integer, Some(zero2)).unwrap();
    let two = b.const_value(2);
    let repeat = b.apply(Op::Lt, vec![j, two]).unwrap();
    b.set_condition(inner, Condition::Repeat, repeat).unwrap();

    let inc_j = b.add_node(Some(inner), NodeType::Assignment, "inc_j").unwrap();
    let jr = b.var_ref(inc_j, "j").unwrap();
    let one = b.const_value(1);
    let j_rhs = b.apply(Op::Add, vec![jr, one]).unwrap();
    b.set_assignment(inc_j, jr, j_rhs).unwrap();

    let inc_k = b.add_node(Some(inner), NodeType::Assignment, "inc_k").unwrap();
    let kr = b.var_ref(inc_k, "k").unwrap();
    let one2 = b.const_value(1);
    let k_rhs = b.apply(Op::Add, vec![kr, one2]).unwrap();
    b.set_assignment(inc_k, kr, k_rhs).unwrap();
    let plan = b.finish().unwrap();

    let (mut exec, _) = sim_executive(plan, &[]);
    run(&mut exec);

    assert_eq!(exec.plan.nodes[root].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
    // j lives on the root and accumulates across the inner list's iterations
    assert_eq!(peek_var(&exec, j), Value::Integer(2), "inner list must run twice");
    // k lives on the inner list and is restored to its initializer on every
    // iteration: were it not, the second pass would leave it at 2
    assert_eq!(peek_var(&exec, k), Value::Integer(1));
}

#[test]
fn lookup_gates_start_and_unsubscribes() {
    let mut symbols = noop_symbols();
    symbols
        .declare_lookup(
            "temp",
            kestrel::plan::LookupDecl {
                return_type: ValueType::Real,
                param_types: vec![],
                any_params: false,
            },
        )
        .unwrap();
    let mut b = PlanBuilder::new(symbols);
    let root = b.add_node(None, NodeType::Command, "cmd").unwrap();
    let temp = b.lookup("temp", vec![], None).unwrap();
    let threshold = b.const_value(50.0);
    let start = b.apply(Op::Gt, vec![temp, threshold]).unwrap();
    b.set_condition(root, Condition::Start, start).unwrap();
    let name = b.const_value("noop");
    b.set_command(root, name, vec![], None, vec![]).unwrap();
    let plan = b.finish().unwrap();

    let (mut exec, state) = sim_executive(
        plan,
        &[("noop", &[CommandHandle::Sent, CommandHandle::Success])],
    );
    exec.start();
    exec.run_until_quiescent(100);

    // waiting on an unknown lookup; the subscription is live
    assert_eq!(exec.plan.nodes[root].state, NodeState::Waiting);
    assert_eq!(state.borrow().lookups.get(&temp).map(String::as_str), Some("temp"));

    let tx = state.borrow().tx.clone().unwrap();
    tx.send(InputEvent::LookupUpdate {
        lookup: temp,
        value: Value::Real(72.0),
    })
    .unwrap();
    exec.run_until_quiescent(100);
    exec.check_consistency();

    assert_eq!(exec.plan.nodes[root].state, NodeState::Finished);
    assert_eq!(exec.plan.nodes[root].outcome, Some(NodeOutcome::Success));
    // leaving WAITING tore the Start condition down and dropped the
    // subscription with it
    assert!(state.borrow().lookups.is_empty());
    assert_eq!(state.borrow().unsubscribed, vec![temp]);
}

#[test]
fn timepoints_observable_through_expressions() {
    let mut b = PlanBuilder::new(SymbolTable::new());
    let root = b.add_node(None, NodeType::Empty, "root").unwrap();
    let tp = b.node_timepoint(root, NodeState::Executing, false);
    let plan = b.finish().unwrap();

    let (mut exec, _) = sim_executive(plan, &[]);
    assert_eq!(exec.plan.eval(tp), Value::Unknown);
    run(&mut exec);
    match exec.plan.eval(tp) {
        Value::Real(t) => assert!(t > 0.0),
        other => panic!("expected a known timepoint, got {other}"),
    }
}
