//! Graph operations over the expression arena: activation, listener
//! maintenance, change publication and pull evaluation.
//!
//! These are defined on [Plan] because node-backed expressions (internal
//! variables, node functions, timepoints) read the node table during
//! evaluation.

use crate::core::{NodeState, Value};
use crate::exec::interface::{ExternalInterface, LookupRequest};
use crate::expr::{ExprId, ExprKind, Listener};
use crate::plan::{NodeId, Plan};
use smallvec::SmallVec;

impl Plan {
    /// Pull evaluation. Inactive expressions read as Unknown; interior
    /// expressions recompute from their children on every read.
    pub fn eval(&self, e: ExprId) -> Value {
        let expr = &self.exprs[e];
        if !expr.is_active() {
            return Value::Unknown;
        }
        match &expr.kind {
            ExprKind::Const(v) => v.clone(),
            ExprKind::Var(v) => v.value.clone(),
            ExprKind::Alias { target, .. } => self.eval(*target),
            ExprKind::Apply { op, args } => {
                let values: SmallVec<[Value; 4]> = args.iter().map(|a| self.eval(*a)).collect();
                op.apply(&values)
            }
            ExprKind::NodeRef { node, field } => {
                let n = &self.nodes[*node];
                match field {
                    crate::expr::NodeField::State => Value::NodeState(n.state),
                    crate::expr::NodeField::Outcome => {
                        n.outcome.map(Value::NodeOutcome).unwrap_or(Value::Unknown)
                    }
                    crate::expr::NodeField::Failure => {
                        n.failure.map(Value::FailureType).unwrap_or(Value::Unknown)
                    }
                    crate::expr::NodeField::Handle => match &n.body {
                        crate::plan::NodeBody::Command(cid) => self.eval(self.commands[*cid].handle),
                        _ => Value::Unknown, // ruled out by plan checking
                    },
                }
            }
            ExprKind::NodeFn { op, node } => {
                let n = &self.nodes[*node];
                let value = match op {
                    crate::expr::NodeFn::AllChildrenFinished => n
                        .children
                        .iter()
                        .all(|c| self.nodes[*c].state == NodeState::Finished),
                    crate::expr::NodeFn::AllChildrenWaitingOrFinished => n.children.iter().all(|c| {
                        matches!(self.nodes[*c].state, NodeState::Waiting | NodeState::Finished)
                    }),
                };
                Value::Boolean(value)
            }
            ExprKind::Timepoint { node, state, end } => self.nodes[*node]
                .timepoints
                .get(*state, *end)
                .map(Value::Real)
                .unwrap_or(Value::Unknown),
            ExprKind::Lookup(l) => l.value.clone(),
        }
    }

    pub fn is_known(&self, e: ExprId) -> bool {
        self.eval(e).is_known()
    }

    /// Reads a Boolean condition: Some(bool) if known, None otherwise.
    pub fn eval_bool(&self, e: ExprId) -> Option<bool> {
        self.eval(e).as_bool()
    }

    /// Static type of an expression where determinable before execution.
    pub fn expr_type(&self, e: ExprId) -> Option<crate::core::ValueType> {
        match &self.exprs[e].kind {
            ExprKind::Alias { target, .. } => self.expr_type(*target),
            ExprKind::Apply { op, args } => {
                let arg_types: SmallVec<[_; 4]> = args.iter().map(|a| self.expr_type(*a)).collect();
                op.result_type(&arg_types)
            }
            _ => self.exprs[e].static_type(),
        }
    }

    /// Subexpressions an activation (or deactivation) walk must visit.
    fn activation_children(&self, e: ExprId) -> SmallVec<[ExprId; 4]> {
        match &self.exprs[e].kind {
            ExprKind::Var(v) => v.init.into_iter().collect(),
            ExprKind::Alias { target, .. } => smallvec::smallvec![*target],
            ExprKind::Apply { args, .. } => args.iter().copied().collect(),
            ExprKind::Lookup(l) => l.args.iter().copied().collect(),
            _ => SmallVec::new(),
        }
    }

    /// Raise the activation count; on the 0 -> 1 edge activate everything
    /// the expression reads and run the kind's activation hook.
    pub fn activate_expr(&mut self, e: ExprId, io: &mut dyn ExternalInterface) {
        self.exprs[e].active_count += 1;
        if self.exprs[e].active_count > 1 {
            return;
        }
        // 0 -> 1: bring the subgraph up, then establish our own value
        for child in self.activation_children(e) {
            self.activate_expr(child, io);
        }
        match &self.exprs[e].kind {
            ExprKind::Var(v) => {
                // (re)establish the initial value: the previous iteration's
                // final value must not leak into this one
                let value = match v.init {
                    Some(init) => self.eval(init),
                    None => Value::Unknown,
                };
                if let ExprKind::Var(v) = &mut self.exprs[e].kind {
                    v.value = value;
                }
            }
            ExprKind::Lookup(_) => {
                let req = self.lookup_request(e);
                let value = io.lookup_now(&req);
                io.subscribe_lookup(e, &req, req.tolerance);
                if let ExprKind::Lookup(l) = &mut self.exprs[e].kind {
                    l.value = value;
                }
            }
            _ => {}
        }
    }

    /// Lower the activation count; on the 1 -> 0 edge run the deactivation
    /// hook and release everything the expression reads. Dropping below zero
    /// is a fatal internal error.
    pub fn deactivate_expr(&mut self, e: ExprId, io: &mut dyn ExternalInterface) {
        assert!(
            self.exprs[e].active_count > 0,
            "activation count underflow on expression {e:?}"
        );
        self.exprs[e].active_count -= 1;
        if self.exprs[e].active_count > 0 {
            return;
        }
        if let ExprKind::Lookup(_) = &self.exprs[e].kind {
            io.unsubscribe_lookup(e);
            if let ExprKind::Lookup(l) = &mut self.exprs[e].kind {
                l.value = Value::Unknown;
            }
        }
        for child in self.activation_children(e) {
            self.deactivate_expr(child, io);
        }
    }

    /// Attach a downstream listener. When an interior expression gains its
    /// first listener it installs itself on each of its children, so that a
    /// change anywhere below reaches the root listeners.
    pub fn add_listener(&mut self, e: ExprId, l: Listener) {
        if self.exprs[e].listeners.is_empty() {
            for child in self.interior_children(e) {
                self.add_listener(child, Listener::Expr(e));
            }
        }
        self.exprs[e].listeners.push(l);
    }

    /// Detach a listener; when the last one goes, detach from children too.
    pub fn remove_listener(&mut self, e: ExprId, l: Listener) {
        let listeners = &mut self.exprs[e].listeners;
        if let Some(pos) = listeners.iter().position(|x| *x == l) {
            listeners.remove(pos);
        }
        if self.exprs[e].listeners.is_empty() {
            for child in self.interior_children(e) {
                self.remove_listener(child, Listener::Expr(e));
            }
        }
    }

    /// Subexpressions the listener walk recurses through. Propagation sources
    /// and constants terminate the walk.
    fn interior_children(&self, e: ExprId) -> SmallVec<[ExprId; 4]> {
        match &self.exprs[e].kind {
            ExprKind::Alias { target, .. } => smallvec::smallvec![*target],
            ExprKind::Apply { args, .. } => args.iter().copied().collect(),
            _ => SmallVec::new(),
        }
    }

    /// Push a change pulse downstream. Inactive expressions publish nothing.
    /// Node listeners are buffered for the scheduler; structural changes to
    /// the listener graph must never happen from inside a pulse.
    pub fn publish(&mut self, e: ExprId) {
        if !self.exprs[e].is_active() {
            return;
        }
        let listeners = self.exprs[e].listeners.clone();
        for l in listeners {
            match l {
                Listener::Expr(k) => self.publish(k),
                Listener::Node(n) => self.changed_nodes.push(n),
            }
        }
    }

    /// Notify every expression reading this node's state, outcome, failure
    /// type, timepoints or child states.
    pub fn publish_node_change(&mut self, n: NodeId) {
        let listeners = self.nodes[n].change_listeners.clone();
        for e in listeners {
            self.publish(e);
        }
    }

    /// Write a variable (through writable aliases). The caller must hold the
    /// variable active; writing an inactive variable, a non-variable, or
    /// through a read-only alias is a fatal internal error, ruled out for
    /// checked plans by the builder.
    pub fn write_var(&mut self, e: ExprId, value: Value) {
        let (root, writable) = self.resolve_alias(e);
        assert!(writable, "write through read-only alias {e:?}");
        assert!(self.exprs[root].is_active(), "write to inactive variable {root:?}");
        let changed = match &mut self.exprs[root].kind {
            ExprKind::Var(v) => {
                if v.value != value {
                    v.value = value;
                    true
                } else {
                    false
                }
            }
            other => panic!("write target {root:?} is not a variable: {other:?}"),
        };
        if changed {
            self.publish(root);
        }
    }

    /// Interface-driven write of a lookup's cached value. Ignored while the
    /// lookup is inactive.
    pub fn write_lookup(&mut self, e: ExprId, value: Value) {
        if !self.exprs[e].is_active() {
            return;
        }
        let changed = match &mut self.exprs[e].kind {
            ExprKind::Lookup(l) => {
                if l.value != value {
                    l.value = value;
                    true
                } else {
                    false
                }
            }
            other => panic!("lookup update target {e:?} is not a lookup: {other:?}"),
        };
        if changed {
            self.publish(e);
        }
    }

    /// Snapshot of a lookup's name and evaluated arguments.
    pub fn lookup_request(&self, e: ExprId) -> LookupRequest {
        match &self.exprs[e].kind {
            ExprKind::Lookup(l) => LookupRequest {
                state_name: l.state_name.clone(),
                args: l.args.iter().map(|a| self.eval(*a)).collect(),
                tolerance: l.tolerance,
            },
            other => panic!("expression {e:?} is not a lookup: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ValueType;
    use crate::exec::interface::NullInterface;
    use crate::expr::{Op, VarData};
    use crate::plan::SymbolTable;

    fn plan() -> Plan {
        Plan::new(SymbolTable::new())
    }

    fn var(plan: &mut Plan, name: &str, init: Option<ExprId>) -> ExprId {
        plan.add_expr(ExprKind::Var(VarData {
            name: name.into(),
            decl_type: ValueType::Integer,
            init,
            value: Value::Unknown,
        }))
    }

    #[test]
    fn inactive_reads_unknown() {
        let mut p = plan();
        let x = var(&mut p, "x", None);
        assert_eq!(p.eval(x), Value::Unknown);
        let mut io = NullInterface;
        p.activate_expr(x, &mut io);
        p.write_var(x, Value::Integer(4));
        assert_eq!(p.eval(x), Value::Integer(4));
        p.deactivate_expr(x, &mut io);
        assert_eq!(p.eval(x), Value::Unknown);
    }

    #[test]
    fn activation_counts_are_shared() {
        let mut p = plan();
        let x = var(&mut p, "x", None);
        let c = p.add_const(1);
        let sum = p.add_expr(ExprKind::Apply {
            op: Op::Add,
            args: smallvec::smallvec![x, c],
        });
        let cmp = p.add_expr(ExprKind::Apply {
            op: Op::Ge,
            args: smallvec::smallvec![x, c],
        });
        let mut io = NullInterface;
        p.activate_expr(sum, &mut io);
        p.activate_expr(cmp, &mut io);
        assert_eq!(p.exprs[x].active_count(), 2);
        p.deactivate_expr(sum, &mut io);
        assert_eq!(p.exprs[x].active_count(), 1);
        p.write_var(x, Value::Integer(2));
        assert_eq!(p.eval(cmp), Value::Boolean(true));
        assert_eq!(p.eval(sum), Value::Unknown); // sum itself is inactive
        p.deactivate_expr(cmp, &mut io);
        assert_eq!(p.exprs[x].active_count(), 0);
    }

    #[test]
    #[should_panic(expected = "activation count underflow")]
    fn deactivation_underflow_is_fatal() {
        let mut p = plan();
        let x = var(&mut p, "x", None);
        let mut io = NullInterface;
        p.deactivate_expr(x, &mut io);
    }

    #[test]
    fn var_reset_from_initializer_on_activation() {
        let mut p = plan();
        let zero = p.add_const(0);
        let x = var(&mut p, "x", Some(zero));
        let mut io = NullInterface;
        p.activate_expr(x, &mut io);
        assert_eq!(p.eval(x), Value::Integer(0));
        p.write_var(x, Value::Integer(9));
        p.deactivate_expr(x, &mut io);
        p.activate_expr(x, &mut io);
        assert_eq!(p.eval(x), Value::Integer(0), "reactivation restores the initial value");
        p.deactivate_expr(x, &mut io);
    }

    #[test]
    fn listener_walk_attaches_and_detaches() {
        let mut p = plan();
        let x = var(&mut p, "x", None);
        let c = p.add_const(3);
        let cmp = p.add_expr(ExprKind::Apply {
            op: Op::Ge,
            args: smallvec::smallvec![x, c],
        });
        let n = NodeId::from_u32(0);
        p.add_listener(cmp, Listener::Node(n));
        assert!(p.exprs[x].has_listeners(), "interior expr attached itself to the leaf");
        p.remove_listener(cmp, Listener::Node(n));
        assert!(!p.exprs[x].has_listeners());
        assert!(!p.exprs[cmp].has_listeners());
    }

    #[test]
    fn write_publishes_to_node_listeners_once() {
        let mut p = plan();
        let x = var(&mut p, "x", None);
        let c = p.add_const(3);
        let cmp = p.add_expr(ExprKind::Apply {
            op: Op::Ge,
            args: smallvec::smallvec![x, c],
        });
        let n = NodeId::from_u32(0);
        p.add_listener(cmp, Listener::Node(n));
        let mut io = NullInterface;
        p.activate_expr(cmp, &mut io);
        p.write_var(x, Value::Integer(5));
        assert_eq!(p.changed_nodes, vec![n]);
        p.changed_nodes.clear();
        // same value: no change, no pulse
        p.write_var(x, Value::Integer(5));
        assert!(p.changed_nodes.is_empty());
    }

    #[test]
    fn inactive_subtree_publishes_nothing() {
        let mut p = plan();
        let x = var(&mut p, "x", None);
        let c = p.add_const(3);
        let cmp = p.add_expr(ExprKind::Apply {
            op: Op::Ge,
            args: smallvec::smallvec![x, c],
        });
        let n = NodeId::from_u32(0);
        p.add_listener(cmp, Listener::Node(n));
        let mut io = NullInterface;
        // x active through another holder, but cmp itself never activated
        p.activate_expr(x, &mut io);
        p.write_var(x, Value::Integer(5));
        assert!(p.changed_nodes.is_empty(), "inactive interior node swallowed the pulse");
    }
}
