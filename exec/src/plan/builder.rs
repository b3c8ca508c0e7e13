//! Plan construction and finalization.
//!
//! [PlanBuilder] is the API a plan parser drives: declare nodes, variables,
//! conditions and bodies, then call [PlanBuilder::finish] which synthesizes
//! the per-type conditions, combines the ancestor conditions, installs the
//! change listeners and validates the whole plan. A plan that fails any
//! check never reaches the executive.

use crate::core::{Value, ValueType};
use crate::expr::{ExprId, ExprKind, Listener, LookupData, NodeField, NodeFn, Op, VarData};
use crate::plan::{
    AssignmentBody, CommandBody, CommandId, CondSlot, Condition, Mutex, MutexId, Node, NodeBody, NodeId, NodeType,
    Plan, SymbolTable, UpdateBody, WORST_PRIORITY,
};
use anyhow::{anyhow, bail, ensure, Context, Result};
use hashbrown::HashMap;
use smallvec::SmallVec;

/// One step of a node reference path, resolved lexically from the referring
/// node.
#[derive(Clone, Debug)]
pub enum NodeRefStep {
    This,
    Parent,
    Child(String),
    Sibling(String),
}

pub struct PlanBuilder {
    plan: Plan,
    /// Command-handle references awaiting the plan-check pass.
    handle_refs: Vec<(ExprId, NodeId)>,
}

impl PlanBuilder {
    pub fn new(symbols: SymbolTable) -> PlanBuilder {
        PlanBuilder {
            plan: Plan::new(symbols),
            handle_refs: Vec::new(),
        }
    }

    // ---------------------------------------------------------------- nodes

    /// Adds a node. `parent: None` declares the root (exactly once); child
    /// nodes require a List or LibraryCall parent and a node id unique among
    /// their siblings.
    pub fn add_node(&mut self, parent: Option<NodeId>, typ: NodeType, node_id: &str) -> Result<NodeId> {
        ensure!(!node_id.is_empty(), "empty node id");
        match parent {
            None => {
                ensure!(self.plan.root.is_none(), "plan already has a root node");
            }
            Some(p) => {
                let pn = &self.plan.nodes[p];
                ensure!(
                    pn.typ.has_children(),
                    "node {} of type {:?} cannot have children",
                    pn.node_id,
                    pn.typ
                );
                ensure!(
                    pn.children.iter().all(|c| self.plan.nodes[*c].node_id != node_id),
                    "duplicate node id {node_id} under {}",
                    pn.node_id
                );
            }
        }
        let n = self.plan.nodes.push(Node::new(node_id, typ, parent));
        match parent {
            None => self.plan.root = Some(n),
            Some(p) => self.plan.nodes[p].children.push(n),
        }
        Ok(n)
    }

    pub fn set_priority(&mut self, n: NodeId, priority: i32) -> Result<()> {
        ensure!(
            (0..=WORST_PRIORITY).contains(&priority),
            "priority {priority} out of range for node {}",
            self.plan.nodes[n].node_id
        );
        self.plan.nodes[n].priority = priority;
        Ok(())
    }

    /// Resolves a node reference path ({self | parent | child | sibling}*)
    /// from `from`. Invalid paths are load-time errors.
    pub fn resolve_node_ref(&self, from: NodeId, path: &[NodeRefStep]) -> Result<NodeId> {
        let mut n = from;
        for step in path {
            n = match step {
                NodeRefStep::This => n,
                NodeRefStep::Parent => self.plan.nodes[n]
                    .parent
                    .ok_or_else(|| anyhow!("node {} has no parent", self.plan.nodes[n].node_id))?,
                NodeRefStep::Child(name) => self
                    .find_child(n, name)
                    .ok_or_else(|| anyhow!("node {} has no child named {name}", self.plan.nodes[n].node_id))?,
                NodeRefStep::Sibling(name) => {
                    let p = self.plan.nodes[n]
                        .parent
                        .ok_or_else(|| anyhow!("root node {} has no siblings", self.plan.nodes[n].node_id))?;
                    self.find_child(p, name)
                        .ok_or_else(|| anyhow!("node {} has no sibling named {name}", self.plan.nodes[n].node_id))?
                }
            };
        }
        Ok(n)
    }

    fn find_child(&self, n: NodeId, name: &str) -> Option<NodeId> {
        self.plan.nodes[n]
            .children
            .iter()
            .copied()
            .find(|c| self.plan.nodes[*c].node_id == name)
    }

    // ---------------------------------------------------------- expressions

    pub fn const_value(&mut self, v: impl Into<Value>) -> ExprId {
        self.plan.add_const(v)
    }

    pub fn apply(&mut self, op: Op, args: Vec<ExprId>) -> Result<ExprId> {
        if let Some(arity) = op.arity() {
            ensure!(args.len() == arity, "{op} expects {arity} arguments, got {}", args.len());
        } else {
            ensure!(!args.is_empty(), "{op} expects at least one argument");
        }
        Ok(self.plan.add_expr(ExprKind::Apply {
            op,
            args: args.into_iter().collect(),
        }))
    }

    /// Declares a variable local to `n`. The initializer, if any, must be
    /// type-compatible; it is re-evaluated on each activation.
    pub fn declare_variable(
        &mut self,
        n: NodeId,
        name: &str,
        decl_type: ValueType,
        init: Option<ExprId>,
    ) -> Result<ExprId> {
        ensure!(!name.is_empty(), "empty variable name");
        ensure!(
            !self.plan.nodes[n].locals.contains_key(name),
            "duplicate variable {name} in node {}",
            self.plan.nodes[n].node_id
        );
        if let Some(init) = init {
            if let Some(t) = self.plan.expr_type(init) {
                ensure!(
                    decl_type.assignable_from(t),
                    "initializer of {name} has type {t}, expected {decl_type}"
                );
            }
        }
        let e = self.plan.add_expr(ExprKind::Var(VarData {
            name: name.to_string(),
            decl_type,
            init,
            value: Value::Unknown,
        }));
        let node = &mut self.plan.nodes[n];
        node.locals.insert(name.to_string(), e);
        node.local_decls.push(e);
        Ok(e)
    }

    /// Resolves a variable name in `n`'s visible scope.
    pub fn var_ref(&self, n: NodeId, name: &str) -> Result<ExprId> {
        self.plan
            .find_variable(n, name)
            .ok_or_else(|| anyhow!("variable {name} is not visible from node {}", self.plan.nodes[n].node_id))
    }

    /// Declares an In interface variable: a read-only alias over the
    /// caller's variable, or over the default when absent.
    pub fn declare_in(&mut self, n: NodeId, name: &str, default: Option<ExprId>) -> Result<ExprId> {
        let source = self.interface_source(n, name);
        let target = match (source, default) {
            (Some(s), _) => s,
            (None, Some(d)) => d,
            (None, None) => bail!(
                "In variable {name} of node {} is absent in the caller and has no default",
                self.plan.nodes[n].node_id
            ),
        };
        let alias = self.plan.add_expr(ExprKind::Alias {
            target,
            writable: false,
        });
        self.bind_local(n, name, alias)?;
        Ok(alias)
    }

    /// Declares an InOut interface variable: an alias preserving
    /// assignability. Absence in the caller is a load-time error.
    pub fn declare_inout(&mut self, n: NodeId, name: &str) -> Result<ExprId> {
        let source = self.interface_source(n, name).ok_or_else(|| {
            anyhow!(
                "InOut variable {name} of node {} is absent in the caller",
                self.plan.nodes[n].node_id
            )
        })?;
        let (_, writable) = self.plan.resolve_alias(source);
        ensure!(
            writable,
            "InOut variable {name} of node {} binds to a read-only expression",
            self.plan.nodes[n].node_id
        );
        let alias = self.plan.add_expr(ExprKind::Alias {
            target: source,
            writable: true,
        });
        self.bind_local(n, name, alias)?;
        Ok(alias)
    }

    fn interface_source(&self, n: NodeId, name: &str) -> Option<ExprId> {
        let parent = self.plan.nodes[n].parent;
        match parent {
            Some(p) => self.plan.find_variable(p, name),
            None => None,
        }
    }

    fn bind_local(&mut self, n: NodeId, name: &str, e: ExprId) -> Result<()> {
        ensure!(
            !self.plan.nodes[n].locals.contains_key(name),
            "duplicate variable {name} in node {}",
            self.plan.nodes[n].node_id
        );
        self.plan.nodes[n].locals.insert(name.to_string(), e);
        Ok(())
    }

    pub fn node_state_ref(&mut self, node: NodeId) -> ExprId {
        self.plan.add_expr(ExprKind::NodeRef {
            node,
            field: NodeField::State,
        })
    }

    pub fn node_outcome_ref(&mut self, node: NodeId) -> ExprId {
        self.plan.add_expr(ExprKind::NodeRef {
            node,
            field: NodeField::Outcome,
        })
    }

    pub fn node_failure_ref(&mut self, node: NodeId) -> ExprId {
        self.plan.add_expr(ExprKind::NodeRef {
            node,
            field: NodeField::Failure,
        })
    }

    /// Reference to the command handle of `node`, which the plan-check pass
    /// requires to be a Command node.
    pub fn command_handle_ref(&mut self, node: NodeId) -> ExprId {
        let e = self.plan.add_expr(ExprKind::NodeRef {
            node,
            field: NodeField::Handle,
        });
        self.handle_refs.push((e, node));
        e
    }

    pub fn node_timepoint(&mut self, node: NodeId, state: crate::core::NodeState, end: bool) -> ExprId {
        self.plan.add_expr(ExprKind::Timepoint { node, state, end })
    }

    /// A lookup of a declared external state.
    pub fn lookup(&mut self, state_name: &str, args: Vec<ExprId>, tolerance: Option<f64>) -> Result<ExprId> {
        let decl = self
            .plan
            .symbols
            .lookup(state_name)
            .ok_or_else(|| anyhow!("undeclared lookup {state_name}"))?;
        let decl_type = decl.return_type;
        let param_types = decl.param_types.clone();
        let any_params = decl.any_params;
        let arg_types: Vec<_> = args.iter().map(|a| self.plan.expr_type(*a)).collect();
        SymbolTable::check_params(&param_types, any_params, &arg_types, &format!("lookup {state_name}"))?;
        Ok(self.plan.add_expr(ExprKind::Lookup(LookupData {
            state_name: state_name.to_string(),
            args: args.into_iter().collect(),
            tolerance,
            decl_type,
            value: Value::Unknown,
        })))
    }

    // ----------------------------------------------------------- conditions

    /// Sets a user condition. Only the eight user-writable slots are
    /// assignable; the expression must be Boolean.
    pub fn set_condition(&mut self, n: NodeId, which: Condition, e: ExprId) -> Result<()> {
        ensure!(
            Condition::USER.contains(&which),
            "{which} of node {} is not user-writable",
            self.plan.nodes[n].node_id
        );
        ensure!(
            self.plan.nodes[n].conds[which.index()].is_none(),
            "duplicate {which} on node {}",
            self.plan.nodes[n].node_id
        );
        let t = self.plan.expr_type(e);
        ensure!(
            t == Some(ValueType::Boolean),
            "{which} of node {} has type {}, expected Boolean",
            self.plan.nodes[n].node_id,
            t.map(|t| t.to_string()).unwrap_or_else(|| "unknown".into())
        );
        self.plan.nodes[n].conds[which.index()] = Some(CondSlot { expr: e, owned: true });
        Ok(())
    }

    // -------------------------------------------------------------- mutexes

    pub fn declare_mutex(&mut self, n: NodeId, name: &str) -> Result<MutexId> {
        ensure!(
            !self.plan.nodes[n].mutexes.contains_key(name),
            "duplicate mutex {name} in node {}",
            self.plan.nodes[n].node_id
        );
        let m = self.plan.mutexes.push(Mutex::new(name, Some(n)));
        self.plan.nodes[n].mutexes.insert(name.to_string(), m);
        Ok(m)
    }

    pub fn declare_global_mutex(&mut self, name: &str) -> Result<MutexId> {
        ensure!(
            !self.plan.global_mutexes.contains_key(name),
            "duplicate global mutex {name}"
        );
        let m = self.plan.mutexes.push(Mutex::new(name, None));
        self.plan.global_mutexes.insert(name.to_string(), m);
        Ok(m)
    }

    /// Declares that `n`'s body acquires the named mutex before executing.
    /// The name must be in scope: local declarations shadow ancestors,
    /// ancestors shadow globals.
    pub fn use_mutex(&mut self, n: NodeId, name: &str) -> Result<MutexId> {
        ensure!(
            matches!(self.plan.nodes[n].typ, NodeType::Assignment | NodeType::Command),
            "node {} of type {:?} cannot acquire mutexes",
            self.plan.nodes[n].node_id,
            self.plan.nodes[n].typ
        );
        let m = self
            .plan
            .find_mutex(n, name)
            .ok_or_else(|| anyhow!("mutex {name} is not in scope for node {}", self.plan.nodes[n].node_id))?;
        self.plan.nodes[n].requested.push(m);
        Ok(m)
    }

    // --------------------------------------------------------------- bodies

    /// Attaches an Assignment body. The destination must be a writable
    /// variable (or writable alias) visible from the node.
    pub fn set_assignment(&mut self, n: NodeId, dest: ExprId, rhs: ExprId) -> Result<()> {
        ensure!(
            self.plan.nodes[n].typ == NodeType::Assignment,
            "node {} is not an Assignment node",
            self.plan.nodes[n].node_id
        );
        let (root, writable) = self.plan.resolve_alias(dest);
        ensure!(
            writable && matches!(self.plan.exprs[root].kind, ExprKind::Var(_)),
            "assignment destination of node {} is not a writable variable",
            self.plan.nodes[n].node_id
        );
        if let (Some(dt), Some(rt)) = (self.plan.expr_type(dest), self.plan.expr_type(rhs)) {
            ensure!(
                dt.assignable_from(rt),
                "assignment of {rt} to {dt} variable in node {}",
                self.plan.nodes[n].node_id
            );
        }
        let ack = self.bool_flag(n, ".ack");
        let abort_ack = self.bool_flag(n, ".abort-ack");
        self.plan.nodes[n].body = NodeBody::Assignment(Box::new(AssignmentBody {
            dest,
            rhs,
            ack,
            abort_ack,
            value: None,
            queued: false,
        }));
        Ok(())
    }

    /// Attaches a Command body. A literal command name must be declared in
    /// the symbol table and its arguments and return destination are checked
    /// against the declaration.
    pub fn set_command(
        &mut self,
        n: NodeId,
        name: ExprId,
        args: Vec<ExprId>,
        dest: Option<ExprId>,
        resources: Vec<ResourceSpecSource>,
    ) -> Result<CommandId> {
        ensure!(
            self.plan.nodes[n].typ == NodeType::Command,
            "node {} is not a Command node",
            self.plan.nodes[n].node_id
        );
        if let ExprKind::Const(Value::String(cmd_name)) = &self.plan.exprs[name].kind {
            let cmd_name = cmd_name.clone();
            let decl = self
                .plan
                .symbols
                .command(&cmd_name)
                .ok_or_else(|| anyhow!("undeclared command {cmd_name}"))?;
            let param_types = decl.param_types.clone();
            let any_params = decl.any_params;
            let return_type = decl.return_type;
            let arg_types: Vec<_> = args.iter().map(|a| self.plan.expr_type(*a)).collect();
            SymbolTable::check_params(&param_types, any_params, &arg_types, &format!("command {cmd_name}"))?;
            match (dest, return_type) {
                (Some(d), Some(rt)) => {
                    let (root, writable) = self.plan.resolve_alias(d);
                    ensure!(
                        writable && matches!(self.plan.exprs[root].kind, ExprKind::Var(_)),
                        "return destination of command {cmd_name} is not a writable variable"
                    );
                    if let Some(dt) = self.plan.expr_type(d) {
                        ensure!(dt.assignable_from(rt), "command {cmd_name} returns {rt}, destination is {dt}");
                    }
                }
                (Some(_), None) => bail!("command {cmd_name} returns nothing but a destination was given"),
                _ => {}
            }
        } else {
            let t = self.plan.expr_type(name);
            ensure!(
                t.is_none() || t == Some(ValueType::String),
                "command name of node {} is not a String",
                self.plan.nodes[n].node_id
            );
        }

        let mut specs = Vec::with_capacity(resources.len());
        for r in resources {
            let m = self
                .plan
                .find_mutex(n, &r.name)
                .ok_or_else(|| anyhow!("resource {} is not in scope for node {}", r.name, self.plan.nodes[n].node_id))?;
            self.plan.nodes[n].requested.push(m);
            specs.push(crate::plan::ResourceSpec {
                mutex: m,
                upper_bound: r.upper_bound,
                release_at_termination: r.release_at_termination,
            });
        }

        let handle = self.plan.add_expr(ExprKind::Var(VarData {
            name: format!("{}.handle", self.plan.nodes[n].node_id),
            decl_type: ValueType::CommandHandle,
            init: None,
            value: Value::Unknown,
        }));
        let abort_complete = self.bool_flag(n, ".abort-complete");
        let cid = self.plan.commands.push(CommandBody {
            node: n,
            name,
            args: args.into_iter().collect(),
            dest,
            resources: specs,
            handle,
            abort_complete,
            pending: false,
            abort_pending: false,
        });
        self.plan.nodes[n].body = NodeBody::Command(cid);
        Ok(cid)
    }

    /// Attaches an Update body: an ordered (name, value-expression) list.
    pub fn set_update(&mut self, n: NodeId, pairs: Vec<(String, ExprId)>) -> Result<()> {
        ensure!(
            self.plan.nodes[n].typ == NodeType::Update,
            "node {} is not an Update node",
            self.plan.nodes[n].node_id
        );
        ensure!(
            pairs.iter().all(|(k, _)| !k.is_empty()),
            "empty name in update of node {}",
            self.plan.nodes[n].node_id
        );
        let ack = self.bool_flag(n, ".ack");
        self.plan.nodes[n].body = NodeBody::Update(Box::new(UpdateBody {
            pairs,
            ack,
            pending: false,
        }));
        Ok(())
    }

    /// Binds the alias map of a LibraryCall node. In parameters become
    /// read-only aliases, InOut parameters writable ones; the callee subtree
    /// is then built as the node's single child.
    pub fn set_library_aliases(&mut self, n: NodeId, aliases: Vec<(String, ExprId, bool)>) -> Result<()> {
        ensure!(
            self.plan.nodes[n].typ == NodeType::LibraryCall,
            "node {} is not a LibraryCall node",
            self.plan.nodes[n].node_id
        );
        let mut map = HashMap::new();
        for (name, target, writable) in aliases {
            if writable {
                let (_, w) = self.plan.resolve_alias(target);
                ensure!(
                    w,
                    "InOut alias {name} of node {} binds to a read-only expression",
                    self.plan.nodes[n].node_id
                );
            }
            let alias = self.plan.add_expr(ExprKind::Alias { target, writable });
            ensure!(
                map.insert(name.clone(), alias).is_none(),
                "duplicate alias {name} on node {}",
                self.plan.nodes[n].node_id
            );
        }
        self.plan.nodes[n].body = NodeBody::LibraryCall { aliases: map };
        Ok(())
    }

    fn bool_flag(&mut self, n: NodeId, suffix: &str) -> ExprId {
        let init = self.plan.add_const(false);
        self.plan.add_expr(ExprKind::Var(VarData {
            name: format!("{}{suffix}", self.plan.nodes[n].node_id),
            decl_type: ValueType::Boolean,
            init: Some(init),
            value: Value::Unknown,
        }))
    }

    // --------------------------------------------------------- finalization

    /// Synthesizes conditions, combines ancestor conditions, installs
    /// listeners and validates the whole plan.
    pub fn finish(mut self) -> Result<Plan> {
        let root = self.plan.root.ok_or_else(|| anyhow!("plan has no root node"))?;

        // bodies must match node types before anything is derived from them
        for n in self.plan.nodes.keys().collect::<Vec<_>>() {
            self.check_body(n)?;
        }

        // handle references only make sense against Command nodes
        for (e, target) in &self.handle_refs {
            ensure!(
                self.plan.nodes[*target].typ == NodeType::Command,
                "command-handle reference {e:?} targets node {}, which is not a Command node",
                self.plan.nodes[*target].node_id
            );
        }

        // parent slots must exist before children combine against them
        let order = self.preorder(root);
        for &n in &order {
            self.synthesize_conditions(n)
                .with_context(|| format!("finalizing node {}", self.plan.nodes[n].node_id))?;
        }
        for &n in &order {
            self.install_listeners(n);
        }
        self.register_node_backed_exprs();

        Ok(self.plan)
    }

    fn check_body(&self, n: NodeId) -> Result<()> {
        let node = &self.plan.nodes[n];
        let ok = match node.typ {
            NodeType::Empty => matches!(node.body, NodeBody::Empty),
            NodeType::List => matches!(node.body, NodeBody::List),
            NodeType::LibraryCall => matches!(node.body, NodeBody::LibraryCall { .. }),
            NodeType::Assignment => matches!(node.body, NodeBody::Assignment(_)),
            NodeType::Command => matches!(node.body, NodeBody::Command(_)),
            NodeType::Update => matches!(node.body, NodeBody::Update(_)),
        };
        ensure!(ok, "node {} of type {:?} is missing its body", node.node_id, node.typ);
        if node.typ == NodeType::LibraryCall {
            ensure!(
                node.children.len() == 1,
                "LibraryCall node {} must have exactly one child",
                node.node_id
            );
        }
        ensure!(
            node.typ.has_children() || node.children.is_empty(),
            "node {} of type {:?} cannot have children",
            node.node_id,
            node.typ
        );
        Ok(())
    }

    fn preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.plan.nodes.len());
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            out.push(n);
            for c in self.plan.nodes[n].children.iter().rev() {
                stack.push(*c);
            }
        }
        out
    }

    /// Per-type synthesized conditions plus the ancestor combination. The
    /// parent's slots 0-2 are already final when a child gets here.
    fn synthesize_conditions(&mut self, n: NodeId) -> Result<()> {
        match self.plan.nodes[n].typ {
            NodeType::List | NodeType::LibraryCall => self.synthesize_list_conditions(n),
            NodeType::Command => self.synthesize_command_conditions(n),
            NodeType::Update => self.synthesize_update_conditions(n),
            NodeType::Assignment => {
                let ack = match &self.plan.nodes[n].body {
                    NodeBody::Assignment(a) => a.ack,
                    _ => unreachable!(),
                };
                self.set_slot(n, Condition::ActionComplete, ack, false);
                Ok(())
            }
            NodeType::Empty => Ok(()),
        }
    }

    fn synthesize_list_conditions(&mut self, n: NodeId) -> Result<()> {
        let action_complete = self.plan.add_expr(ExprKind::NodeFn {
            op: NodeFn::AllChildrenWaitingOrFinished,
            node: n,
        });
        self.set_slot(n, Condition::ActionComplete, action_complete, true);

        let user_end = self.plan.nodes[n].cond(Condition::End);
        let end_synthesized = user_end.is_none();
        if end_synthesized {
            let all_finished = self.plan.add_expr(ExprKind::NodeFn {
                op: NodeFn::AllChildrenFinished,
                node: n,
            });
            self.set_slot(n, Condition::End, all_finished, true);
        }

        // combined conditions for the children, built from this node's user
        // conditions and its own view of its ancestors (the parent's slots)
        let parent = self.plan.nodes[n].parent;
        let own_exit = self.plan.nodes[n].cond(Condition::Exit);
        let own_invariant = self.plan.nodes[n].cond(Condition::Invariant);
        let parent_slots = parent.map(|p| {
            (
                self.plan.nodes[p].cond(Condition::AncestorExit),
                self.plan.nodes[p].cond(Condition::AncestorInvariant),
                self.plan.nodes[p].cond(Condition::AncestorEnd),
            )
        });
        let (anc_exit, anc_inv, anc_end) = parent_slots.unwrap_or((None, None, None));

        self.combine_slot(n, Condition::AncestorExit, Op::Or, own_exit, anc_exit);
        self.combine_slot(n, Condition::AncestorInvariant, Op::And, own_invariant, anc_inv);
        if end_synthesized {
            // The all-children-finished default is necessarily false at any
            // moment a child reads its ancestor-end, so combining it in would
            // change nothing: pass the inherited slot through.
            if let Some(e) = anc_end {
                self.plan.nodes[n].conds[Condition::AncestorEnd.index()] = Some(CondSlot { expr: e, owned: false });
            }
        } else {
            self.combine_slot(n, Condition::AncestorEnd, Op::Or, user_end, anc_end);
        }
        Ok(())
    }

    fn synthesize_command_conditions(&mut self, n: NodeId) -> Result<()> {
        let (handle, abort_complete) = match &self.plan.nodes[n].body {
            NodeBody::Command(cid) => {
                let c = &self.plan.commands[*cid];
                (c.handle, c.abort_complete)
            }
            _ => unreachable!(),
        };
        let handle_known = self.plan.add_expr(ExprKind::Apply {
            op: Op::IsKnown,
            args: smallvec::smallvec![handle],
        });
        self.set_slot(n, Condition::ActionComplete, handle_known, true);
        self.set_slot(n, Condition::AbortComplete, abort_complete, false);

        let handle_known_for_end = self.plan.add_expr(ExprKind::Apply {
            op: Op::IsKnown,
            args: smallvec::smallvec![handle],
        });
        self.wrap_end(n, handle_known_for_end);
        Ok(())
    }

    fn synthesize_update_conditions(&mut self, n: NodeId) -> Result<()> {
        let ack = match &self.plan.nodes[n].body {
            NodeBody::Update(u) => u.ack,
            _ => unreachable!(),
        };
        self.set_slot(n, Condition::ActionComplete, ack, false);
        self.wrap_end(n, ack);
        Ok(())
    }

    /// End := guard AND user-End, or just the guard when no user End exists.
    fn wrap_end(&mut self, n: NodeId, guard: ExprId) {
        match self.plan.nodes[n].conds[Condition::End.index()] {
            Some(user) => {
                let wrapped = self.plan.add_expr(ExprKind::Apply {
                    op: Op::And,
                    args: smallvec::smallvec![guard, user.expr],
                });
                self.plan.nodes[n].conds[Condition::End.index()] = Some(CondSlot {
                    expr: wrapped,
                    owned: true,
                });
            }
            None => {
                self.plan.nodes[n].conds[Condition::End.index()] = Some(CondSlot {
                    expr: guard,
                    owned: true,
                });
            }
        }
    }

    fn set_slot(&mut self, n: NodeId, which: Condition, e: ExprId, owned: bool) {
        debug_assert!(self.plan.nodes[n].conds[which.index()].is_none());
        self.plan.nodes[n].conds[which.index()] = Some(CondSlot { expr: e, owned });
    }

    /// slot := op(own, inherited) when both exist, otherwise whichever does.
    fn combine_slot(&mut self, n: NodeId, which: Condition, op: Op, own: Option<ExprId>, inherited: Option<ExprId>) {
        let slot = match (own, inherited) {
            (Some(a), Some(b)) => {
                let combined = self.plan.add_expr(ExprKind::Apply {
                    op,
                    args: smallvec::smallvec![a, b],
                });
                Some(CondSlot {
                    expr: combined,
                    owned: true,
                })
            }
            (Some(a), None) => Some(CondSlot { expr: a, owned: false }),
            (None, Some(b)) => Some(CondSlot { expr: b, owned: false }),
            (None, None) => None,
        };
        self.plan.nodes[n].conds[which.index()] = slot;
    }

    /// A node listens to its own guard conditions (all but Pre and Post,
    /// which are only sampled) and to its parent's combined ancestor
    /// conditions.
    fn install_listeners(&mut self, n: NodeId) {
        for i in Condition::Skip.index()..Condition::COUNT {
            let which = Condition::from_index(i).unwrap();
            if !which.notifies() {
                continue;
            }
            if let Some(slot) = self.plan.nodes[n].conds[i] {
                self.plan.add_listener(slot.expr, Listener::Node(n));
            }
        }
        if let Some(p) = self.plan.nodes[n].parent {
            for which in [Condition::AncestorExit, Condition::AncestorInvariant, Condition::AncestorEnd] {
                if let Some(e) = self.plan.nodes[p].cond(which) {
                    self.plan.add_listener(e, Listener::Node(n));
                }
            }
        }
    }

    /// Node-backed expressions hear about node changes through the owning
    /// node, not through subexpression listeners.
    fn register_node_backed_exprs(&mut self) {
        for e in self.plan.exprs.keys().collect::<Vec<_>>() {
            match self.plan.exprs[e].kind {
                ExprKind::NodeRef {
                    node,
                    field: NodeField::Handle,
                } => {
                    // driven by the handle variable, not by node transitions
                    if let NodeBody::Command(cid) = self.plan.nodes[node].body {
                        let handle = self.plan.commands[cid].handle;
                        self.plan.add_listener(handle, Listener::Expr(e));
                    }
                }
                ExprKind::NodeRef { node, .. } | ExprKind::Timepoint { node, .. } => {
                    self.plan.nodes[node].change_listeners.push(e);
                }
                ExprKind::NodeFn { node, .. } => {
                    let children: SmallVec<[NodeId; 4]> = self.plan.nodes[node].children.iter().copied().collect();
                    for c in children {
                        self.plan.nodes[c].change_listeners.push(e);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Raw resource request as a parser would deliver it. `lower_bound` and
/// `priority` are legacy fields: accepted, ignored.
#[derive(Clone, Debug)]
pub struct ResourceSpecSource {
    pub name: String,
    pub upper_bound: Option<f64>,
    pub lower_bound: Option<f64>,
    pub priority: Option<i32>,
    pub release_at_termination: bool,
}

impl ResourceSpecSource {
    pub fn named(name: impl Into<String>) -> ResourceSpecSource {
        ResourceSpecSource {
            name: name.into(),
            upper_bound: None,
            lower_bound: None,
            priority: None,
            release_at_termination: true,
        }
    }
}
