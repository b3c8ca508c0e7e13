//! Static plan structure: the node tree, condition slots, variable scopes,
//! action bodies, mutexes and the builder that assembles and validates a
//! plan before the executive ever sees it.

pub use body::*;
pub use builder::{NodeRefStep, PlanBuilder, ResourceSpecSource};
pub use conds::Condition;
pub use mutex::Mutex;
pub use node::*;
pub use symbols::*;

mod body;
mod builder;
mod conds;
mod mutex;
mod node;
mod scope;
mod symbols;

use crate::collections::ref_store::RefVec;
use crate::core::Value;
use crate::create_ref_type;
use crate::expr::{Expr, ExprId, ExprKind};
use hashbrown::HashMap;

create_ref_type!(NodeId);
create_ref_type!(CommandId);
create_ref_type!(MutexId);

/// The whole in-memory plan: every expression, node, command body and mutex,
/// interned in arenas and cross-referenced by typed indices.
///
/// The executive is the only mutator once execution starts. Change pulses
/// that reach node listeners are buffered in `changed_nodes` and drained by
/// the scheduler, never acted upon from inside a notification.
pub struct Plan {
    pub exprs: RefVec<ExprId, Expr>,
    pub nodes: RefVec<NodeId, Node>,
    pub commands: RefVec<CommandId, CommandBody>,
    pub mutexes: RefVec<MutexId, Mutex>,
    /// Mutexes declared outside any node.
    pub global_mutexes: HashMap<String, MutexId>,
    pub symbols: SymbolTable,
    pub root: Option<NodeId>,
    /// Nodes whose conditions may have changed since the scheduler last
    /// looked; filled by change publication, drained between phases.
    pub(crate) changed_nodes: Vec<NodeId>,
}

impl Plan {
    pub fn new(symbols: SymbolTable) -> Plan {
        Plan {
            exprs: RefVec::new(),
            nodes: RefVec::new(),
            commands: RefVec::new(),
            mutexes: RefVec::new(),
            global_mutexes: HashMap::new(),
            symbols,
            root: None,
            changed_nodes: Vec::new(),
        }
    }

    pub fn add_expr(&mut self, kind: ExprKind) -> ExprId {
        self.exprs.push(Expr::new(kind))
    }

    pub fn add_const(&mut self, v: impl Into<Value>) -> ExprId {
        self.add_expr(ExprKind::Const(v.into()))
    }

    /// Follows alias chains to the expression that actually stores or
    /// computes the value. Returns the last writable-alias verdict along the
    /// way: false as soon as any link is read-only.
    pub fn resolve_alias(&self, mut e: ExprId) -> (ExprId, bool) {
        let mut writable = true;
        loop {
            match &self.exprs[e].kind {
                ExprKind::Alias { target, writable: w } => {
                    writable = writable && *w;
                    e = *target;
                }
                _ => return (e, writable),
            }
        }
    }

    pub fn node_id_string(&self, n: NodeId) -> &str {
        &self.nodes[n].node_id
    }
}
