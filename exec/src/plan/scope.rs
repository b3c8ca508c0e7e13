//! Lexical lookup of variables and mutexes.
//!
//! A name is searched in the node's own declarations, then up the ancestor
//! chain. A LibraryCall ancestor is a scoping barrier: its callee sees only
//! the aliases bound at the call site, never the caller's chain. Mutex
//! lookup follows the same walk with the global registry at the tail.

use crate::expr::ExprId;
use crate::plan::{MutexId, NodeBody, NodeId, Plan};

impl Plan {
    pub fn find_local_variable(&self, n: NodeId, name: &str) -> Option<ExprId> {
        self.nodes[n].locals.get(name).copied()
    }

    pub fn find_variable(&self, from: NodeId, name: &str) -> Option<ExprId> {
        let mut n = from;
        loop {
            if let Some(e) = self.nodes[n].locals.get(name) {
                return Some(*e);
            }
            let parent = self.nodes[n].parent?;
            if let NodeBody::LibraryCall { aliases } = &self.nodes[parent].body {
                // the call-site bindings are the entire visible scope
                return aliases.get(name).copied();
            }
            n = parent;
        }
    }

    pub fn find_mutex(&self, from: NodeId, name: &str) -> Option<MutexId> {
        let mut n = from;
        loop {
            if let Some(m) = self.nodes[n].mutexes.get(name) {
                return Some(*m);
            }
            match self.nodes[n].parent {
                Some(parent) => {
                    if matches!(self.nodes[parent].body, NodeBody::LibraryCall { .. }) {
                        // mutexes do not cross the library boundary; only
                        // globals remain visible
                        return self.global_mutexes.get(name).copied();
                    }
                    n = parent;
                }
                None => return self.global_mutexes.get(name).copied(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{Value, ValueType};
    use crate::expr::{ExprKind, VarData};
    use crate::plan::{Mutex, Node, NodeBody, NodeType, Plan, SymbolTable};
    use hashbrown::HashMap;

    fn named_var(p: &mut Plan, name: &str) -> crate::expr::ExprId {
        p.add_expr(ExprKind::Var(VarData {
            name: name.into(),
            decl_type: ValueType::Integer,
            init: None,
            value: Value::Unknown,
        }))
    }

    #[test]
    fn local_shadows_ancestor() {
        let mut p = Plan::new(SymbolTable::new());
        let root = p.nodes.push(Node::new("root", NodeType::List, None));
        let child = p.nodes.push(Node::new("child", NodeType::Empty, Some(root)));
        p.nodes[root].children.push(child);

        let outer = named_var(&mut p, "x");
        let inner = named_var(&mut p, "x");
        p.nodes[root].locals.insert("x".into(), outer);
        p.nodes[child].locals.insert("x".into(), inner);

        assert_eq!(p.find_variable(child, "x"), Some(inner));
        assert_eq!(p.find_variable(root, "x"), Some(outer));
        assert_eq!(p.find_variable(child, "y"), None);
    }

    #[test]
    fn library_call_is_a_barrier() {
        let mut p = Plan::new(SymbolTable::new());
        let root = p.nodes.push(Node::new("root", NodeType::List, None));
        let call = p.nodes.push(Node::new("call", NodeType::LibraryCall, Some(root)));
        let callee = p.nodes.push(Node::new("lib", NodeType::Empty, Some(call)));
        p.nodes[root].children.push(call);
        p.nodes[call].children.push(callee);

        let hidden = named_var(&mut p, "hidden");
        p.nodes[root].locals.insert("hidden".into(), hidden);
        let bound = named_var(&mut p, "bound");
        let mut aliases = HashMap::new();
        aliases.insert("p".to_string(), bound);
        p.nodes[call].body = NodeBody::LibraryCall { aliases };

        assert_eq!(p.find_variable(callee, "p"), Some(bound));
        assert_eq!(p.find_variable(callee, "hidden"), None, "caller scope must not leak");
        assert_eq!(p.find_variable(call, "hidden"), Some(hidden), "the call node itself still sees it");
    }

    #[test]
    fn mutex_lookup_reaches_globals() {
        let mut p = Plan::new(SymbolTable::new());
        let root = p.nodes.push(Node::new("root", NodeType::List, None));
        let child = p.nodes.push(Node::new("child", NodeType::Assignment, Some(root)));
        p.nodes[root].children.push(child);

        let local = p.mutexes.push(Mutex::new("m", Some(root)));
        p.nodes[root].mutexes.insert("m".into(), local);
        let glob = p.mutexes.push(Mutex::new("g", None));
        p.global_mutexes.insert("g".into(), glob);
        // local declaration shadows an identically named global
        let shadowed_glob = p.mutexes.push(Mutex::new("m", None));
        p.global_mutexes.insert("m".into(), shadowed_glob);

        assert_eq!(p.find_mutex(child, "m"), Some(local));
        assert_eq!(p.find_mutex(child, "g"), Some(glob));
        assert_eq!(p.find_mutex(child, "nope"), None);
    }
}
