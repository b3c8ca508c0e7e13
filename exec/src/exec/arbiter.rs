//! Resource arbitration.
//!
//! Commands and Assignments acquire their declared mutexes, and an
//! Assignment additionally reserves its destination variable, before the
//! transition into EXECUTING commits. A request is granted all-or-none; a
//! denied node parks on the wait list of every busy resource and is woken
//! when any of them releases. Same-variable conflicts between Assignments
//! arriving in the same batch are settled by priority before any
//! acquisition happens (see the executive).

use crate::collections::ref_store::RefMap;
use crate::expr::ExprId;
use crate::plan::{MutexId, NodeId, Plan};
use std::collections::VecDeque;
use tracing::trace;

#[derive(Default)]
struct VarReservation {
    holder: Option<NodeId>,
    waiters: VecDeque<NodeId>,
}

/// Runtime state of resource arbitration. Mutex hold/wait state lives on the
/// mutexes themselves; variable reservations (destination variables of
/// executing Assignments) live here.
#[derive(Default)]
pub struct Arbiter {
    vars: RefMap<ExprId, VarReservation>,
    /// Variable reserved by each holder, for release bookkeeping.
    held_var: RefMap<NodeId, ExprId>,
    /// Nodes woken by a release since the last drain.
    woken: Vec<NodeId>,
}

impl Arbiter {
    pub fn new() -> Arbiter {
        Arbiter::default()
    }

    /// True when the variable is reserved by a node other than `n`.
    pub fn var_busy(&self, var: ExprId, n: NodeId) -> bool {
        self.vars
            .get(var)
            .and_then(|r| r.holder)
            .map(|h| h != n)
            .unwrap_or(false)
    }

    /// Atomically acquire `mutexes` plus the optional variable reservation.
    /// On success the node's `using` list records the grant order. On
    /// failure nothing is held and the node is parked on every busy
    /// resource's wait list.
    pub fn try_acquire(&mut self, plan: &mut Plan, n: NodeId, mutexes: &[MutexId], var: Option<ExprId>) -> bool {
        let busy_mutexes: Vec<MutexId> = mutexes
            .iter()
            .copied()
            .filter(|m| plan.mutexes[*m].holder.map(|h| h != n).unwrap_or(false))
            .collect();
        let var_blocked = var.map(|v| self.var_busy(v, n)).unwrap_or(false);

        if busy_mutexes.is_empty() && !var_blocked {
            self.withdraw(plan, n);
            for &m in mutexes {
                let mx = &mut plan.mutexes[m];
                if mx.holder != Some(n) {
                    mx.holder = Some(n);
                    plan.nodes[n].using.push(m);
                }
            }
            if let Some(v) = var {
                self.vars.get_mut_or_insert(v, VarReservation::default).holder = Some(n);
                self.held_var.insert(n, v);
            }
            trace!(node = %plan.nodes[n].node_id, "resources granted");
            return true;
        }

        for m in busy_mutexes {
            let waiters = &mut plan.mutexes[m].waiters;
            if !waiters.contains(&n) {
                waiters.push_back(n);
            }
        }
        if let Some(v) = var.filter(|_| var_blocked) {
            let waiters = &mut self.vars.get_mut_or_insert(v, VarReservation::default).waiters;
            if !waiters.contains(&n) {
                waiters.push_back(n);
            }
        }
        trace!(node = %plan.nodes[n].node_id, "resources denied");
        false
    }

    /// Release everything `n` holds, in reverse grant order, waking waiters.
    pub fn release_all(&mut self, plan: &mut Plan, n: NodeId) {
        let held: Vec<MutexId> = std::mem::take(&mut plan.nodes[n].using);
        for m in held.into_iter().rev() {
            self.release_mutex(plan, m, n);
        }
        if let Some(v) = self.held_var.remove(n) {
            let r = self.vars.get_mut(v).expect("reservation for held variable");
            assert_eq!(r.holder, Some(n), "release of variable reserved by another node");
            r.holder = None;
            // waiters stay registered until they acquire or give up
            self.woken.extend(r.waiters.iter().copied());
        }
    }

    fn release_mutex(&mut self, plan: &mut Plan, m: MutexId, n: NodeId) {
        let mx = &mut plan.mutexes[m];
        assert_eq!(
            mx.holder,
            Some(n),
            "node {} releasing mutex {} it does not hold",
            plan.nodes[n].node_id,
            mx.name
        );
        mx.holder = None;
        self.woken.extend(mx.waiters.iter().copied());
        trace!(node = %plan.nodes[n].node_id, mutex = %plan.mutexes[m].name, "mutex released");
    }

    /// Remove `n` from every wait list (it acquired, or stopped wanting).
    pub fn withdraw(&mut self, plan: &mut Plan, n: NodeId) {
        for m in plan.mutexes.keys().collect::<Vec<_>>() {
            plan.mutexes[m].waiters.retain(|w| *w != n);
        }
        for r in self.vars.values_mut() {
            r.waiters.retain(|w| *w != n);
        }
    }

    /// True when `n` waits on at least one resource.
    pub fn is_waiting(&self, plan: &Plan, n: NodeId) -> bool {
        plan.mutexes.entries().any(|(_, m)| m.waiters.contains(&n))
            || self.vars.values().any(|r| r.waiters.contains(&n))
    }

    /// Drain the nodes woken by releases since the last call.
    pub fn take_woken(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Mutex, Node, NodeType, SymbolTable};

    fn setup() -> (Plan, Arbiter, NodeId, NodeId, MutexId) {
        let mut p = Plan::new(SymbolTable::new());
        let root = p.nodes.push(Node::new("root", NodeType::List, None));
        let a = p.nodes.push(Node::new("a", NodeType::Assignment, Some(root)));
        let b = p.nodes.push(Node::new("b", NodeType::Assignment, Some(root)));
        let m = p.mutexes.push(Mutex::new("m", None));
        (p, Arbiter::new(), a, b, m)
    }

    #[test]
    fn all_or_none_grant() {
        let (mut p, mut arb, a, b, m) = setup();
        let m2 = p.mutexes.push(Mutex::new("m2", None));
        assert!(arb.try_acquire(&mut p, a, &[m], None));
        assert_eq!(p.mutexes[m].holder, Some(a));
        // b wants m and m2: m is busy, so neither is taken
        assert!(!arb.try_acquire(&mut p, b, &[m, m2], None));
        assert!(p.mutexes[m2].is_free());
        assert!(p.mutexes[m].waiters.contains(&b));
        assert!(arb.is_waiting(&p, b));
    }

    #[test]
    fn release_wakes_waiters_in_order() {
        let (mut p, mut arb, a, b, m) = setup();
        assert!(arb.try_acquire(&mut p, a, &[m], None));
        assert!(!arb.try_acquire(&mut p, b, &[m], None));
        arb.release_all(&mut p, a);
        assert!(p.mutexes[m].is_free());
        assert_eq!(arb.take_woken(), vec![b]);
        assert!(arb.try_acquire(&mut p, b, &[m], None));
        assert!(!arb.is_waiting(&p, b), "grant withdraws the node from wait lists");
        assert_eq!(p.nodes[b].using, vec![m]);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn release_of_unheld_mutex_is_fatal() {
        let (mut p, mut arb, a, b, m) = setup();
        assert!(arb.try_acquire(&mut p, a, &[m], None));
        p.nodes[b].using.push(m);
        arb.release_all(&mut p, b);
    }

    #[test]
    fn variable_reservations() {
        let (mut p, mut arb, a, b, _) = setup();
        let v = p.add_const(0); // stands in for a variable id
        assert!(arb.try_acquire(&mut p, a, &[], Some(v)));
        assert!(arb.var_busy(v, b));
        assert!(!arb.try_acquire(&mut p, b, &[], Some(v)));
        arb.release_all(&mut p, a);
        assert!(!arb.var_busy(v, b));
        assert_eq!(arb.take_woken(), vec![b]);
    }
}
