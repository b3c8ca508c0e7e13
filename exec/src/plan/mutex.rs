use crate::plan::NodeId;
use std::collections::VecDeque;

/// A named binary resource. Declared by a node (lexically scoped) or
/// globally; acquired atomically in sets by Assignment and Command bodies.
#[derive(Clone, Debug)]
pub struct Mutex {
    pub name: String,
    /// Node that declared it; None for globals.
    pub owner: Option<NodeId>,
    pub holder: Option<NodeId>,
    /// FIFO wait list of nodes blocked on this mutex.
    pub waiters: VecDeque<NodeId>,
}

impl Mutex {
    pub fn new(name: impl Into<String>, owner: Option<NodeId>) -> Mutex {
        Mutex {
            name: name.into(),
            owner,
            holder: None,
            waiters: VecDeque::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }
}
