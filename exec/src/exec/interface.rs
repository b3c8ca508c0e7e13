//! The contract between the executive and the outside world.
//!
//! The executive calls *out* through [ExternalInterface]; the world answers
//! *in* through an MPSC channel of [InputEvent]s, drained at the start of
//! every scheduler step. No callback re-enters the executive: even the
//! synchronous operations only touch the implementation's own state.

use crate::core::{CommandHandle, Value};
use crate::expr::ExprId;
use crate::plan::{CommandId, NodeId};
use crossbeam_channel::{Receiver, Sender};

/// Snapshot of a command dispatch: name and arguments evaluated exactly
/// once, plus the names of the granted resources.
#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<Value>,
    pub resources: Vec<String>,
}

/// Snapshot of an update dispatch.
#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub pairs: Vec<(String, Value)>,
}

/// Snapshot of an assignment application, offered to the interface for
/// mirroring; the executive performs the actual variable write itself.
#[derive(Clone, Debug)]
pub struct AssignmentRequest {
    pub node: NodeId,
    pub variable: String,
    pub value: Value,
}

/// A state (lookup) read or subscription.
#[derive(Clone, Debug)]
pub struct LookupRequest {
    pub state_name: String,
    pub args: Vec<Value>,
    pub tolerance: Option<f64>,
}

/// Acknowledgements and world-state changes flowing back into the executive.
#[derive(Clone, Debug)]
pub enum InputEvent {
    CommandHandle { command: CommandId, handle: CommandHandle },
    CommandReturn { command: CommandId, value: Value },
    CommandAbortAck { command: CommandId, success: bool },
    UpdateAck { node: NodeId, success: bool },
    LookupUpdate { lookup: ExprId, value: Value },
}

/// What the executive needs from the environment. Implementations receive a
/// [Sender] at registration and answer asynchronously through it; only
/// `current_time`, `lookup_now` and `execute_assignment` are synchronous.
pub trait ExternalInterface {
    fn current_time(&mut self) -> f64;

    /// Dispatch a command. The implementation eventually reports progress
    /// through [InputEvent::CommandHandle] (and [InputEvent::CommandReturn]
    /// if the command has a return value).
    fn execute_command(&mut self, command: CommandId, request: &CommandRequest);

    /// Request an abort of a previously dispatched command; answered by
    /// [InputEvent::CommandAbortAck].
    fn abort_command(&mut self, command: CommandId);

    /// Post a planner update; answered by [InputEvent::UpdateAck].
    fn execute_update(&mut self, node: NodeId, request: &UpdateRequest);

    /// Mirror an assignment the executive is about to apply. The return
    /// value is advisory.
    fn execute_assignment(&mut self, request: &AssignmentRequest) -> bool {
        let _ = request;
        true
    }

    /// Immediate read of an external state.
    fn lookup_now(&mut self, request: &LookupRequest) -> Value;

    /// Register interest in changes of an external state; the implementation
    /// reports them through [InputEvent::LookupUpdate] keyed by `lookup`.
    fn subscribe_lookup(&mut self, lookup: ExprId, request: &LookupRequest, tolerance: Option<f64>);

    fn unsubscribe_lookup(&mut self, lookup: ExprId);
}

/// An interface to nowhere: time stands still, commands vanish, lookups are
/// unknown. Used by unit tests and as a placeholder.
pub struct NullInterface;

impl ExternalInterface for NullInterface {
    fn current_time(&mut self) -> f64 {
        0.0
    }
    fn execute_command(&mut self, _command: CommandId, _request: &CommandRequest) {}
    fn abort_command(&mut self, _command: CommandId) {}
    fn execute_update(&mut self, _node: NodeId, _request: &UpdateRequest) {}
    fn lookup_now(&mut self, _request: &LookupRequest) -> Value {
        Value::Unknown
    }
    fn subscribe_lookup(&mut self, _lookup: ExprId, _request: &LookupRequest, _tolerance: Option<f64>) {}
    fn unsubscribe_lookup(&mut self, _lookup: ExprId) {}
}

/// Creates the input channel pair: the receiver goes to the executive, the
/// sender to the interface implementation.
pub fn input_channel() -> (Sender<InputEvent>, Receiver<InputEvent>) {
    crossbeam_channel::unbounded()
}
