use std::fmt::{Display, Formatter};

/// The thirteen condition slots of a node, in teardown order: the ancestor
/// variants must come before the conditions they are combined from, so that
/// slot-ordered cleanup releases them first.
///
/// Slots 0-2 of a List/LibraryCall node hold the *combined* conditions its
/// children consult; a node reads its own ancestor conditions from its
/// parent's slots.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum Condition {
    AncestorExit = 0,
    AncestorInvariant,
    AncestorEnd,
    Skip,
    Start,
    Pre,
    Exit,
    Invariant,
    End,
    Post,
    Repeat,
    /// Synthesized for every non-Empty node type.
    ActionComplete,
    /// Synthesized for Command nodes only.
    AbortComplete,
}

impl Condition {
    pub const COUNT: usize = 13;

    /// The slots a plan may set explicitly.
    pub const USER: [Condition; 8] = [
        Condition::Skip,
        Condition::Start,
        Condition::Pre,
        Condition::Exit,
        Condition::Invariant,
        Condition::End,
        Condition::Post,
        Condition::Repeat,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Condition> {
        use Condition::*;
        [
            AncestorExit,
            AncestorInvariant,
            AncestorEnd,
            Skip,
            Start,
            Pre,
            Exit,
            Invariant,
            End,
            Post,
            Repeat,
            ActionComplete,
            AbortComplete,
        ]
        .get(i)
        .copied()
    }

    /// Pre and Post never drive a transition check on change; they are only
    /// sampled at the instant another guard fires.
    pub fn notifies(self) -> bool {
        !matches!(self, Condition::Pre | Condition::Post)
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Condition::AncestorExit => "AncestorExitCondition",
            Condition::AncestorInvariant => "AncestorInvariantCondition",
            Condition::AncestorEnd => "AncestorEndCondition",
            Condition::Skip => "SkipCondition",
            Condition::Start => "StartCondition",
            Condition::Pre => "PreCondition",
            Condition::Exit => "ExitCondition",
            Condition::Invariant => "InvariantCondition",
            Condition::End => "EndCondition",
            Condition::Post => "PostCondition",
            Condition::Repeat => "RepeatCondition",
            Condition::ActionComplete => "ActionCompleteCondition",
            Condition::AbortComplete => "AbortCompleteCondition",
        };
        write!(f, "{name}")
    }
}
