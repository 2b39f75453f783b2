//! Writer state machine.
//!
//! `FetchAttributes -> [Create] -> Write -> Commit -> Finished`, with `Error`
//! reachable from everywhere. The transition function is pure; the writer
//! applies it under its phase lock.

/// Writer phases shared by every destination discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    FetchAttributes,
    Create,
    Write,
    Commit,
    Finished,
    Error,
}

impl WriterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

/// What just happened to the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterEvent {
    /// Destination probed. `create` is set when it has to be allocated first;
    /// `all_written` when no chunk remains to be written.
    Probed { create: bool, all_written: bool },
    Created { all_written: bool },
    /// The last outstanding chunk completed.
    AllWritten,
    Committed,
    Failed,
}

/// Next state after `event` in `state`. Events that do not apply leave the
/// state unchanged; terminal states absorb everything.
pub fn transition(state: WriterState, event: WriterEvent) -> WriterState {
    use WriterEvent as E;
    use WriterState as S;

    if state.is_terminal() {
        return state;
    }
    match (state, event) {
        (_, E::Failed) => S::Error,
        (S::FetchAttributes, E::Probed { create: true, .. }) => S::Create,
        (S::FetchAttributes, E::Probed { all_written, .. })
        | (S::Create, E::Created { all_written }) => {
            if all_written {
                S::Commit
            } else {
                S::Write
            }
        }
        (S::Write, E::AllWritten) => S::Commit,
        (S::Commit, E::Committed) => S::Finished,
        (s, _) => s,
    }
}
