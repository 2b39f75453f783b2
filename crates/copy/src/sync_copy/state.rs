//! Synchronous copy state machine.
//!
//! `FetchSourceAttributes -> GetDestination -> [Create] -> [PreCopy] -> Copy
//! -> Commit -> Finished`, with `Error` reachable from every live state.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCopyState {
    FetchSourceAttributes,
    GetDestination,
    Create,
    /// Discovering which ranges of a sparse source hold data.
    PreCopy,
    Copy,
    Commit,
    Finished,
    Error,
}

impl SyncCopyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCopyEvent {
    SourceFetched,
    /// `create`: allocate the destination first. `discover`: run range
    /// discovery before copying.
    DestinationChecked { create: bool, discover: bool },
    Created { discover: bool },
    RangesDiscovered,
    /// Every scheduled chunk has been copied.
    AllCopied,
    Committed,
    Failed,
}

pub fn transition(state: SyncCopyState, event: SyncCopyEvent) -> SyncCopyState {
    use SyncCopyEvent as E;
    use SyncCopyState as S;

    if state.is_terminal() {
        return state;
    }
    match (state, event) {
        (_, E::Failed) => S::Error,
        (S::FetchSourceAttributes, E::SourceFetched) => S::GetDestination,
        (S::GetDestination, E::DestinationChecked { create: true, .. }) => S::Create,
        (S::GetDestination, E::DestinationChecked { discover: true, .. })
        | (S::Create, E::Created { discover: true }) => S::PreCopy,
        (S::GetDestination, E::DestinationChecked { .. })
        | (S::Create, E::Created { .. })
        | (S::PreCopy, E::RangesDiscovered) => S::Copy,
        (S::Copy, E::AllCopied) => S::Commit,
        (S::Commit, E::Committed) => S::Finished,
        (s, _) => s,
    }
}
