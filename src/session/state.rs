use super::model::{ChunkStatus, SessionStatus};

/// A status change the state machine does not allow
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {session_id} cannot move from {from} to {to}")]
    Illegal {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
}

impl SessionStatus {
    /// `completed` and `error` are final; only a manual reset leaves them
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }

    /// Statuses a session may move into `self` from.
    ///
    /// Status only moves forward. A chunked session passes through
    /// `chunking_completed` between materialising its chunks and handing
    /// them to the workers. `error` is reachable from every live state.
    pub fn predecessors(&self) -> &'static [SessionStatus] {
        use SessionStatus::*;

        match self {
            Queued | Recording => &[],
            Processing => &[Queued, Recording, ChunkingCompleted],
            ChunkingCompleted => &[Processing],
            Completed => &[Processing],
            Error => &[Queued, Recording, Processing, ChunkingCompleted],
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl ChunkStatus {
    /// Redelivery of a chunk message moves `processing` to `processing`
    pub fn predecessors(&self) -> &'static [ChunkStatus] {
        use ChunkStatus::*;

        match self {
            Queued => &[],
            Processing => &[Queued, Processing],
            Completed => &[Processing],
            Error => &[Queued, Processing],
        }
    }
}

/// Status strings accepted as the current value for a move into `to`
pub(crate) fn expected_for(to: SessionStatus) -> Vec<&'static str> {
    to.predecessors().iter().map(SessionStatus::as_str).collect()
}

pub(crate) fn expected_chunk_for(to: ChunkStatus) -> Vec<&'static str> {
    to.predecessors().iter().map(ChunkStatus::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges() {
        use SessionStatus::*;

        assert!(Queued.can_transition_to(Processing));
        assert!(Recording.can_transition_to(Processing));
        assert!(Processing.can_transition_to(ChunkingCompleted));
        assert!(ChunkingCompleted.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
    }

    #[test]
    fn terminal_states_never_regress() {
        for next in SessionStatus::ALL {
            assert!(!SessionStatus::Completed.can_transition_to(next));
            assert!(!SessionStatus::Error.can_transition_to(next));
        }
    }

    #[test]
    fn completion_requires_processing() {
        use SessionStatus::*;

        assert!(!Queued.can_transition_to(Completed));
        assert!(!ChunkingCompleted.can_transition_to(Completed));
        assert!(!Recording.can_transition_to(Completed));
    }
}
