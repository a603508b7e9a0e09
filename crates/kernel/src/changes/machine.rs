//! Change request state machine.
//!
//! The transition table is data, not control flow: every legal move is a
//! row in [`TRANSITIONS`], and the service layer asks [`next_state`]
//! before writing anything. Tests enumerate the table exhaustively.
//!
//! ```text
//! draft → pending_review → {approved | rejected | withdrawn}
//! approved → merging → {merged | pending_review}
//! merged → {closed | cleanup_pending} → closed
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle states of a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrState {
    Draft,
    PendingReview,
    Approved,
    Merging,
    Merged,
    CleanupPending,
    Closed,
    Rejected,
    Withdrawn,
}

impl CrState {
    pub fn as_str(self) -> &'static str {
        match self {
            CrState::Draft => "draft",
            CrState::PendingReview => "pending_review",
            CrState::Approved => "approved",
            CrState::Merging => "merging",
            CrState::Merged => "merged",
            CrState::CleanupPending => "cleanup_pending",
            CrState::Closed => "closed",
            CrState::Rejected => "rejected",
            CrState::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CrState::Draft),
            "pending_review" => Some(CrState::PendingReview),
            "approved" => Some(CrState::Approved),
            "merging" => Some(CrState::Merging),
            "merged" => Some(CrState::Merged),
            "cleanup_pending" => Some(CrState::CleanupPending),
            "closed" => Some(CrState::Closed),
            "rejected" => Some(CrState::Rejected),
            "withdrawn" => Some(CrState::Withdrawn),
            _ => None,
        }
    }

    /// States from which no further transition exists.
    pub fn is_final(self) -> bool {
        matches!(self, CrState::Closed | CrState::Rejected | CrState::Withdrawn)
    }

    /// States in which the change request no longer accepts reviewer or
    /// requester actions (only cleanup and audit linkage may follow).
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            CrState::Merged
                | CrState::CleanupPending
                | CrState::Closed
                | CrState::Rejected
                | CrState::Withdrawn
        )
    }
}

/// Events that drive the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrEventKind {
    Submit,
    /// A reviewer approved but reviewers are still pending.
    ApprovePartial,
    /// The last pending reviewer approved.
    ApproveQuorum,
    Reject,
    Withdraw,
    MergeStart,
    MergeSuccess,
    MergeFail,
    CleanupSuccess,
    CleanupDeferred,
}

/// One legal move.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: CrState,
    pub event: CrEventKind,
    pub to: CrState,
}

/// The complete transition table.
pub const TRANSITIONS: &[Transition] = &[
    Transition {
        from: CrState::Draft,
        event: CrEventKind::Submit,
        to: CrState::PendingReview,
    },
    Transition {
        from: CrState::PendingReview,
        event: CrEventKind::ApprovePartial,
        to: CrState::PendingReview,
    },
    Transition {
        from: CrState::PendingReview,
        event: CrEventKind::ApproveQuorum,
        to: CrState::Approved,
    },
    Transition {
        from: CrState::PendingReview,
        event: CrEventKind::Reject,
        to: CrState::Rejected,
    },
    Transition {
        from: CrState::PendingReview,
        event: CrEventKind::Withdraw,
        to: CrState::Withdrawn,
    },
    Transition {
        from: CrState::Approved,
        event: CrEventKind::MergeStart,
        to: CrState::Merging,
    },
    Transition {
        from: CrState::Merging,
        event: CrEventKind::MergeSuccess,
        to: CrState::Merged,
    },
    Transition {
        from: CrState::Merging,
        event: CrEventKind::MergeFail,
        to: CrState::PendingReview,
    },
    Transition {
        from: CrState::Merged,
        event: CrEventKind::CleanupSuccess,
        to: CrState::Closed,
    },
    Transition {
        from: CrState::Merged,
        event: CrEventKind::CleanupDeferred,
        to: CrState::CleanupPending,
    },
    Transition {
        from: CrState::CleanupPending,
        event: CrEventKind::CleanupSuccess,
        to: CrState::Closed,
    },
];

/// The state reached by `event` from `from`, if the move is legal.
pub fn next_state(from: CrState, event: CrEventKind) -> Option<CrState> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.event == event)
        .map(|t| t.to)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const ALL_STATES: &[CrState] = &[
        CrState::Draft,
        CrState::PendingReview,
        CrState::Approved,
        CrState::Merging,
        CrState::Merged,
        CrState::CleanupPending,
        CrState::Closed,
        CrState::Rejected,
        CrState::Withdrawn,
    ];

    const ALL_EVENTS: &[CrEventKind] = &[
        CrEventKind::Submit,
        CrEventKind::ApprovePartial,
        CrEventKind::ApproveQuorum,
        CrEventKind::Reject,
        CrEventKind::Withdraw,
        CrEventKind::MergeStart,
        CrEventKind::MergeSuccess,
        CrEventKind::MergeFail,
        CrEventKind::CleanupSuccess,
        CrEventKind::CleanupDeferred,
    ];

    #[test]
    fn state_names_round_trip() {
        for &state in ALL_STATES {
            assert_eq!(CrState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CrState::parse("unknown"), None);
    }

    #[test]
    fn every_legal_transition_resolves() {
        for t in TRANSITIONS {
            assert_eq!(next_state(t.from, t.event), Some(t.to));
        }
    }

    #[test]
    fn no_transition_leaves_a_final_state() {
        for &state in ALL_STATES {
            if !state.is_final() {
                continue;
            }
            for &event in ALL_EVENTS {
                assert_eq!(
                    next_state(state, event),
                    None,
                    "{state:?} must not transition on {event:?}"
                );
            }
        }
    }

    #[test]
    fn exactly_the_specified_moves_exist() {
        let mut legal = 0;
        for &from in ALL_STATES {
            for &event in ALL_EVENTS {
                if next_state(from, event).is_some() {
                    legal += 1;
                }
            }
        }
        assert_eq!(legal, TRANSITIONS.len());
    }

    #[test]
    fn rejection_and_withdrawal_are_terminal() {
        assert_eq!(next_state(CrState::PendingReview, CrEventKind::Reject), Some(CrState::Rejected));
        assert!(CrState::Rejected.is_final());
        assert!(CrState::Withdrawn.is_final());
        assert!(CrState::Merged.is_settled());
        assert!(!CrState::Merged.is_final());
    }

    #[test]
    fn merge_failure_returns_to_review() {
        assert_eq!(
            next_state(CrState::Merging, CrEventKind::MergeFail),
            Some(CrState::PendingReview)
        );
        assert_eq!(
            next_state(CrState::CleanupPending, CrEventKind::CleanupSuccess),
            Some(CrState::Closed)
        );
    }
}
