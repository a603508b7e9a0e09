//! The change request pipeline: state machine, diffing, merge execution,
//! and orchestration.

pub mod diff;
pub mod machine;
pub mod merge;
pub mod service;

pub use machine::{CrEventKind, CrState, TRANSITIONS, next_state};
pub use merge::{MergeApplied, MergeExecutor};
pub use service::{
    ApproveOutcome, ChangeService, OpenAppend, OpenLiveEdit, WAITING_FOR_REVIEWERS,
};
