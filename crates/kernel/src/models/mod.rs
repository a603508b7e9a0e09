//! Catalog models.

pub mod audit;
pub mod change_request;
pub mod dataset;
pub mod notification;
pub mod project;
pub mod upload;
pub mod user;

pub use audit::{AuditEvent, NewAuditEvent};
pub use change_request::{
    ChangeRequest, CrComment, CrEvent, CrKind, EditSet, EditedCell, NewChangeRequest,
    ReviewerDecision, ReviewerState,
};
pub use dataset::{CreateDataset, Dataset, DatasetMeta, StorageKind};
pub use notification::Notification;
pub use project::{MemberInfo, Project, ProjectRole};
pub use upload::{MAX_UPLOAD_BYTES, Upload};
pub use user::{CreateUser, User};
