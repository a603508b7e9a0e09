//! Best-effort notification fan-out.
//!
//! Notifications are catalog rows surfaced to users; delivery failures
//! are logged and never propagate, so no state transition can be gated on
//! the notifier.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Notification;

/// Notification service.
#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
}

impl Notifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Notify one user. Best effort.
    pub async fn notify(&self, user_id: Uuid, message: &str, metadata: serde_json::Value) {
        if let Err(e) = Notification::create(&self.pool, user_id, message, metadata).await {
            tracing::warn!(error = %e, %user_id, "failed to deliver notification");
        }
    }

    /// Notify several users. Best effort; `skip` is excluded (usually the
    /// actor who caused the event).
    pub async fn notify_many(
        &self,
        user_ids: &[Uuid],
        skip: Option<Uuid>,
        message: &str,
        metadata: serde_json::Value,
    ) {
        for &user_id in user_ids {
            if Some(user_id) == skip {
                continue;
            }
            self.notify(user_id, message, metadata.clone()).await;
        }
    }
}
