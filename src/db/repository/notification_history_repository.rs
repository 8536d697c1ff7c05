use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{HistoryStatus, NewHistoryEntry, NotificationHistoryEntry};
use crate::db::repository::{classify_sqlx, StoreResult};

// ============================================================================
// Notification History Store
// ============================================================================

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Record one per-target delivery outcome.
    async fn record(&self, entry: NewHistoryEntry) -> StoreResult<NotificationHistoryEntry>;

    /// List entries, newest first, with optional user/status filters.
    async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<NotificationHistoryEntry>>;

    /// Count entries matching the same filters as `list`.
    async fn count(&self, user_id: Option<&str>, status: Option<&str>) -> StoreResult<i64>;

    async fn count_by_status(&self, status: HistoryStatus) -> StoreResult<i64>;
}

pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn record(&self, entry: NewHistoryEntry) -> StoreResult<NotificationHistoryEntry> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query_as::<_, NotificationHistoryEntry>(
            r#"
            INSERT INTO notification_history (
                id, user_id, token_ref, title, body, status, error_message, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, user_id, token_ref, title, body, status, error_message, created_at
            "#,
        )
        .bind(id)
        .bind(&entry.user_id)
        .bind(&entry.token_ref)
        .bind(&entry.title)
        .bind(&entry.body)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn list(
        &self,
        user_id: Option<&str>,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<NotificationHistoryEntry>> {
        sqlx::query_as::<_, NotificationHistoryEntry>(
            r#"
            SELECT id, user_id, token_ref, title, body, status, error_message, created_at
            FROM notification_history
            WHERE (? IS NULL OR user_id = ?)
            AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn count(&self, user_id: Option<&str>, status: Option<&str>) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM notification_history
            WHERE (? IS NULL OR user_id = ?)
            AND (? IS NULL OR status = ?)
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn count_by_status(&self, status: HistoryStatus) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notification_history WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx)
    }
}
