use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use sqlx::SqlitePool;

use crate::db::models::EventSummary;
use crate::db::repository::{classify_sqlx, StoreResult};

/// Read-only view of calendar events, as consumed by the reminder pipeline.
/// Event CRUD belongs to the calendar application and stays outside this
/// service.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn events_on_date(&self, user_id: &str, date: NaiveDate)
        -> StoreResult<Vec<EventSummary>>;

    /// Distinct users that have at least one event on the given date.
    async fn users_with_events_on(&self, date: NaiveDate) -> StoreResult<Vec<String>>;
}

pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn events_on_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> StoreResult<Vec<EventSummary>> {
        sqlx::query_as::<_, EventSummary>(
            r#"
            SELECT id, title, description
            FROM events
            WHERE user_id = ? AND year = ? AND month = ? AND day = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(date.year())
        .bind(date.month() as i32)
        .bind(date.day() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn users_with_events_on(&self, date: NaiveDate) -> StoreResult<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT user_id
            FROM events
            WHERE year = ? AND month = ? AND day = ?
            ORDER BY user_id ASC
            "#,
        )
        .bind(date.year())
        .bind(date.month() as i32)
        .bind(date.day() as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::testing::memory_pool;
    use chrono::Utc;
    use uuid::Uuid;

    async fn insert_event(pool: &SqlitePool, user_id: &str, title: &str, date: NaiveDate) {
        let now = Utc::now().naive_utc();
        sqlx::query(
            r#"
            INSERT INTO events (id, user_id, title, description, year, month, day, is_lunar, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(title)
        .bind(date.year())
        .bind(date.month() as i32)
        .bind(date.day() as i32)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn events_on_date_filters_user_and_date() {
        let pool = memory_pool().await;
        let store = SqliteEventStore::new(pool.clone());
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let tomorrow = NaiveDate::from_ymd_opt(2024, 3, 16).unwrap();

        insert_event(&pool, "user-1", "Họp nhóm", today).await;
        insert_event(&pool, "user-1", "Sinh nhật", tomorrow).await;
        insert_event(&pool, "user-2", "Giỗ tổ", today).await;

        let events = store.events_on_date("user-1", today).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Họp nhóm");
    }

    #[tokio::test]
    async fn users_with_events_on_deduplicates() {
        let pool = memory_pool().await;
        let store = SqliteEventStore::new(pool.clone());
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

        insert_event(&pool, "user-1", "A", today).await;
        insert_event(&pool, "user-1", "B", today).await;
        insert_event(&pool, "user-2", "C", today).await;

        let users = store.users_with_events_on(today).await.unwrap();
        assert_eq!(users, vec!["user-1".to_string(), "user-2".to_string()]);
    }

    #[tokio::test]
    async fn empty_date_yields_no_users() {
        let pool = memory_pool().await;
        let store = SqliteEventStore::new(pool);
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

        assert!(store.users_with_events_on(date).await.unwrap().is_empty());
        assert!(store.events_on_date("user-1", date).await.unwrap().is_empty());
    }
}
