use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{DeviceTokenRecord, NewDeviceToken};
use crate::db::repository::{classify_sqlx, StoreResult};

/// Persistence seam for device push tokens. The registrar writes through
/// this trait; the dispatcher and relay handlers read through it.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a token as active. Saving an already-known `(user, token)`
    /// pair refreshes the existing row instead of creating a duplicate.
    async fn save(&self, token: NewDeviceToken) -> StoreResult<DeviceTokenRecord>;

    async fn find_active_by_user(&self, user_id: &str) -> StoreResult<Vec<DeviceTokenRecord>>;

    async fn find_by_user_and_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> StoreResult<Option<DeviceTokenRecord>>;

    /// Retire all active tokens of a user. Returns the number of rows
    /// touched; retiring an already-clean user is not an error.
    async fn deactivate_by_user(&self, user_id: &str) -> StoreResult<u64>;

    /// Retire every active row carrying this token, regardless of user.
    async fn deactivate_by_token(&self, token: &str) -> StoreResult<u64>;

    async fn all_active(&self) -> StoreResult<Vec<DeviceTokenRecord>>;
}

pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn save(&self, token: NewDeviceToken) -> StoreResult<DeviceTokenRecord> {
        // Reactivate-or-insert. The insert branch only runs when no row for
        // this (user, token) pair exists at all, so the pair stays unique.
        let updated = sqlx::query_as::<_, DeviceTokenRecord>(
            r#"
            UPDATE device_tokens
            SET is_active = 1, user_agent = ?, platform = ?, language = ?
            WHERE user_id = ? AND token = ?
            RETURNING id, user_id, token, is_active, user_agent, platform, language, created_at
            "#,
        )
        .bind(&token.device_info.user_agent)
        .bind(&token.device_info.platform)
        .bind(&token.device_info.language)
        .bind(&token.user_id)
        .bind(&token.token)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        if let Some(row) = updated {
            return Ok(row);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        let row = sqlx::query_as::<_, DeviceTokenRecord>(
            r#"
            INSERT INTO device_tokens (
                id, user_id, token, is_active, user_agent, platform, language, created_at
            ) VALUES (?, ?, ?, 1, ?, ?, ?, ?)
            RETURNING id, user_id, token, is_active, user_agent, platform, language, created_at
            "#,
        )
        .bind(id)
        .bind(&token.user_id)
        .bind(&token.token)
        .bind(&token.device_info.user_agent)
        .bind(&token.device_info.platform)
        .bind(&token.device_info.language)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        Ok(row)
    }

    async fn find_active_by_user(&self, user_id: &str) -> StoreResult<Vec<DeviceTokenRecord>> {
        sqlx::query_as::<_, DeviceTokenRecord>(
            r#"
            SELECT id, user_id, token, is_active, user_agent, platform, language, created_at
            FROM device_tokens
            WHERE user_id = ? AND is_active = 1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn find_by_user_and_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> StoreResult<Option<DeviceTokenRecord>> {
        sqlx::query_as::<_, DeviceTokenRecord>(
            r#"
            SELECT id, user_id, token, is_active, user_agent, platform, language, created_at
            FROM device_tokens
            WHERE user_id = ? AND token = ?
            "#,
        )
        .bind(user_id)
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)
    }

    async fn deactivate_by_user(&self, user_id: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE device_tokens SET is_active = 0 WHERE user_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        Ok(result.rows_affected())
    }

    async fn deactivate_by_token(&self, token: &str) -> StoreResult<u64> {
        let result =
            sqlx::query("UPDATE device_tokens SET is_active = 0 WHERE token = ? AND is_active = 1")
                .bind(token)
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx)?;

        Ok(result.rows_affected())
    }

    async fn all_active(&self) -> StoreResult<Vec<DeviceTokenRecord>> {
        sqlx::query_as::<_, DeviceTokenRecord>(
            r#"
            SELECT id, user_id, token, is_active, user_agent, platform, language, created_at
            FROM device_tokens
            WHERE is_active = 1
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)
    }
}
