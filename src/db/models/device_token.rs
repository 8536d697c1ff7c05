use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered device push token. At most one row per `(user_id, token)`
/// may be active; a user with several devices holds several active rows.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeviceTokenRecord {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub is_active: bool,
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub language: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Informational device metadata captured at registration time. Never used
/// for delivery decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeviceToken {
    pub user_id: String,
    pub token: String,
    pub device_info: DeviceInfo,
}
