use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery status of a single notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    Sent,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Sent => "sent",
            HistoryStatus::Failed => "failed",
        }
    }
}

/// One per-target delivery record. `token_ref` holds a truncated token
/// reference, never the full device token.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationHistoryEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub token_ref: String,
    pub title: String,
    pub body: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub user_id: Option<String>,
    pub token_ref: String,
    pub title: String,
    pub body: String,
    pub status: HistoryStatus,
    pub error_message: Option<String>,
}
