use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A calendar event row. The reminder pipeline only reads events; CRUD for
/// them lives in the calendar application itself.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub time: Option<String>,
    pub color: Option<String>,
    pub is_lunar: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// The subset of an event the reminder builder consumes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}
