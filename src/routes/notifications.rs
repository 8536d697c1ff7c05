use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::db::HistoryStatus;
use crate::error::{AppError, AppResult};
use crate::services::dispatcher::{DispatchResult, NotificationPayload};
use crate::services::reminders;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/send-notification", post(send_notification))
        .route("/send-notifications", post(send_notifications))
        .route("/send-daily-notifications", post(send_daily_notifications))
        .route("/test-notification", post(send_test_notification))
        .route("/notification-history", get(list_history))
        .route("/notification-history/stats", get(history_stats))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct NotificationInput {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendNotificationRequest {
    pub token: Option<String>,
    pub notification: Option<NotificationInput>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct SendBatchRequest {
    pub tokens: Option<Vec<String>>,
    pub notification: Option<NotificationInput>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNotificationRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSingleResponse {
    pub success: bool,
    pub message_id: String,
}

/// One failed target. `token` is the shortened token reference, never the
/// full credential.
#[derive(Debug, Serialize)]
pub struct BatchErrorItem {
    pub token: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBatchResponse {
    pub success: bool,
    pub success_count: usize,
    pub total_count: usize,
    pub errors: Vec<BatchErrorItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDailyResponse {
    pub success: bool,
    pub success_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryListResponse {
    pub items: Vec<HistoryItemResponse>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct HistoryItemResponse {
    pub id: String,
    pub user_id: Option<String>,
    pub token_ref: String,
    pub title: String,
    pub body: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Serialize)]
pub struct HistoryStatsResponse {
    pub total_sent: i64,
    pub total_failed: i64,
}

impl From<DispatchResult> for SendBatchResponse {
    fn from(result: DispatchResult) -> Self {
        Self {
            success: true,
            success_count: result.success_count,
            total_count: result.total_count,
            errors: result
                .errors
                .into_iter()
                .map(|f| BatchErrorItem {
                    token: f.token_ref,
                    error: f.reason,
                })
                .collect(),
        }
    }
}

fn build_payload(
    notification: Option<NotificationInput>,
    data: HashMap<String, String>,
) -> AppResult<NotificationPayload> {
    let notification = notification.ok_or_else(|| {
        AppError::BadRequest("Notification title and body are required".to_string())
    })?;
    let (Some(title), Some(body)) = (notification.title, notification.body) else {
        return Err(AppError::BadRequest(
            "Notification title and body are required".to_string(),
        ));
    };
    if title.trim().is_empty() || body.trim().is_empty() {
        return Err(AppError::BadRequest(
            "Notification title and body are required".to_string(),
        ));
    }

    let mut payload = NotificationPayload::new(title, body).with_data(data);
    if let Some(icon) = notification.icon {
        payload = payload.with_icon(icon);
    }
    Ok(payload)
}

// ============================================================================
// Handlers
// ============================================================================

/// Deliver one notification to one device token.
async fn send_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendNotificationRequest>,
) -> AppResult<Json<SendSingleResponse>> {
    let token = request
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Device token is required".to_string()))?;
    let payload = build_payload(request.notification, request.data)?;

    let message_id = state.dispatcher.send_one(None, &token, &payload).await?;

    Ok(Json(SendSingleResponse {
        success: true,
        message_id,
    }))
}

/// Fan one notification out to a list of device tokens. Per-token failures
/// are reported in the response instead of failing the request.
async fn send_notifications(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendBatchRequest>,
) -> AppResult<Json<SendBatchResponse>> {
    let tokens = request
        .tokens
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::BadRequest("Tokens array is required".to_string()))?;
    let payload = build_payload(request.notification, request.data)?;

    let result = state.dispatcher.send(None, &tokens, &payload).await?;

    Ok(Json(result.into()))
}

/// Run the daily reminder batch now. Users with events today get their
/// event reminder; every other active token gets the daily announcement.
async fn send_daily_notifications(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<SendDailyResponse>> {
    let result = reminders::send_daily_batch(
        state.events.as_ref(),
        state.tokens.as_ref(),
        &state.dispatcher,
        Local::now().date_naive(),
    )
    .await?;

    Ok(Json(SendDailyResponse {
        success: true,
        success_count: result.success_count,
        total_count: result.total_count,
    }))
}

/// Send the canned test notification, to one user's devices when a user id
/// is given and to every active token otherwise.
async fn send_test_notification(
    State(state): State<Arc<AppState>>,
    request: Option<Json<TestNotificationRequest>>,
) -> AppResult<Json<SendBatchResponse>> {
    let user_id = request.and_then(|Json(r)| r.user_id);

    let records = match user_id.as_deref() {
        Some(user) => state.tokens.find_active_by_user(user).await?,
        None => state.tokens.all_active().await?,
    };
    let tokens: Vec<String> = records.into_iter().map(|r| r.token).collect();

    let payload = reminders::test_notification();
    let result = state
        .dispatcher
        .send(user_id.as_deref(), &tokens, &payload)
        .await?;

    Ok(Json(result.into()))
}

/// List delivery history, newest first, with optional user/status filters.
async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryListResponse>> {
    if let Some(status) = query.status.as_deref() {
        if status != "sent" && status != "failed" {
            return Err(AppError::BadRequest(
                "Status must be 'sent' or 'failed'".to_string(),
            ));
        }
    }

    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let entries = state
        .history
        .list(
            query.user_id.as_deref(),
            query.status.as_deref(),
            per_page,
            offset,
        )
        .await?;
    let total = state
        .history
        .count(query.user_id.as_deref(), query.status.as_deref())
        .await?;
    let total_pages = (total as f64 / per_page as f64).ceil() as i64;

    let items = entries
        .into_iter()
        .map(|entry| HistoryItemResponse {
            id: entry.id,
            user_id: entry.user_id,
            token_ref: entry.token_ref,
            title: entry.title,
            body: entry.body,
            status: entry.status,
            error_message: entry.error_message,
            created_at: entry.created_at,
        })
        .collect();

    Ok(Json(HistoryListResponse {
        items,
        total,
        page,
        per_page,
        total_pages,
    }))
}

/// Aggregate delivery counts across all users.
async fn history_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<HistoryStatsResponse>> {
    let (total_sent, total_failed) = tokio::try_join!(
        state.history.count_by_status(HistoryStatus::Sent),
        state.history.count_by_status(HistoryStatus::Failed),
    )?;

    Ok(Json(HistoryStatsResponse {
        total_sent,
        total_failed,
    }))
}
