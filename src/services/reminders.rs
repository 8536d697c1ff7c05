use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::db::{EventStore, EventSummary, TokenStore};
use crate::error::AppResult;
use crate::i18n;
use crate::services::dispatcher::{DispatchResult, Dispatcher, NotificationPayload, EVENT_TAG};

/// `data.type` marker for a single-event reminder.
pub const DATA_TYPE_EVENT: &str = "event_reminder";
/// `data.type` marker for an aggregated reminder.
pub const DATA_TYPE_MULTIPLE: &str = "multiple_events";

/// Build the reminder payload for a user's events on one day.
///
/// One event produces a payload about that event, preferring its own
/// description as the body. Several events collapse into a count plus the
/// joined titles; the aggregate keeps the shared coalescing tag while a
/// single event gets a per-event tag, so reminders about different events
/// never replace each other on screen.
pub fn build_event_reminder(events: &[EventSummary]) -> Option<NotificationPayload> {
    match events {
        [] => None,
        [event] => {
            let title = i18n::t_with("reminder.single.title", &[("title", &event.title)]);
            let body = event
                .description
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| {
                    i18n::t_with("reminder.single.body", &[("title", &event.title)])
                });

            let mut data = HashMap::new();
            data.insert("eventId".to_string(), event.id.clone());
            data.insert("type".to_string(), DATA_TYPE_EVENT.to_string());

            Some(
                NotificationPayload::new(title, body)
                    .with_tag(format!("{}-{}", EVENT_TAG, event.id))
                    .with_data(data),
            )
        }
        many => {
            let count = many.len().to_string();
            let titles = many
                .iter()
                .map(|e| e.title.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let title = i18n::t_with("reminder.multiple.title", &[("count", &count)]);
            let body = i18n::t_with(
                "reminder.multiple.body",
                &[("count", &count), ("titles", &titles)],
            );

            let mut data = HashMap::new();
            data.insert("type".to_string(), DATA_TYPE_MULTIPLE.to_string());
            data.insert("eventCount".to_string(), count);

            Some(NotificationPayload::new(title, body).with_data(data))
        }
    }
}

/// The generic daily reminder for users without events today.
pub fn daily_announcement() -> NotificationPayload {
    NotificationPayload::new(i18n::t("daily.title"), i18n::t("daily.body"))
}

/// Canned payload for the delivery-pipeline test endpoint.
pub fn test_notification() -> NotificationPayload {
    NotificationPayload::new(i18n::t("test.title"), i18n::t("test.body"))
}

/// Run one daily batch over every active token.
///
/// Users with events on `date` get their event reminder; every other
/// active token gets the generic announcement, so the batch reaches the
/// whole device fleet exactly once. Per-user failures are logged and the
/// batch moves on.
pub async fn send_daily_batch(
    events: &dyn EventStore,
    tokens: &dyn TokenStore,
    dispatcher: &Dispatcher,
    date: NaiveDate,
) -> AppResult<DispatchResult> {
    let all_tokens = tokens.all_active().await?;
    if all_tokens.is_empty() {
        tracing::info!("Daily batch: no active tokens");
        return Ok(DispatchResult::default());
    }

    let mut aggregate = DispatchResult::default();
    let mut covered: HashSet<String> = HashSet::new();

    for user_id in events.users_with_events_on(date).await? {
        let user_events = match events.events_on_date(&user_id, date).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Failed to load events for user {}: {}", user_id, e);
                continue;
            }
        };
        let Some(payload) = build_event_reminder(&user_events) else {
            continue;
        };

        let user_tokens: Vec<String> = all_tokens
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.token.clone())
            .collect();
        if user_tokens.is_empty() {
            tracing::debug!("User {} has events today but no active tokens", user_id);
            continue;
        }

        covered.insert(user_id.clone());
        match dispatcher.send(Some(&user_id), &user_tokens, &payload).await {
            Ok(result) => aggregate.merge(result),
            Err(e) => tracing::warn!("Daily dispatch for user {} failed: {}", user_id, e),
        }
    }

    // Everyone else still hears from the calendar once a day.
    let announcement = daily_announcement();
    let mut remaining: HashMap<String, Vec<String>> = HashMap::new();
    for record in all_tokens.iter().filter(|t| !covered.contains(&t.user_id)) {
        remaining
            .entry(record.user_id.clone())
            .or_default()
            .push(record.token.clone());
    }
    for (user_id, user_tokens) in remaining {
        match dispatcher
            .send(Some(&user_id), &user_tokens, &announcement)
            .await
        {
            Ok(result) => aggregate.merge(result),
            Err(e) => tracing::warn!("Daily announcement for user {} failed: {}", user_id, e),
        }
    }

    tracing::info!(
        "Daily batch complete: {}/{} deliveries succeeded",
        aggregate.success_count,
        aggregate.total_count
    );
    Ok(aggregate)
}
