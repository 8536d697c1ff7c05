use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::db::{EventStore, TokenStore};
use crate::error::AppResult;
use crate::services::dispatcher::Dispatcher;
use crate::services::reminders;

/// Upper bound for a single sleep. Waking at least this often keeps the
/// loop honest against clock adjustments and suspend/resume gaps.
pub(crate) const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(300);

/// The configured hour on `date`, if that instant exists in local time.
/// A DST gap can swallow it; an ambiguous instant resolves to the
/// earlier occurrence.
fn local_at_hour(date: NaiveDate, hour: u32) -> Option<DateTime<Local>> {
    let naive = date.and_hms_opt(hour, 0, 0)?;
    Local.from_local_datetime(&naive).earliest()
}

/// Next strictly-future instant at `hour` o'clock local time.
pub fn next_fire_at(now: DateTime<Local>, hour: u32) -> DateTime<Local> {
    let mut date = now.date_naive();
    for _ in 0..4 {
        if let Some(candidate) = local_at_hour(date, hour) {
            if candidate > now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    // A calendar where the hour never materializes; fall back to a plain
    // 24h delay.
    now + chrono::Duration::hours(24)
}

/// Per-user daily reminder loop. Computes the next fire instant, sleeps
/// in bounded chunks, dispatches that day's reminder, repeats. A cycle
/// that fails is logged and never kills the loop.
pub struct ReminderScheduler {
    events: Arc<dyn EventStore>,
    tokens: Arc<dyn TokenStore>,
    dispatcher: Dispatcher,
    hour: u32,
    control: Mutex<Option<broadcast::Sender<()>>>,
}

impl ReminderScheduler {
    pub fn new(
        events: Arc<dyn EventStore>,
        tokens: Arc<dyn TokenStore>,
        dispatcher: Dispatcher,
        hour: u32,
    ) -> Self {
        Self {
            events,
            tokens,
            dispatcher,
            hour,
            control: Mutex::new(None),
        }
    }

    /// Start the loop for `user_id`, replacing any loop started earlier.
    pub async fn start(&self, user_id: String) -> JoinHandle<()> {
        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        {
            let mut control = self.control.lock().await;
            if let Some(previous) = control.take() {
                let _ = previous.send(());
            }
            *control = Some(stop_tx);
        }

        let events = Arc::clone(&self.events);
        let tokens = Arc::clone(&self.tokens);
        let dispatcher = self.dispatcher.clone();
        let hour = self.hour;

        tokio::spawn(async move {
            tracing::info!("Daily reminder loop started for user {}", user_id);
            let mut last_fire: Option<DateTime<Local>> = None;

            loop {
                let mut target = next_fire_at(Local::now(), hour);
                // Never fire twice for the same instant, even if the wall
                // clock was set backwards while we slept.
                if let Some(previous) = last_fire {
                    if target <= previous {
                        target = next_fire_at(previous, hour);
                    }
                }
                tracing::debug!("Next daily reminder for user {} at {}", user_id, target);

                loop {
                    let now = Local::now();
                    if now >= target {
                        break;
                    }
                    let remaining = (target - now).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = stop_rx.recv() => {
                            tracing::info!("Daily reminder loop stopped for user {}", user_id);
                            return;
                        }
                        _ = tokio::time::sleep(remaining.min(MAX_SLEEP_CHUNK)) => {}
                    }
                }

                last_fire = Some(target);
                let today = Local::now().date_naive();
                if let Err(e) =
                    run_cycle(events.as_ref(), tokens.as_ref(), &dispatcher, &user_id, today)
                        .await
                {
                    tracing::warn!("Daily reminder cycle for user {} failed: {:?}", user_id, e);
                }
            }
        })
    }

    pub async fn stop(&self) {
        if let Some(control) = self.control.lock().await.take() {
            let _ = control.send(());
        }
    }

    pub async fn is_running(&self) -> bool {
        self.control.lock().await.is_some()
    }
}

/// One reminder cycle: load the user's events for `date`, build the
/// payload, fan it out to their active tokens.
async fn run_cycle(
    events: &dyn EventStore,
    tokens: &dyn TokenStore,
    dispatcher: &Dispatcher,
    user_id: &str,
    date: NaiveDate,
) -> AppResult<()> {
    let summaries = events.events_on_date(user_id, date).await?;
    let Some(payload) = reminders::build_event_reminder(&summaries) else {
        tracing::debug!("No events today for user {}", user_id);
        return Ok(());
    };

    let records = tokens.find_active_by_user(user_id).await?;
    if records.is_empty() {
        tracing::debug!("No active tokens for user {}; skipping reminder", user_id);
        return Ok(());
    }

    let targets: Vec<String> = records.into_iter().map(|r| r.token).collect();
    let result = dispatcher.send(Some(user_id), &targets, &payload).await?;
    tracing::info!(
        "Daily reminder for user {}: {}/{} deliveries succeeded",
        user_id,
        result.success_count,
        result.total_count
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use sqlx::SqlitePool;
    use uuid::Uuid;

    use crate::db::repository::testing::memory_pool;
    use crate::db::{
        DeviceInfo, NewDeviceToken, SqliteEventStore, SqliteHistoryStore, SqliteTokenStore,
    };
    use crate::services::dispatcher::testing::RecordingTransport;

    use super::*;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn fires_later_today_when_the_hour_is_ahead() {
        let now = local(2024, 2, 10, 7, 59);
        assert_eq!(next_fire_at(now, 8), local(2024, 2, 10, 8, 0));
    }

    #[test]
    fn fires_tomorrow_once_the_hour_has_passed() {
        assert_eq!(
            next_fire_at(local(2024, 2, 10, 9, 30), 8),
            local(2024, 2, 11, 8, 0)
        );
        // Exactly on the hour counts as passed; the result is strictly future.
        assert_eq!(
            next_fire_at(local(2024, 2, 10, 8, 0), 8),
            local(2024, 2, 11, 8, 0)
        );
    }

    #[test]
    fn successive_fires_are_monotonic() {
        let first = next_fire_at(local(2024, 2, 10, 7, 0), 8);
        let second = next_fire_at(first, 8);
        assert!(second > first);
        assert_eq!(second, local(2024, 2, 11, 8, 0));
    }

    #[test]
    fn honors_the_configured_hour() {
        assert_eq!(
            next_fire_at(local(2024, 2, 10, 21, 0), 20),
            local(2024, 2, 11, 20, 0)
        );
        assert_eq!(
            next_fire_at(local(2024, 2, 10, 19, 0), 20),
            local(2024, 2, 10, 20, 0)
        );
    }

    async fn insert_event(pool: &SqlitePool, user_id: &str, title: &str, date: NaiveDate) {
        use chrono::Datelike;

        sqlx::query(
            r#"
            INSERT INTO events (id, user_id, title, description, year, month, day, is_lunar, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?, 0, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(title)
        .bind(date.year())
        .bind(date.month() as i32)
        .bind(date.day() as i32)
        .execute(pool)
        .await
        .unwrap();
    }

    struct CycleHarness {
        events: SqliteEventStore,
        tokens: SqliteTokenStore,
        dispatcher: Dispatcher,
        transport: Arc<RecordingTransport>,
        pool: SqlitePool,
    }

    async fn harness() -> CycleHarness {
        let pool = memory_pool().await;
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(
            transport.clone(),
            Arc::new(SqliteHistoryStore::new(pool.clone())),
            4,
        );
        CycleHarness {
            events: SqliteEventStore::new(pool.clone()),
            tokens: SqliteTokenStore::new(pool.clone()),
            dispatcher,
            transport,
            pool,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()
    }

    #[tokio::test]
    async fn cycle_dispatches_the_reminder_to_active_tokens() {
        let h = harness().await;
        insert_event(&h.pool, "user-1", "Họp nhóm", date()).await;
        h.tokens
            .save(NewDeviceToken {
                user_id: "user-1".to_string(),
                token: "token-a".to_string(),
                device_info: DeviceInfo::default(),
            })
            .await
            .unwrap();

        run_cycle(&h.events, &h.tokens, &h.dispatcher, "user-1", date())
            .await
            .unwrap();

        let calls = h.transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "token-a");
        assert_eq!(calls[0].1.title, "Sự kiện hôm nay: Họp nhóm");
    }

    #[tokio::test]
    async fn cycle_without_events_sends_nothing() {
        let h = harness().await;
        h.tokens
            .save(NewDeviceToken {
                user_id: "user-1".to_string(),
                token: "token-a".to_string(),
                device_info: DeviceInfo::default(),
            })
            .await
            .unwrap();

        run_cycle(&h.events, &h.tokens, &h.dispatcher, "user-1", date())
            .await
            .unwrap();

        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn cycle_without_tokens_sends_nothing() {
        let h = harness().await;
        insert_event(&h.pool, "user-1", "Họp nhóm", date()).await;

        run_cycle(&h.events, &h.tokens, &h.dispatcher, "user-1", date())
            .await
            .unwrap();

        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn stop_cancels_a_running_loop() {
        let h = harness().await;
        let scheduler = ReminderScheduler::new(
            Arc::new(h.events),
            Arc::new(h.tokens),
            h.dispatcher,
            8,
        );

        let handle = scheduler.start("user-1".to_string()).await;
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly after stop")
            .unwrap();
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn starting_again_replaces_the_previous_loop() {
        let h = harness().await;
        let scheduler = ReminderScheduler::new(
            Arc::new(h.events),
            Arc::new(h.tokens),
            h.dispatcher,
            8,
        );

        let first = scheduler.start("user-1".to_string()).await;
        let second = scheduler.start("user-1".to_string()).await;

        // The first loop receives the replacement signal and exits.
        tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .expect("replaced loop should exit promptly")
            .unwrap();

        scheduler.stop().await;
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second loop should exit after stop")
            .unwrap();
    }
}
