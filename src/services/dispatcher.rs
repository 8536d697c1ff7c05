use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::db::{HistoryStatus, HistoryStore, NewHistoryEntry, TokenStore};
use crate::error::AppError;

/// Icon used when a payload does not carry one.
pub const DEFAULT_ICON: &str = "/favicon.ico";

/// Coalescing tag shared by event notifications. Payloads about a single
/// event append the event id so they do not replace each other.
pub const EVENT_TAG: &str = "lunar-calendar-event";

/// How many characters of a device token are kept when it is written to
/// logs or history. Tokens are credentials; the full value never leaves
/// the store.
const TOKEN_REF_VISIBLE_CHARS: usize = 20;

/// Shorten a device token for logs, history rows and API error payloads.
pub fn token_ref(token: &str) -> String {
    if token.chars().count() <= TOKEN_REF_VISIBLE_CHARS {
        return token.to_string();
    }
    let prefix: String = token.chars().take(TOKEN_REF_VISIBLE_CHARS).collect();
    format!("{}...", prefix)
}

/// A notification ready for delivery: display fields plus an opaque
/// string map the client uses for deep links.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub tag: String,
    pub data: HashMap<String, String>,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            icon: DEFAULT_ICON.to_string(),
            tag: EVENT_TAG.to_string(),
            data: HashMap::new(),
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_data(mut self, data: HashMap<String, String>) -> Self {
        self.data = data;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.title.trim().is_empty() {
            return Err(DispatchError::InvalidPayload(
                "notification title must not be empty".to_string(),
            ));
        }
        if self.body.trim().is_empty() {
            return Err(DispatchError::InvalidPayload(
                "notification body must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a single delivery attempt failed, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("device token was rejected as invalid")]
    InvalidToken,
    #[error("device token is no longer registered")]
    NotRegistered,
    #[error("push platform quota exceeded")]
    QuotaExceeded,
    #[error("network error: {0}")]
    Network(String),
    #[error("no delivery channel available")]
    ChannelUnavailable,
}

impl DeliveryError {
    /// Only network-class failures are worth retrying; the other variants
    /// describe the token or the request itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Network(_))
    }
}

/// Transport that can push one payload to one device token.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Returns the platform message id on success.
    async fn deliver(
        &self,
        token: &str,
        payload: &NotificationPayload,
    ) -> Result<String, DeliveryError>;
}

/// A failed target within a fan-out, keyed by its shortened token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub token_ref: String,
    pub reason: String,
}

/// Aggregate outcome of a fan-out. `success_count + errors.len()` always
/// equals `total_count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchResult {
    pub success_count: usize,
    pub total_count: usize,
    pub errors: Vec<DispatchFailure>,
}

impl DispatchResult {
    pub fn merge(&mut self, other: DispatchResult) {
        self.success_count += other.success_count;
        self.total_count += other.total_count;
        self.errors.extend(other.errors);
    }
}

/// Errors that abort a dispatch before any token is attempted.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid notification payload: {0}")]
    InvalidPayload(String),
    #[error("no delivery channel available for remote notifications")]
    ChannelUnavailable,
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidPayload(msg) => AppError::Validation(msg),
            DispatchError::ChannelUnavailable => {
                AppError::ServiceUnavailable("No delivery channel available".to_string())
            }
            DispatchError::Delivery(e) => match e {
                DeliveryError::InvalidToken | DeliveryError::NotRegistered => {
                    AppError::BadRequest("Invalid device token".to_string())
                }
                DeliveryError::QuotaExceeded => {
                    AppError::ServiceUnavailable("Push platform quota exceeded".to_string())
                }
                DeliveryError::Network(msg) => AppError::ServiceUnavailable(msg),
                DeliveryError::ChannelUnavailable => {
                    AppError::ServiceUnavailable("No delivery channel available".to_string())
                }
            },
        }
    }
}

/// Fans payloads out to device tokens through a [`PushTransport`] and
/// records every attempt in the notification history.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn PushTransport>,
    history: Arc<dyn HistoryStore>,
    tokens: Option<Arc<dyn TokenStore>>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        history: Arc<dyn HistoryStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            transport,
            history,
            tokens: None,
            concurrency: concurrency.max(1),
        }
    }

    /// Retire tokens the platform reports as no longer registered, so
    /// dead devices stop receiving fan-out attempts.
    pub fn with_token_retirement(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Deliver `payload` to a single token and return the platform
    /// message id.
    pub async fn send_one(
        &self,
        user_id: Option<&str>,
        token: &str,
        payload: &NotificationPayload,
    ) -> Result<String, DispatchError> {
        payload.validate()?;

        match self.transport.deliver(token, payload).await {
            Ok(message_id) => {
                tracing::debug!(
                    "Delivered notification to {}: {}",
                    token_ref(token),
                    message_id
                );
                self.record(user_id, token, payload, None).await;
                Ok(message_id)
            }
            Err(e) => {
                tracing::warn!("Delivery to {} failed: {}", token_ref(token), e);
                self.record(user_id, token, payload, Some(e.to_string())).await;
                self.retire_if_gone(token, &e).await;
                Err(e.into())
            }
        }
    }

    /// Deliver `payload` to every token, bounded by the configured
    /// concurrency. Per-token failures land in the result rather than
    /// aborting the batch, and `errors` preserves the submission order
    /// of the failed tokens.
    pub async fn send(
        &self,
        user_id: Option<&str>,
        tokens: &[String],
        payload: &NotificationPayload,
    ) -> Result<DispatchResult, DispatchError> {
        payload.validate()?;

        if tokens.is_empty() {
            return Ok(DispatchResult::default());
        }

        // Building the futures eagerly sidesteps a rustc limitation with
        // higher-ranked lifetimes in lazily-mapped streams
        // (rust-lang/rust#102211); they stay inert until polled, so
        // `buffer_unordered` still bounds the actual delivery concurrency.
        let deliveries: Vec<_> = tokens
            .iter()
            .enumerate()
            .map(|(idx, token)| {
                let transport = Arc::clone(&self.transport);
                async move { (idx, transport.deliver(token, payload).await) }
            })
            .collect();
        let mut outcomes: Vec<(usize, Result<String, DeliveryError>)> =
            stream::iter(deliveries)
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        outcomes.sort_by_key(|(idx, _)| *idx);

        let mut result = DispatchResult {
            success_count: 0,
            total_count: tokens.len(),
            errors: Vec::new(),
        };

        for (idx, outcome) in outcomes {
            let token = &tokens[idx];
            match outcome {
                Ok(message_id) => {
                    result.success_count += 1;
                    tracing::debug!(
                        "Delivered notification to {}: {}",
                        token_ref(token),
                        message_id
                    );
                    self.record(user_id, token, payload, None).await;
                }
                Err(e) => {
                    tracing::warn!("Delivery to {} failed: {}", token_ref(token), e);
                    result.errors.push(DispatchFailure {
                        token_ref: token_ref(token),
                        reason: e.to_string(),
                    });
                    self.record(user_id, token, payload, Some(e.to_string())).await;
                    self.retire_if_gone(token, &e).await;
                }
            }
        }

        tracing::info!(
            "Dispatch complete: {}/{} deliveries succeeded",
            result.success_count,
            result.total_count
        );
        Ok(result)
    }

    async fn retire_if_gone(&self, token: &str, error: &DeliveryError) {
        if *error != DeliveryError::NotRegistered {
            return;
        }
        let Some(tokens) = &self.tokens else { return };
        match tokens.deactivate_by_token(token).await {
            Ok(count) if count > 0 => {
                tracing::info!("Retired unregistered token {}", token_ref(token));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    "Failed to retire unregistered token {}: {}",
                    token_ref(token),
                    e
                );
            }
        }
    }

    /// History is operator visibility; a failed write must not fail the
    /// dispatch it describes.
    async fn record(
        &self,
        user_id: Option<&str>,
        token: &str,
        payload: &NotificationPayload,
        error: Option<String>,
    ) {
        let status = if error.is_none() {
            HistoryStatus::Sent
        } else {
            HistoryStatus::Failed
        };
        let entry = NewHistoryEntry {
            user_id: user_id.map(|s| s.to_string()),
            token_ref: token_ref(token),
            title: payload.title.clone(),
            body: payload.body.clone(),
            status,
            error_message: error,
        };
        if let Err(e) = self.history.record(entry).await {
            tracing::warn!("Failed to record notification history: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::Utc;
    use uuid::Uuid;

    use crate::db::{
        HistoryStatus, HistoryStore, NewHistoryEntry, NotificationHistoryEntry, StoreError,
        StoreResult,
    };

    use super::*;

    /// Transport double that records every delivery and fails the tokens
    /// it was told to fail.
    pub(crate) struct RecordingTransport {
        fail_tokens: HashSet<String>,
        fail_with: DeliveryError,
        calls: Mutex<Vec<(String, NotificationPayload)>>,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Self {
            Self {
                fail_tokens: HashSet::new(),
                fail_with: DeliveryError::InvalidToken,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(tokens: &[&str], error: DeliveryError) -> Self {
            Self {
                fail_tokens: tokens.iter().map(|t| t.to_string()).collect(),
                fail_with: error,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<(String, NotificationPayload)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn deliver(
            &self,
            token: &str,
            payload: &NotificationPayload,
        ) -> Result<String, DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((token.to_string(), payload.clone()));
            if self.fail_tokens.contains(token) {
                return Err(self.fail_with.clone());
            }
            Ok(format!("projects/test/messages/{}", Uuid::new_v4()))
        }
    }

    /// History double for tests that do not care about history contents.
    pub(crate) struct NullHistory;

    #[async_trait]
    impl HistoryStore for NullHistory {
        async fn record(&self, entry: NewHistoryEntry) -> StoreResult<NotificationHistoryEntry> {
            Ok(NotificationHistoryEntry {
                id: Uuid::new_v4().to_string(),
                user_id: entry.user_id,
                token_ref: entry.token_ref,
                title: entry.title,
                body: entry.body,
                status: entry.status.as_str().to_string(),
                error_message: entry.error_message,
                created_at: Utc::now().naive_utc(),
            })
        }

        async fn list(
            &self,
            _user_id: Option<&str>,
            _status: Option<&str>,
            _limit: i64,
            _offset: i64,
        ) -> StoreResult<Vec<NotificationHistoryEntry>> {
            Ok(Vec::new())
        }

        async fn count(&self, _user_id: Option<&str>, _status: Option<&str>) -> StoreResult<i64> {
            Ok(0)
        }

        async fn count_by_status(&self, _status: HistoryStatus) -> StoreResult<i64> {
            Ok(0)
        }
    }

    /// History double whose writes always fail.
    pub(crate) struct UnavailableHistory;

    #[async_trait]
    impl HistoryStore for UnavailableHistory {
        async fn record(&self, _entry: NewHistoryEntry) -> StoreResult<NotificationHistoryEntry> {
            Err(StoreError::Unavailable("history store offline".to_string()))
        }

        async fn list(
            &self,
            _user_id: Option<&str>,
            _status: Option<&str>,
            _limit: i64,
            _offset: i64,
        ) -> StoreResult<Vec<NotificationHistoryEntry>> {
            Err(StoreError::Unavailable("history store offline".to_string()))
        }

        async fn count(&self, _user_id: Option<&str>, _status: Option<&str>) -> StoreResult<i64> {
            Err(StoreError::Unavailable("history store offline".to_string()))
        }

        async fn count_by_status(&self, _status: HistoryStatus) -> StoreResult<i64> {
            Err(StoreError::Unavailable("history store offline".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::db::repository::testing::memory_pool;
    use crate::db::{HistoryStatus, SqliteHistoryStore};

    use super::testing::{RecordingTransport, UnavailableHistory};
    use super::*;

    fn payload() -> NotificationPayload {
        NotificationPayload::new("Sự kiện hôm nay: Họp nhóm", "Họp với đội lúc 14:00")
    }

    #[test]
    fn token_ref_truncates_long_tokens() {
        let token = "fcm-token-abcdefghijklmnopqrstuvwxyz-0123456789";
        let shortened = token_ref(token);
        assert_eq!(shortened, "fcm-token-abcdefghij...");
        assert_ne!(shortened, token);
    }

    #[test]
    fn token_ref_keeps_short_tokens_intact() {
        assert_eq!(token_ref("short-token"), "short-token");
    }

    #[test]
    fn transient_classification_only_covers_network_errors() {
        assert!(DeliveryError::Network("connection reset".to_string()).is_transient());
        assert!(!DeliveryError::InvalidToken.is_transient());
        assert!(!DeliveryError::NotRegistered.is_transient());
        assert!(!DeliveryError::QuotaExceeded.is_transient());
    }

    #[test]
    fn payload_validation_rejects_blank_fields() {
        let blank_title = NotificationPayload::new("  ", "body");
        assert!(matches!(
            blank_title.validate(),
            Err(DispatchError::InvalidPayload(_))
        ));

        let blank_body = NotificationPayload::new("title", "");
        assert!(matches!(
            blank_body.validate(),
            Err(DispatchError::InvalidPayload(_))
        ));

        assert!(payload().validate().is_ok());
    }

    #[tokio::test]
    async fn fan_out_counts_successes_and_failures() {
        let pool = memory_pool().await;
        let history = Arc::new(SqliteHistoryStore::new(pool));
        let transport = Arc::new(RecordingTransport::failing(
            &["bad-token-2", "bad-token-4"],
            DeliveryError::InvalidToken,
        ));
        let dispatcher = Dispatcher::new(transport.clone(), history.clone(), 8);

        let tokens: Vec<String> = vec![
            "good-token-1".to_string(),
            "bad-token-2".to_string(),
            "good-token-3".to_string(),
            "bad-token-4".to_string(),
            "good-token-5".to_string(),
        ];

        let result = dispatcher
            .send(Some("user-1"), &tokens, &payload())
            .await
            .unwrap();

        assert_eq!(result.success_count, 3);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.success_count + result.errors.len(), result.total_count);

        // Failures keep submission order.
        assert_eq!(result.errors[0].token_ref, "bad-token-2");
        assert_eq!(result.errors[1].token_ref, "bad-token-4");

        // Every target was attempted exactly once.
        assert_eq!(transport.calls().len(), 5);

        // Every attempt landed in history with the right status.
        let sent = history.count_by_status(HistoryStatus::Sent).await.unwrap();
        let failed = history.count_by_status(HistoryStatus::Failed).await.unwrap();
        assert_eq!(sent, 3);
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn failure_reasons_use_shortened_tokens() {
        let pool = memory_pool().await;
        let history = Arc::new(SqliteHistoryStore::new(pool));
        let long_token = "very-long-device-token-that-must-not-leak-into-errors".to_string();
        let transport = Arc::new(RecordingTransport::failing(
            &[long_token.as_str()],
            DeliveryError::NotRegistered,
        ));
        let dispatcher = Dispatcher::new(transport, history.clone(), 4);

        let result = dispatcher
            .send(None, &[long_token.clone()], &payload())
            .await
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].token_ref.ends_with("..."));
        assert!(!result.errors[0].token_ref.contains(&long_token));
        assert_eq!(result.errors[0].reason, "device token is no longer registered");

        let rows = history.list(None, None, 10, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].token_ref.contains(&long_token));
    }

    #[tokio::test]
    async fn empty_token_list_is_a_no_op() {
        let pool = memory_pool().await;
        let history = Arc::new(SqliteHistoryStore::new(pool));
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), history, 4);

        let result = dispatcher.send(None, &[], &payload()).await.unwrap();

        assert_eq!(result, DispatchResult::default());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_aborts_before_any_delivery() {
        let pool = memory_pool().await;
        let history = Arc::new(SqliteHistoryStore::new(pool));
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), history, 4);

        let blank = NotificationPayload::new("", "body");
        let result = dispatcher
            .send(None, &["token-1".to_string()], &blank)
            .await;

        assert!(matches!(result, Err(DispatchError::InvalidPayload(_))));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn history_write_failures_do_not_fail_the_dispatch() {
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(transport, Arc::new(UnavailableHistory), 4);

        let result = dispatcher
            .send(Some("user-1"), &["token-1".to_string()], &payload())
            .await
            .unwrap();

        assert_eq!(result.success_count, 1);
        assert_eq!(result.total_count, 1);
    }

    #[tokio::test]
    async fn unregistered_tokens_are_retired_from_the_store() {
        use crate::db::{DeviceInfo, NewDeviceToken, SqliteTokenStore};

        let pool = memory_pool().await;
        let token_store = Arc::new(SqliteTokenStore::new(pool.clone()));
        token_store
            .save(NewDeviceToken {
                user_id: "user-1".to_string(),
                token: "stale-token".to_string(),
                device_info: DeviceInfo::default(),
            })
            .await
            .unwrap();

        let history = Arc::new(SqliteHistoryStore::new(pool));
        let transport = Arc::new(RecordingTransport::failing(
            &["stale-token"],
            DeliveryError::NotRegistered,
        ));
        let dispatcher = Dispatcher::new(transport, history, 4)
            .with_token_retirement(token_store.clone());

        let result = dispatcher
            .send(Some("user-1"), &["stale-token".to_string()], &payload())
            .await
            .unwrap();

        assert_eq!(result.errors.len(), 1);
        assert!(token_store
            .find_active_by_user("user-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn send_one_returns_the_platform_message_id() {
        let pool = memory_pool().await;
        let history = Arc::new(SqliteHistoryStore::new(pool));
        let transport = Arc::new(RecordingTransport::new());
        let dispatcher = Dispatcher::new(transport, history.clone(), 4);

        let message_id = dispatcher
            .send_one(Some("user-1"), "token-1", &payload())
            .await
            .unwrap();

        assert!(message_id.starts_with("projects/test/messages/"));
        let sent = history.count_by_status(HistoryStatus::Sent).await.unwrap();
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn send_one_maps_rejected_tokens_to_a_delivery_error() {
        let pool = memory_pool().await;
        let history = Arc::new(SqliteHistoryStore::new(pool));
        let transport = Arc::new(RecordingTransport::failing(
            &["token-1"],
            DeliveryError::InvalidToken,
        ));
        let dispatcher = Dispatcher::new(transport, history.clone(), 4);

        let result = dispatcher.send_one(None, "token-1", &payload()).await;

        assert!(matches!(
            result,
            Err(DispatchError::Delivery(DeliveryError::InvalidToken))
        ));
        let failed = history.count_by_status(HistoryStatus::Failed).await.unwrap();
        assert_eq!(failed, 1);
    }
}
