use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::i18n;
use crate::services::dispatcher::{NotificationPayload, DEFAULT_ICON, EVENT_TAG};
use crate::services::registrar::WorkerLifecycle;

const ACTION_OPEN: &str = "open";
const ACTION_DISMISS: &str = "dismiss";

/// Lifecycle of the background delivery worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    Active,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undecided,
}

/// Outcome of a permission prompt. `Dismissed` means the user closed the
/// prompt without answering; unlike `Denied` it does not persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayAction {
    pub action: String,
    pub title: String,
}

/// Options for a rendered notification, mirroring what the display
/// surface understands.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
    pub data: HashMap<String, String>,
    pub actions: Vec<DisplayAction>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to display notification: {0}")]
pub struct DisplayError(pub String);

/// Opaque reference to a rendered notification. Interaction events echo it
/// back so the worker can close what the user clicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(pub u64);

/// The session's notification surface: support and permission probes plus
/// the actual display calls.
#[async_trait]
pub trait SystemNotifier: Send + Sync + 'static {
    fn is_supported(&self) -> bool;
    fn is_secure_context(&self) -> bool;
    fn permission(&self) -> PermissionStatus;
    async fn request_permission(&self) -> PermissionDecision;
    async fn show(
        &self,
        title: &str,
        options: DisplayOptions,
    ) -> Result<NotificationHandle, DisplayError>;
    fn close(&self, handle: NotificationHandle);
}

/// Window management for notification clicks.
#[async_trait]
pub trait WindowNavigator: Send + Sync + 'static {
    /// Focus an existing application window. Returns false when none is open.
    async fn focus_existing(&self) -> bool;
    async fn open(&self, url: &str);
}

/// Events fed to the worker task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A raw push payload that arrived while no page was in the foreground.
    Push(Value),
    /// The user clicked a rendered notification. `action` is the button
    /// id, or `None` for a plain body click.
    Clicked {
        handle: NotificationHandle,
        action: Option<String>,
    },
}

pub struct DisplayContent {
    pub title: String,
    pub options: DisplayOptions,
}

fn standard_actions() -> Vec<DisplayAction> {
    vec![
        DisplayAction {
            action: ACTION_OPEN.to_string(),
            title: i18n::t("worker.action.open"),
        },
        DisplayAction {
            action: ACTION_DISMISS.to_string(),
            title: i18n::t("worker.action.dismiss"),
        },
    ]
}

/// Pull the display fields out of a raw push payload. Each field prefers
/// the notification block, then the data block, then a localized default,
/// so data-only messages still render.
pub fn extract_display_content(payload: &Value) -> DisplayContent {
    let notification = payload.get("notification");
    let data = payload.get("data");
    let pick = |field: &str| -> Option<String> {
        notification
            .and_then(|n| n.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                data.and_then(|d| d.get(field))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
    };

    let title = pick("title").unwrap_or_else(|| i18n::t("push.default_title"));
    let body = pick("body").unwrap_or_else(|| i18n::t("push.default_body"));
    let icon = pick("icon").unwrap_or_else(|| DEFAULT_ICON.to_string());
    let tag = pick("tag").unwrap_or_else(|| EVENT_TAG.to_string());

    // The data block rides along so a click can deep-link.
    let data_map: HashMap<String, String> = data
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    DisplayContent {
        title,
        options: DisplayOptions {
            body,
            icon,
            badge: DEFAULT_ICON.to_string(),
            tag,
            require_interaction: true,
            data: data_map,
            actions: standard_actions(),
        },
    }
}

/// Display adapter for payloads the session already holds in typed form.
pub fn display_content_for(payload: &NotificationPayload) -> DisplayContent {
    DisplayContent {
        title: payload.title.clone(),
        options: DisplayOptions {
            body: payload.body.clone(),
            icon: payload.icon.clone(),
            badge: DEFAULT_ICON.to_string(),
            tag: payload.tag.clone(),
            require_interaction: true,
            data: payload.data.clone(),
            actions: standard_actions(),
        },
    }
}

/// Background worker that renders pushes arriving while the application
/// is not in the foreground and reacts to notification clicks.
pub struct DeliveryWorker {
    notifier: Arc<dyn SystemNotifier>,
    navigator: Arc<dyn WindowNavigator>,
}

impl DeliveryWorker {
    pub fn new(notifier: Arc<dyn SystemNotifier>, navigator: Arc<dyn WindowNavigator>) -> Self {
        Self {
            notifier,
            navigator,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(32);
        let (state_tx, state_rx) = watch::channel(WorkerState::Installing);

        let task = tokio::spawn(async move {
            let _ = state_tx.send(WorkerState::Active);
            tracing::debug!("Delivery worker active");

            while let Some(event) = event_rx.recv().await {
                match event {
                    WorkerEvent::Push(payload) => {
                        let content = extract_display_content(&payload);
                        if let Err(e) = self.notifier.show(&content.title, content.options).await {
                            tracing::warn!("Failed to display push notification: {}", e);
                        }
                    }
                    WorkerEvent::Clicked { handle, action } => {
                        // Any interaction closes the notification; only
                        // dismiss skips the navigation.
                        self.notifier.close(handle);
                        if action.as_deref() == Some(ACTION_DISMISS) {
                            continue;
                        }
                        if !self.navigator.focus_existing().await {
                            self.navigator.open("/").await;
                        }
                    }
                }
            }

            let _ = state_tx.send(WorkerState::Stopped);
            tracing::debug!("Delivery worker stopped");
        });

        WorkerHandle {
            events: event_tx,
            state: state_rx,
            task,
        }
    }
}

/// Handle to a spawned worker: event injection, state inspection, shutdown.
pub struct WorkerHandle {
    events: mpsc::Sender<WorkerEvent>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn events(&self) -> mpsc::Sender<WorkerEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Close the event channel and wait for queued events to drain.
    pub async fn shutdown(self) {
        drop(self.events);
        let _ = self.task.await;
    }
}

#[async_trait]
impl WorkerLifecycle for WorkerHandle {
    async fn install(&self) -> Result<(), String> {
        // Spawning already installed the worker; repeat calls are no-ops.
        Ok(())
    }

    async fn await_active(&self, timeout: std::time::Duration) -> bool {
        let mut state = self.state.clone();
        if *state.borrow() == WorkerState::Active {
            return true;
        }
        let became_active = async {
            while state.changed().await.is_ok() {
                if *state.borrow() == WorkerState::Active {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(timeout, became_active)
            .await
            .unwrap_or(false)
    }

    fn is_active(&self) -> bool {
        *self.state.borrow() == WorkerState::Active
    }
}
