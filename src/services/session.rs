use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::services::channels::{
    select_channel, ChannelCapabilities, DeliveryChannel, DeliveryIntent,
};
use crate::services::dispatcher::{DispatchError, DispatchResult, Dispatcher, NotificationPayload};
use crate::services::registrar::{PushPlatform, TokenRegistrar, WorkerLifecycle};
use crate::services::reminders;
use crate::services::scheduler::ReminderScheduler;
use crate::services::worker::{self, PermissionStatus, SystemNotifier};

/// Authentication transitions the coordinator reacts to.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    SignedIn { user_id: String },
    SignedOut,
}

/// Source of the signed-in user and its change stream.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Ties a device session together: watches sign-in state, drives the
/// registrar and the daily reminder loop, and routes outgoing
/// notifications through whichever channel is actually available.
pub struct SessionCoordinator {
    identity: Arc<dyn IdentityProvider>,
    registrar: Arc<TokenRegistrar>,
    scheduler: Arc<ReminderScheduler>,
    platform: Arc<dyn PushPlatform>,
    notifier: Arc<dyn SystemNotifier>,
    worker: Arc<dyn WorkerLifecycle>,
    dispatcher: Dispatcher,
    relay_configured: bool,
    active_user: Mutex<Option<String>>,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        registrar: Arc<TokenRegistrar>,
        scheduler: Arc<ReminderScheduler>,
        platform: Arc<dyn PushPlatform>,
        notifier: Arc<dyn SystemNotifier>,
        worker: Arc<dyn WorkerLifecycle>,
        dispatcher: Dispatcher,
        relay_configured: bool,
    ) -> Self {
        Self {
            identity,
            registrar,
            scheduler,
            platform,
            notifier,
            worker,
            dispatcher,
            relay_configured,
            active_user: Mutex::new(None),
        }
    }

    /// Snapshot of what this session can currently do.
    pub fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            notifications_supported: self.notifier.is_supported(),
            permission_granted: self.notifier.permission() == PermissionStatus::Granted,
            worker_active: self.worker.is_active(),
            relay_reachable: self.relay_configured,
        }
    }

    /// Register the device for `user_id` and start their daily reminder
    /// loop. The loop only runs once registration succeeded; a user who
    /// refused the permission prompt gets no timer firing at them.
    pub async fn handle_sign_in(&self, user_id: &str) {
        match self.registrar.register(user_id).await {
            Ok(registration) => {
                tracing::info!(
                    "Push registration ready for user {} ({})",
                    user_id,
                    if registration.durable {
                        "persisted"
                    } else {
                        "cached locally"
                    }
                );
                *self.active_user.lock().await = Some(user_id.to_string());
                let _ = self.scheduler.start(user_id.to_string()).await;
            }
            Err(e) => {
                tracing::warn!(
                    "Push registration for user {} failed: {}",
                    user_id,
                    e.localized_reason()
                );
            }
        }
    }

    /// Stop the reminder loop and release the push registration.
    pub async fn handle_sign_out(&self) {
        self.scheduler.stop().await;
        if let Some(user_id) = self.active_user.lock().await.take() {
            self.registrar.unregister(&user_id).await;
            tracing::info!("Signed out user {}; push registration released", user_id);
        }
    }

    /// Render a push payload that arrived while a page was in the
    /// foreground. Without granted permission the payload is dropped.
    pub async fn display_foreground(&self, payload: &Value) {
        if self.notifier.permission() != PermissionStatus::Granted {
            tracing::debug!("Dropping foreground push: notification permission not granted");
            return;
        }
        let content = worker::extract_display_content(payload);
        if let Err(e) = self.notifier.show(&content.title, content.options).await {
            tracing::warn!("Foreground notification display failed: {}", e);
        }
    }

    /// Fan `payload` out to other devices. Remote deliveries only ever go
    /// through the relay; rendering them on this session's own screen
    /// would reach nobody.
    pub async fn send_remote(
        &self,
        tokens: &[String],
        payload: &NotificationPayload,
    ) -> Result<DispatchResult, DispatchError> {
        match select_channel(self.capabilities(), DeliveryIntent::RemoteTokens) {
            Ok(DeliveryChannel::Relay) => self.dispatcher.send(None, tokens, payload).await,
            _ => Err(DispatchError::ChannelUnavailable),
        }
    }

    /// Show the canned test notification on this device, preferring a
    /// real round trip through the relay so the user verifies the same
    /// path their reminders take. Returns whether anything was shown.
    pub async fn show_test_notification(&self) -> bool {
        let payload = reminders::test_notification();
        match select_channel(self.capabilities(), DeliveryIntent::OwnSession) {
            Ok(DeliveryChannel::Relay) => {
                if let Some(registration) = self.registrar.registration().await {
                    let tokens = vec![registration.token];
                    match self.dispatcher.send(None, &tokens, &payload).await {
                        Ok(result) if result.errors.is_empty() => return true,
                        Ok(result) => {
                            tracing::warn!(
                                "Test notification relay rejected {} token(s); showing directly",
                                result.errors.len()
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Test notification relay failed: {}; showing directly",
                                e
                            );
                        }
                    }
                }
                self.display_now(&payload).await
            }
            Ok(DeliveryChannel::ForegroundDisplay) => self.display_now(&payload).await,
            Err(e) => {
                tracing::warn!("Cannot show test notification: {}", e);
                false
            }
        }
    }

    async fn display_now(&self, payload: &NotificationPayload) -> bool {
        let content = worker::display_content_for(payload);
        match self.notifier.show(&content.title, content.options).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Notification display failed: {}", e);
                false
            }
        }
    }

    /// Start the listener tasks. The auth listener applies the current
    /// sign-in state first so a session that starts already signed in
    /// registers immediately.
    pub fn spawn(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let coordinator = Arc::clone(self);
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut auth_rx = coordinator.identity.subscribe();
                if let Some(user_id) = coordinator.identity.current_user_id() {
                    coordinator.handle_sign_in(&user_id).await;
                }
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        event = auth_rx.recv() => match event {
                            Ok(AuthEvent::SignedIn { user_id }) => {
                                coordinator.handle_sign_in(&user_id).await;
                            }
                            Ok(AuthEvent::SignedOut) => {
                                coordinator.handle_sign_out().await;
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!("Auth listener lagged; dropped {} event(s)", missed);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                tracing::info!("Auth listener stopped");
            }));
        }

        {
            let coordinator = Arc::clone(self);
            let mut shutdown_rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut messages = coordinator.platform.subscribe_messages();
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        message = messages.recv() => match message {
                            Ok(payload) => coordinator.display_foreground(&payload).await,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                tracing::warn!(
                                    "Foreground listener lagged; dropped {} message(s)",
                                    missed
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                tracing::info!("Foreground listener stopped");
            }));
        }

        handles
    }
}
