use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::db::{DeviceInfo, NewDeviceToken, StoreError, TokenStore};
use crate::i18n;
use crate::services::dispatcher::token_ref;
use crate::services::worker::{PermissionDecision, PermissionStatus, SystemNotifier};

/// Where a device session stands in the registration flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    PermissionRequested,
    Granted,
    WorkerInstalling,
    WorkerActive,
    TokenAcquired,
    Persisted,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("notifications are not supported in this environment")]
    Unsupported,
    #[error("push registration requires a secure context")]
    InsecureContext,
    #[error("notification permission was denied")]
    PermissionDenied,
    #[error("notification permission request was dismissed")]
    PermissionDismissed,
    #[error("delivery worker installation failed: {0}")]
    WorkerInstall(String),
    #[error("delivery worker did not activate in time")]
    WorkerActivationTimeout,
    #[error("push credential was rejected by the platform")]
    InvalidCredential,
    #[error("token acquisition failed: {0}")]
    TokenAcquisition(String),
    #[error("token store error: {0}")]
    Store(#[from] StoreError),
}

impl RegisterError {
    /// Reason string in the user's language, suitable for direct display.
    pub fn localized_reason(&self) -> String {
        match self {
            RegisterError::Unsupported => i18n::t("permission.unsupported"),
            RegisterError::InsecureContext => i18n::t("permission.insecure_context"),
            RegisterError::PermissionDenied => i18n::t("permission.denied"),
            RegisterError::PermissionDismissed => i18n::t("permission.dismissed"),
            RegisterError::WorkerInstall(err) => {
                i18n::t_with("register.worker_install_failed", &[("err", err)])
            }
            RegisterError::WorkerActivationTimeout => {
                i18n::t("register.worker_activation_timeout")
            }
            RegisterError::InvalidCredential => i18n::t("register.invalid_credential"),
            RegisterError::TokenAcquisition(err) => {
                i18n::t_with("register.token_failed", &[("err", err)])
            }
            RegisterError::Store(err) => {
                i18n::t_with("register.store_failed", &[("err", &err.to_string())])
            }
        }
    }
}

/// Push platform as seen from a device session.
#[async_trait]
pub trait PushPlatform: Send + Sync + 'static {
    /// Acquire this device's push token. `credential` is the public key
    /// deliveries are signed against.
    async fn request_token(&self, credential: &str) -> Result<String, RegisterError>;

    /// Push payloads that arrive while the application is in the foreground.
    fn subscribe_messages(&self) -> broadcast::Receiver<serde_json::Value>;
}

/// The slice of the background worker the registrar depends on.
#[async_trait]
pub trait WorkerLifecycle: Send + Sync + 'static {
    /// Idempotent install trigger.
    async fn install(&self) -> Result<(), String>;
    /// Wait until the worker reports active, up to `timeout`.
    async fn await_active(&self, timeout: Duration) -> bool;
    fn is_active(&self) -> bool;
}

/// Outcome of a successful registration. `durable` is false when the
/// token only reached the local fallback cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub token: String,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRegistration {
    pub token: String,
    pub device_info: DeviceInfo,
    pub cached_at: NaiveDateTime,
}

/// JSON file holding registrations that could not reach the store, keyed
/// by user id. Survives restarts so a later session can retry the save.
pub struct FallbackCache {
    path: PathBuf,
}

impl FallbackCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> HashMap<String, Vec<CachedRegistration>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn write_all(&self, entries: &HashMap<String, Vec<CachedRegistration>>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&self.path, raw)
    }

    /// Queue a registration for a later store retry. Replaces any queued
    /// entry with the same token.
    pub fn store(&self, user_id: &str, entry: CachedRegistration) -> std::io::Result<()> {
        let mut all = self.read_all();
        let entries = all.entry(user_id.to_string()).or_default();
        entries.retain(|e| e.token != entry.token);
        entries.push(entry);
        self.write_all(&all)
    }

    pub fn pending_for(&self, user_id: &str) -> Vec<CachedRegistration> {
        self.read_all().remove(user_id).unwrap_or_default()
    }

    pub fn clear(&self, user_id: &str) -> std::io::Result<()> {
        let mut all = self.read_all();
        if all.remove(user_id).is_some() {
            return self.write_all(&all);
        }
        Ok(())
    }
}

/// Everything about the registrar that is plain data.
#[derive(Debug, Clone)]
pub struct RegistrarOptions {
    /// Public key handed to the push platform when requesting a token.
    pub credential: String,
    pub device_info: DeviceInfo,
    pub activation_timeout: Duration,
}

struct RegistrarInner {
    state: RegistrationState,
    registration: Option<Registration>,
}

/// Drives a device session through the registration flow: permission,
/// worker activation, token acquisition, persistence.
pub struct TokenRegistrar {
    notifier: Arc<dyn SystemNotifier>,
    worker: Arc<dyn WorkerLifecycle>,
    platform: Arc<dyn PushPlatform>,
    tokens: Arc<dyn TokenStore>,
    fallback: FallbackCache,
    options: RegistrarOptions,
    inner: Mutex<RegistrarInner>,
}

impl TokenRegistrar {
    pub fn new(
        notifier: Arc<dyn SystemNotifier>,
        worker: Arc<dyn WorkerLifecycle>,
        platform: Arc<dyn PushPlatform>,
        tokens: Arc<dyn TokenStore>,
        fallback: FallbackCache,
        options: RegistrarOptions,
    ) -> Self {
        Self {
            notifier,
            worker,
            platform,
            tokens,
            fallback,
            options,
            inner: Mutex::new(RegistrarInner {
                state: RegistrationState::Unregistered,
                registration: None,
            }),
        }
    }

    pub async fn state(&self) -> RegistrationState {
        self.inner.lock().await.state
    }

    pub async fn registration(&self) -> Option<Registration> {
        self.inner.lock().await.registration.clone()
    }

    /// Run the registration flow for `user_id`.
    ///
    /// Re-entering with an unchanged platform token returns the held
    /// registration without touching the store. A changed token retires
    /// the previous one first, so a rotation never leaves two active rows
    /// for this device.
    pub async fn register(&self, user_id: &str) -> Result<Registration, RegisterError> {
        if !self.notifier.is_supported() {
            return Err(RegisterError::Unsupported);
        }
        if !self.notifier.is_secure_context() {
            return Err(RegisterError::InsecureContext);
        }

        let mut inner = self.inner.lock().await;

        inner.state = RegistrationState::PermissionRequested;
        let decision = match self.notifier.permission() {
            PermissionStatus::Granted => PermissionDecision::Granted,
            PermissionStatus::Denied => PermissionDecision::Denied,
            PermissionStatus::Undecided => self.notifier.request_permission().await,
        };
        match decision {
            PermissionDecision::Granted => {
                inner.state = RegistrationState::Granted;
            }
            PermissionDecision::Denied => {
                inner.state = RegistrationState::Unregistered;
                return Err(RegisterError::PermissionDenied);
            }
            PermissionDecision::Dismissed => {
                inner.state = RegistrationState::Unregistered;
                return Err(RegisterError::PermissionDismissed);
            }
        }

        inner.state = RegistrationState::WorkerInstalling;
        if let Err(e) = self.worker.install().await {
            inner.state = RegistrationState::Unregistered;
            return Err(RegisterError::WorkerInstall(e));
        }
        if !self.worker.await_active(self.options.activation_timeout).await {
            inner.state = RegistrationState::Unregistered;
            return Err(RegisterError::WorkerActivationTimeout);
        }
        inner.state = RegistrationState::WorkerActive;

        let token = self.platform.request_token(&self.options.credential).await?;
        inner.state = RegistrationState::TokenAcquired;

        if let Some(held) = inner.registration.clone() {
            if held.token == token && held.durable {
                inner.state = RegistrationState::Persisted;
                tracing::debug!(
                    "Registration for user {} already persisted under {}",
                    user_id,
                    token_ref(&token)
                );
                return Ok(held);
            }
            if held.token != token {
                // The platform rotated the token; retire the predecessor.
                if let Err(e) = self.tokens.deactivate_by_token(&held.token).await {
                    tracing::warn!(
                        "Failed to retire rotated token {}: {}",
                        token_ref(&held.token),
                        e
                    );
                }
            }
        }

        let record = NewDeviceToken {
            user_id: user_id.to_string(),
            token: token.clone(),
            device_info: self.options.device_info.clone(),
        };
        let registration = match self.tokens.save(record).await {
            Ok(_) => {
                if let Err(e) = self.fallback.clear(user_id) {
                    tracing::warn!("Failed to prune token fallback cache: {}", e);
                }
                Registration {
                    token: token.clone(),
                    durable: true,
                }
            }
            Err(StoreError::Unavailable(reason)) => {
                tracing::warn!(
                    "Token store unavailable ({}); caching registration locally",
                    reason
                );
                let cached = CachedRegistration {
                    token: token.clone(),
                    device_info: self.options.device_info.clone(),
                    cached_at: Utc::now().naive_utc(),
                };
                if let Err(e) = self.fallback.store(user_id, cached) {
                    tracing::error!("Failed to write token fallback cache: {}", e);
                }
                Registration {
                    token: token.clone(),
                    durable: false,
                }
            }
            Err(e) => {
                return Err(RegisterError::Store(e));
            }
        };

        inner.state = RegistrationState::Persisted;
        inner.registration = Some(registration.clone());
        tracing::info!(
            "Registered push token {} for user {} (durable={})",
            token_ref(&registration.token),
            user_id,
            registration.durable
        );
        Ok(registration)
    }

    /// Retire the user's active tokens and forget the held registration.
    /// Store failures are logged, not raised; signing out must always
    /// succeed locally.
    pub async fn unregister(&self, user_id: &str) {
        let mut inner = self.inner.lock().await;
        match self.tokens.deactivate_by_user(user_id).await {
            Ok(count) => {
                tracing::info!("Retired {} active token(s) for user {}", count, user_id);
            }
            Err(e) => {
                tracing::warn!("Failed to retire tokens for user {}: {}", user_id, e);
            }
        }
        if let Err(e) = self.fallback.clear(user_id) {
            tracing::warn!(
                "Failed to clear token fallback cache for user {}: {}",
                user_id,
                e
            );
        }
        inner.registration = None;
        inner.state = RegistrationState::Unregistered;
    }
}
