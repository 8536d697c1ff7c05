//! Push notification delivery for a Vietnamese lunar calendar app.
//!
//! The crate has two halves. The relay server (`main.rs`) authenticates
//! against the push platform and fans notifications out to registered
//! device tokens. The device-session services (`services::registrar`,
//! `services::worker`, `services::session`) drive the other end: the
//! permission flow, token registration, and rendering of deliveries.

pub mod config;
pub mod db;
pub mod error;
pub mod i18n;
pub mod routes;
pub mod services;

use std::sync::Arc;

use crate::config::Config;
use crate::db::{EventStore, HistoryStore, TokenStore};
use crate::services::dispatcher::Dispatcher;

/// Shared state handed to every request handler.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub tokens: Arc<dyn TokenStore>,
    pub events: Arc<dyn EventStore>,
    pub history: Arc<dyn HistoryStore>,
    pub dispatcher: Dispatcher,
}
