//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` work everywhere.

pub mod device_token;
pub mod event;
pub mod notification_history;

// Re-export all types at the `crate::db::models` namespace.
pub use self::device_token::*;
pub use self::event::*;
pub use self::notification_history::*;
