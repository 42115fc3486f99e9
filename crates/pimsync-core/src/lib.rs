//! pimsync-core - Change recording and replay for PIM storage agents
//!
//! This crate contains the notification models, the versioned journal codec
//! and store, the live monitor pipeline and the [`ChangeRecorder`] that
//! replays recorded changes to an agent one at a time.

pub mod cache;
pub mod config;
pub mod error;
pub mod journal;
pub mod models;
pub mod monitor;
pub mod recorder;

pub use config::{MonitorOptions, SettingsStore};
pub use error::{DecodeError, Error, Result};
pub use journal::{FormatVersion, JournalStore};
pub use models::{Notification, NotificationKind};
pub use monitor::{Interest, Monitor, MonitorFilter, RecorderEvent};
pub use recorder::{spawn_recorder, ChangeRecorder, RecorderHandle, ReplayState};
