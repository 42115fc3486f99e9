//! Persistent settings for a recorder instance.
//!
//! A settings file is a flat JSON object. Its path is the identity of the
//! recorder: the journal lives next to it as `<settings-file>_changes.dat`.
//! Older agents kept pending changes inside the settings file itself under the
//! [`LEGACY_CHANGES_KEY`] key; those are imported once and then removed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cache::FetchScope;
use crate::error::{Error, Result};
use crate::journal::journal_path_for;
use crate::models::{EntityId, LegacyEntry, LegacyOperation, Notification, NotificationKind};

/// Key of the change list written by agents that predate the journal file.
pub const LEGACY_CHANGES_KEY: &str = "ChangeRecorder";

/// Key of the [`MonitorOptions`] object.
pub const MONITOR_KEY: &str = "Monitor";

/// Which dependent data is fetched before a notification is delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Resolve parent collections of every change
    #[serde(default)]
    pub fetch_collections: bool,
    /// Resolve tags announced by id only
    #[serde(default)]
    pub fetch_tags: bool,
    /// Scope used when resolving items announced by id only
    #[serde(default)]
    pub item_fetch_scope: FetchScope,
    /// Record changes to the journal and replay them on demand
    #[serde(default = "default_change_recording")]
    pub change_recording: bool,
}

const fn default_change_recording() -> bool {
    true
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            fetch_collections: false,
            fetch_tags: false,
            item_fetch_scope: FetchScope::default(),
            change_recording: default_change_recording(),
        }
    }
}

/// One entry of the legacy change list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyChange {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub op: i32,
    #[serde(default)]
    pub uid: EntityId,
    #[serde(default)]
    pub rid: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default = "invalid_id")]
    pub parent_col: EntityId,
    #[serde(default = "invalid_id")]
    pub parent_dest_col: EntityId,
    #[serde(default)]
    pub item_parts: Vec<String>,
}

const fn invalid_id() -> EntityId {
    crate::models::INVALID_ID
}

impl LegacyChange {
    /// Convert to a notification. Only item and collection entries survive.
    pub fn into_notification(self) -> Option<Notification> {
        let kind = match self.kind {
            1 => NotificationKind::Items,
            2 => NotificationKind::Collections,
            other => {
                warn!("Skipping legacy change entry of unsupported type {}", other);
                return None;
            }
        };
        let op = self.op;
        let entry = LegacyEntry {
            kind,
            operation: LegacyOperation::from_code(op),
            uid: self.uid,
            remote_id: self.rid,
            mime_type: self.mime_type,
            session_id: self.session_id.into_bytes(),
            resource: self.resource,
            parent_collection: self.parent_col,
            parent_dest_collection: self.parent_dest_col,
            item_parts: self
                .item_parts
                .into_iter()
                .map(String::into_bytes)
                .collect::<BTreeSet<_>>(),
        };
        let ntf = entry.into_notification();
        if ntf.is_none() {
            warn!("Skipping legacy {} change with operation code {}", kind, op);
        }
        ntf
    }
}

/// JSON-backed key/value settings file.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsStore {
    path: PathBuf,
    values: Map<String, Value>,
}

impl SettingsStore {
    /// Open a settings file. A missing file opens as empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                values: Map::new(),
            });
        }

        let raw = std::fs::read_to_string(&path)?;
        let values = match serde_json::from_str::<Value>(&raw)? {
            Value::Object(values) => values,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "settings file {} is not a JSON object",
                    path.display()
                )))
            }
        };
        Ok(Self { path, values })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the journal that belongs to these settings.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        journal_path_for(&self.path)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.values
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Error::from)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.values
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }

    /// Monitor options, defaulted when the key is absent.
    pub fn monitor_options(&self) -> Result<MonitorOptions> {
        Ok(self.get(MONITOR_KEY)?.unwrap_or_default())
    }

    /// Notifications stored in the legacy change list, in order.
    pub fn legacy_changes(&self) -> Result<Vec<Notification>> {
        let entries: Vec<LegacyChange> = self.get(LEGACY_CHANGES_KEY)?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter_map(LegacyChange::into_notification)
            .collect())
    }

    /// Drop the legacy change list and persist the settings.
    ///
    /// Returns whether there was anything to drop.
    pub fn clear_legacy_changes(&mut self) -> Result<bool> {
        if !self.remove(LEGACY_CHANGES_KEY) {
            return Ok(false);
        }
        self.save()?;
        info!("Removed legacy change list from {}", self.path.display());
        Ok(true)
    }
}
