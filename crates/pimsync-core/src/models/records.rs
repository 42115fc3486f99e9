//! Entity records carried inside change notifications

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage-assigned identifier shared by items, collections and tags.
pub type EntityId = i64;

/// Placeholder id for "no entity", e.g. the destination of a non-move change.
pub const INVALID_ID: EntityId = -1;

/// Id of the root collection. Monitoring it means monitoring every collection.
pub const ROOT_COLLECTION_ID: EntityId = 0;

/// Free-form attribute map keyed by attribute type.
pub type Attributes = BTreeMap<Vec<u8>, Vec<u8>>;

/// One step of an entity's ancestor chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ancestor {
    pub id: EntityId,
    pub remote_id: String,
    pub name: String,
    pub attributes: Attributes,
}

/// Tag metadata, either standalone or attached to an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub id: EntityId,
    pub parent_id: EntityId,
    pub gid: Vec<u8>,
    pub tag_type: Vec<u8>,
    pub remote_id: Vec<u8>,
    pub attributes: Attributes,
}

impl TagRecord {
    /// Id-only tag, as produced by legacy journals.
    #[must_use]
    pub fn stub(id: EntityId, remote_id: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            parent_id: INVALID_ID,
            remote_id: remote_id.into(),
            ..Self::default()
        }
    }
}

/// Where the bytes of a payload part live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Internal,
    External,
    Foreign,
}

impl StorageType {
    pub(crate) const fn code(self) -> i32 {
        match self {
            Self::Internal => 0,
            Self::External => 1,
            Self::Foreign => 2,
        }
    }

    /// Unknown codes fall back to internal storage.
    pub(crate) const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::External,
            2 => Self::Foreign,
            _ => Self::Internal,
        }
    }
}

/// Metadata describing a cached payload part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartMetaData {
    pub name: Vec<u8>,
    pub size: i64,
    pub version: i32,
    pub storage_type: StorageType,
}

/// A payload or attribute part cached with an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPart {
    pub payload_name: Vec<u8>,
    pub meta_data: PartMetaData,
    pub data: Vec<u8>,
}

/// Full item metadata as known to the storage server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: EntityId,
    pub revision: i32,
    pub parent_id: EntityId,
    pub remote_id: String,
    pub remote_revision: String,
    pub gid: String,
    pub size: i64,
    pub mime_type: String,
    pub mtime: Option<DateTime<Utc>>,
    pub flags: Vec<Vec<u8>>,
    pub tags: Vec<TagRecord>,
    pub virtual_references: Vec<EntityId>,
    pub ancestors: Vec<Ancestor>,
    pub parts: Vec<ItemPart>,
    pub cached_parts: Vec<Vec<u8>>,
}

impl ItemRecord {
    /// Id-only item, as produced by legacy journals and the settings store.
    #[must_use]
    pub fn stub(id: EntityId, remote_id: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id,
            parent_id: INVALID_ID,
            remote_id: remote_id.into(),
            mime_type: mime_type.into(),
            ..Self::default()
        }
    }

    /// Whether a part with this name is cached with the item.
    #[must_use]
    pub fn has_part(&self, name: &[u8]) -> bool {
        self.cached_parts.iter().any(|part| part.as_slice() == name)
            || self
                .parts
                .iter()
                .any(|part| part.payload_name.as_slice() == name)
    }
}

/// Item counters for a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub count: i64,
    pub unseen: i64,
    pub size: i64,
}

/// How long and which parts of a collection's items are kept locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub inherit: bool,
    pub check_interval: i32,
    pub cache_timeout: i32,
    pub sync_on_demand: bool,
    pub local_parts: Vec<String>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            inherit: true,
            check_interval: -1,
            cache_timeout: -1,
            sync_on_demand: false,
            local_parts: Vec::new(),
        }
    }
}

/// Per-collection preference that may defer to the parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tristate {
    True,
    False,
    #[default]
    Undefined,
}

impl Tristate {
    pub(crate) const fn code(self) -> i8 {
        match self {
            Self::True => 0,
            Self::False => 1,
            Self::Undefined => 2,
        }
    }

    pub(crate) const fn from_code(code: i8) -> Self {
        match code {
            0 => Self::True,
            1 => Self::False,
            _ => Self::Undefined,
        }
    }
}

/// Full collection metadata as known to the storage server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: EntityId,
    pub parent_id: EntityId,
    pub name: String,
    pub mime_types: Vec<String>,
    pub remote_id: String,
    pub remote_revision: String,
    pub resource: String,
    pub statistics: CollectionStatistics,
    pub search_query: String,
    pub search_collections: Vec<EntityId>,
    pub ancestors: Vec<Ancestor>,
    pub cache_policy: CachePolicy,
    pub attributes: Attributes,
    pub enabled: bool,
    pub display_pref: Tristate,
    pub sync_pref: Tristate,
    pub index_pref: Tristate,
    pub is_virtual: bool,
}

impl Default for CollectionRecord {
    fn default() -> Self {
        Self {
            id: INVALID_ID,
            parent_id: INVALID_ID,
            name: String::new(),
            mime_types: Vec::new(),
            remote_id: String::new(),
            remote_revision: String::new(),
            resource: String::new(),
            statistics: CollectionStatistics::default(),
            search_query: String::new(),
            search_collections: Vec::new(),
            ancestors: Vec::new(),
            cache_policy: CachePolicy::default(),
            attributes: Attributes::new(),
            enabled: true,
            display_pref: Tristate::Undefined,
            sync_pref: Tristate::Undefined,
            index_pref: Tristate::Undefined,
            is_virtual: false,
        }
    }
}

impl CollectionRecord {
    /// Id-only collection, as produced by legacy journals and the settings store.
    #[must_use]
    pub fn stub(id: EntityId, remote_id: impl Into<String>) -> Self {
        Self {
            id,
            remote_id: remote_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_stub_has_no_parent() {
        let item = ItemRecord::stub(42, "rid-42", "message/rfc822");
        assert_eq!(item.id, 42);
        assert_eq!(item.parent_id, INVALID_ID);
        assert_eq!(item.mime_type, "message/rfc822");
        assert!(item.parts.is_empty());
    }

    #[test]
    fn has_part_checks_cached_and_streamed_parts() {
        let mut item = ItemRecord::stub(1, "", "text/plain");
        item.cached_parts.push(b"PLD:HEAD".to_vec());
        item.parts.push(ItemPart {
            payload_name: b"PLD:RFC822".to_vec(),
            ..ItemPart::default()
        });

        assert!(item.has_part(b"PLD:HEAD"));
        assert!(item.has_part(b"PLD:RFC822"));
        assert!(!item.has_part(b"ATR:flags"));
    }

    #[test]
    fn unknown_codes_fall_back_to_defaults() {
        assert_eq!(Tristate::from_code(9), Tristate::Undefined);
        assert_eq!(StorageType::from_code(-3), StorageType::Internal);
        assert_eq!(Tristate::from_code(Tristate::False.code()), Tristate::False);
    }
}
