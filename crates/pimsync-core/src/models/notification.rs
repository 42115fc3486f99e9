//! Change notification model

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::records::{CollectionRecord, EntityId, ItemRecord, TagRecord, INVALID_ID};

/// Marker set on item notifications that only carry ids.
pub const FETCH_ITEM: &[u8] = b"FETCH_ITEM";
/// Marker set on collection notifications that only carry an id.
pub const FETCH_COLLECTION: &[u8] = b"FETCH_COLLECTION";
/// Marker set on tag notifications that only carry an id.
pub const FETCH_TAG: &[u8] = b"FETCH_TAG";

/// Which entity kind a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Items,
    Collections,
    Tags,
}

impl NotificationKind {
    pub const ALL: [Self; 3] = [Self::Items, Self::Collections, Self::Tags];

    /// Type tag used in the journal and legacy settings entries.
    #[must_use]
    pub const fn tag(self) -> i32 {
        match self {
            Self::Items => 1,
            Self::Collections => 2,
            Self::Tags => 3,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Collections => "collections",
            Self::Tags => "tags",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations on items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOperation {
    Add,
    Modify,
    Move,
    Remove,
    Link,
    Unlink,
    ModifyFlags,
    ModifyTags,
}

impl ItemOperation {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Add => 1,
            Self::Modify => 2,
            Self::Move => 3,
            Self::Remove => 4,
            Self::Link => 5,
            Self::Unlink => 6,
            Self::ModifyFlags => 7,
            Self::ModifyTags => 8,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Add,
            2 => Self::Modify,
            3 => Self::Move,
            4 => Self::Remove,
            5 => Self::Link,
            6 => Self::Unlink,
            7 => Self::ModifyFlags,
            8 => Self::ModifyTags,
            _ => return None,
        })
    }
}

/// Operations on collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionOperation {
    Add,
    Modify,
    Move,
    Remove,
    Subscribe,
    Unsubscribe,
}

impl CollectionOperation {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Add => 1,
            Self::Modify => 2,
            Self::Move => 3,
            Self::Remove => 4,
            Self::Subscribe => 5,
            Self::Unsubscribe => 6,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Add,
            2 => Self::Modify,
            3 => Self::Move,
            4 => Self::Remove,
            5 => Self::Subscribe,
            6 => Self::Unsubscribe,
            _ => return None,
        })
    }
}

/// Operations on tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOperation {
    Add,
    Modify,
    Remove,
}

impl TagOperation {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Add => 1,
            Self::Modify => 2,
            Self::Remove => 3,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::Add,
            2 => Self::Modify,
            3 => Self::Remove,
            _ => return None,
        })
    }
}

/// Operation of any notification kind, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "op", rename_all = "lowercase")]
pub enum Operation {
    Item(ItemOperation),
    Collection(CollectionOperation),
    Tag(TagOperation),
}

impl Operation {
    #[must_use]
    pub const fn is_move(self) -> bool {
        matches!(
            self,
            Self::Item(ItemOperation::Move) | Self::Collection(CollectionOperation::Move)
        )
    }

    #[must_use]
    pub const fn is_remove(self) -> bool {
        matches!(
            self,
            Self::Item(ItemOperation::Remove)
                | Self::Collection(CollectionOperation::Remove)
                | Self::Tag(TagOperation::Remove)
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item(op) => write!(f, "{op:?}"),
            Self::Collection(op) => write!(f, "{op:?}"),
            Self::Tag(op) => write!(f, "{op:?}"),
        }
    }
}

/// Change to one or more items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChange {
    pub operation: ItemOperation,
    /// Affected items, in the order the source reported them
    pub items: Vec<ItemRecord>,
    /// Names of the parts that changed
    pub item_parts: BTreeSet<Vec<u8>>,
    pub added_flags: BTreeSet<Vec<u8>>,
    pub removed_flags: BTreeSet<Vec<u8>>,
    pub added_tags: Vec<TagRecord>,
    pub removed_tags: Vec<TagRecord>,
    /// Hint that the payload must be fetched before delivery
    pub must_retrieve: bool,
}

/// Change to a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionChange {
    pub operation: CollectionOperation,
    pub collection: CollectionRecord,
    /// Names of the attributes that changed
    pub changed_parts: BTreeSet<Vec<u8>>,
}

/// Change to a single tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagChange {
    pub operation: TagOperation,
    pub tag: TagRecord,
}

/// Kind-specific part of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangePayload {
    Item(ItemChange),
    Collection(CollectionChange),
    Tag(TagChange),
}

/// One change reported by the storage server.
///
/// Notifications are immutable once queued and shared as `Arc<Notification>`.
/// Rewrites such as move translation build a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Session that caused the change
    pub session_id: Vec<u8>,
    /// Resource owning the source collection
    pub resource: String,
    /// Resource owning the destination collection of a move
    pub destination_resource: String,
    pub parent_collection: EntityId,
    pub parent_dest_collection: EntityId,
    /// Marker set, e.g. [`FETCH_ITEM`]
    pub metadata: BTreeSet<Vec<u8>>,
    pub payload: ChangePayload,
}

impl Notification {
    fn with_payload(payload: ChangePayload) -> Self {
        Self {
            session_id: Vec::new(),
            resource: String::new(),
            destination_resource: String::new(),
            parent_collection: INVALID_ID,
            parent_dest_collection: INVALID_ID,
            metadata: BTreeSet::new(),
            payload,
        }
    }

    /// Create an item notification
    #[must_use]
    pub fn items(operation: ItemOperation, items: Vec<ItemRecord>) -> Self {
        Self::with_payload(ChangePayload::Item(ItemChange {
            operation,
            items,
            item_parts: BTreeSet::new(),
            added_flags: BTreeSet::new(),
            removed_flags: BTreeSet::new(),
            added_tags: Vec::new(),
            removed_tags: Vec::new(),
            must_retrieve: false,
        }))
    }

    /// Create a collection notification
    #[must_use]
    pub fn collection(operation: CollectionOperation, collection: CollectionRecord) -> Self {
        Self::with_payload(ChangePayload::Collection(CollectionChange {
            operation,
            collection,
            changed_parts: BTreeSet::new(),
        }))
    }

    /// Create a tag notification
    #[must_use]
    pub fn tag(operation: TagOperation, tag: TagRecord) -> Self {
        Self::with_payload(ChangePayload::Tag(TagChange { operation, tag }))
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<Vec<u8>>) -> Self {
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    #[must_use]
    pub const fn with_parent(mut self, parent: EntityId) -> Self {
        self.parent_collection = parent;
        self
    }

    /// Set the destination of a move
    #[must_use]
    pub fn with_destination(mut self, parent: EntityId, resource: impl Into<String>) -> Self {
        self.parent_dest_collection = parent;
        self.destination_resource = resource.into();
        self
    }

    #[must_use]
    pub fn with_marker(mut self, marker: &[u8]) -> Self {
        self.metadata.insert(marker.to_vec());
        self
    }

    #[must_use]
    pub const fn kind(&self) -> NotificationKind {
        match self.payload {
            ChangePayload::Item(_) => NotificationKind::Items,
            ChangePayload::Collection(_) => NotificationKind::Collections,
            ChangePayload::Tag(_) => NotificationKind::Tags,
        }
    }

    #[must_use]
    pub const fn operation(&self) -> Operation {
        match &self.payload {
            ChangePayload::Item(change) => Operation::Item(change.operation),
            ChangePayload::Collection(change) => Operation::Collection(change.operation),
            ChangePayload::Tag(change) => Operation::Tag(change.operation),
        }
    }

    #[must_use]
    pub fn has_marker(&self, marker: &[u8]) -> bool {
        self.metadata.contains(marker)
    }

    /// Ids of the entities this notification is about.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<EntityId> {
        match &self.payload {
            ChangePayload::Item(change) => change.items.iter().map(|item| item.id).collect(),
            ChangePayload::Collection(change) => vec![change.collection.id],
            ChangePayload::Tag(change) => vec![change.tag.id],
        }
    }

    /// Rewrite a move into a removal from its source collection.
    #[must_use]
    pub fn as_removal_from_source(&self) -> Self {
        let mut copy = self.clone();
        copy.set_operation_remove_or_add(true);
        copy.parent_dest_collection = INVALID_ID;
        copy.destination_resource.clear();
        copy
    }

    /// Rewrite a move into an addition to its destination collection.
    #[must_use]
    pub fn as_addition_to_destination(&self) -> Self {
        let mut copy = self.clone();
        copy.set_operation_remove_or_add(false);
        copy.parent_collection = self.parent_dest_collection;
        copy.parent_dest_collection = INVALID_ID;
        if !self.destination_resource.is_empty() {
            copy.resource = std::mem::take(&mut copy.destination_resource);
        }
        copy
    }

    fn set_operation_remove_or_add(&mut self, remove: bool) {
        match &mut self.payload {
            ChangePayload::Item(change) => {
                change.operation = if remove {
                    ItemOperation::Remove
                } else {
                    ItemOperation::Add
                };
            }
            ChangePayload::Collection(change) => {
                change.operation = if remove {
                    CollectionOperation::Remove
                } else {
                    CollectionOperation::Add
                };
            }
            ChangePayload::Tag(_) => {}
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.entity_ids().iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} {} [{}] session={} resource={} parent={}",
            self.kind(),
            self.operation(),
            ids.join(","),
            String::from_utf8_lossy(&self.session_id),
            self.resource,
            self.parent_collection,
        )?;
        if self.operation().is_move() {
            write!(
                f,
                " dest={} dest_resource={}",
                self.parent_dest_collection, self.destination_resource
            )?;
        }
        if !self.metadata.is_empty() {
            let markers: Vec<_> = self
                .metadata
                .iter()
                .map(|marker| String::from_utf8_lossy(marker))
                .collect();
            write!(f, " metadata={}", markers.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item_move() -> Notification {
        Notification::items(ItemOperation::Move, vec![ItemRecord::stub(7, "r7", "text/plain")])
            .with_resource("imap")
            .with_parent(10)
            .with_destination(20, "maildir")
    }

    #[test]
    fn test_kind_and_operation() {
        let ntf = item_move();
        assert_eq!(ntf.kind(), NotificationKind::Items);
        assert_eq!(ntf.operation(), Operation::Item(ItemOperation::Move));
        assert!(ntf.operation().is_move());

        let tag = Notification::tag(TagOperation::Remove, TagRecord::stub(3, "t3"));
        assert_eq!(tag.kind(), NotificationKind::Tags);
        assert!(tag.operation().is_remove());
    }

    #[test]
    fn test_removal_from_source_drops_destination() {
        let removal = item_move().as_removal_from_source();
        assert_eq!(removal.operation(), Operation::Item(ItemOperation::Remove));
        assert_eq!(removal.parent_collection, 10);
        assert_eq!(removal.parent_dest_collection, INVALID_ID);
        assert_eq!(removal.resource, "imap");
    }

    #[test]
    fn test_addition_to_destination_uses_destination_parent() {
        let addition = item_move().as_addition_to_destination();
        assert_eq!(addition.operation(), Operation::Item(ItemOperation::Add));
        assert_eq!(addition.parent_collection, 20);
        assert_eq!(addition.parent_dest_collection, INVALID_ID);
        assert_eq!(addition.resource, "maildir");
    }

    #[test]
    fn test_operation_codes_are_stable() {
        for code in 1..=8 {
            let op = ItemOperation::from_code(code).unwrap();
            assert_eq!(op.code(), code);
        }
        assert_eq!(ItemOperation::from_code(0), None);
        assert_eq!(CollectionOperation::from_code(7), None);
        assert_eq!(TagOperation::from_code(3), Some(TagOperation::Remove));
    }

    #[test]
    fn test_display_is_one_line() {
        let line = item_move().with_marker(FETCH_ITEM).to_string();
        assert_eq!(
            line,
            "items Move [7] session= resource=imap parent=10 dest=20 dest_resource=maildir metadata=FETCH_ITEM"
        );
    }
}
