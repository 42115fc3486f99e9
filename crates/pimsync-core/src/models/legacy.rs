//! Flat id-only change entries from before per-kind operations existed
//!
//! Both the unversioned journal layout and the settings-embedded change list
//! store changes in this shape.

use std::collections::BTreeSet;

use super::notification::{
    ChangePayload, CollectionOperation, ItemOperation, Notification, NotificationKind, TagOperation,
    FETCH_COLLECTION, FETCH_ITEM, FETCH_TAG,
};
use super::records::{CollectionRecord, EntityId, ItemRecord, TagRecord};

/// Operation codes shared by every kind in old journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyOperation {
    Invalid,
    Add,
    Modify,
    Move,
    Remove,
    Link,
    Unlink,
    Subscribe,
    Unsubscribe,
    ModifyFlags,
    ModifyTags,
    ModifyRelations,
}

impl LegacyOperation {
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Add,
            2 => Self::Modify,
            3 => Self::Move,
            4 => Self::Remove,
            5 => Self::Link,
            6 => Self::Unlink,
            7 => Self::Subscribe,
            8 => Self::Unsubscribe,
            9 => Self::ModifyFlags,
            10 => Self::ModifyTags,
            11 => Self::ModifyRelations,
            _ => Self::Invalid,
        }
    }

    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Add => 1,
            Self::Modify => 2,
            Self::Move => 3,
            Self::Remove => 4,
            Self::Link => 5,
            Self::Unlink => 6,
            Self::Subscribe => 7,
            Self::Unsubscribe => 8,
            Self::ModifyFlags => 9,
            Self::ModifyTags => 10,
            Self::ModifyRelations => 11,
        }
    }

    #[must_use]
    pub const fn to_item(self) -> Option<ItemOperation> {
        Some(match self {
            Self::Add => ItemOperation::Add,
            Self::Modify => ItemOperation::Modify,
            Self::Move => ItemOperation::Move,
            Self::Remove => ItemOperation::Remove,
            Self::Link => ItemOperation::Link,
            Self::Unlink => ItemOperation::Unlink,
            Self::ModifyFlags => ItemOperation::ModifyFlags,
            Self::ModifyTags => ItemOperation::ModifyTags,
            Self::Invalid | Self::Subscribe | Self::Unsubscribe | Self::ModifyRelations => {
                return None
            }
        })
    }

    #[must_use]
    pub const fn to_collection(self) -> Option<CollectionOperation> {
        Some(match self {
            Self::Add => CollectionOperation::Add,
            Self::Modify => CollectionOperation::Modify,
            Self::Move => CollectionOperation::Move,
            Self::Remove => CollectionOperation::Remove,
            Self::Subscribe => CollectionOperation::Subscribe,
            Self::Unsubscribe => CollectionOperation::Unsubscribe,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn to_tag(self) -> Option<TagOperation> {
        Some(match self {
            Self::Add => TagOperation::Add,
            Self::Modify => TagOperation::Modify,
            Self::Remove => TagOperation::Remove,
            _ => return None,
        })
    }
}

/// One flat change entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEntry {
    pub kind: NotificationKind,
    pub operation: LegacyOperation,
    pub uid: EntityId,
    pub remote_id: String,
    pub mime_type: String,
    pub session_id: Vec<u8>,
    pub resource: String,
    pub parent_collection: EntityId,
    pub parent_dest_collection: EntityId,
    pub item_parts: BTreeSet<Vec<u8>>,
}

impl LegacyEntry {
    /// Build the id-only notification this entry describes.
    ///
    /// Returns `None` when the operation has no meaning for the entry's kind.
    #[must_use]
    pub fn into_notification(self) -> Option<Notification> {
        let ntf = match self.kind {
            NotificationKind::Items => {
                let operation = self.operation.to_item()?;
                let item = ItemRecord::stub(self.uid, self.remote_id, self.mime_type);
                let mut ntf = Notification::items(operation, vec![item]).with_marker(FETCH_ITEM);
                if let ChangePayload::Item(change) = &mut ntf.payload {
                    change.item_parts = self.item_parts;
                }
                ntf
            }
            NotificationKind::Collections => {
                let operation = self.operation.to_collection()?;
                let collection = CollectionRecord::stub(self.uid, self.remote_id);
                let mut ntf =
                    Notification::collection(operation, collection).with_marker(FETCH_COLLECTION);
                if let ChangePayload::Collection(change) = &mut ntf.payload {
                    change.changed_parts = self.item_parts;
                }
                ntf
            }
            NotificationKind::Tags => {
                let operation = self.operation.to_tag()?;
                let tag = TagRecord::stub(self.uid, self.remote_id.into_bytes());
                Notification::tag(operation, tag).with_marker(FETCH_TAG)
            }
        };

        Some(
            ntf.with_session(self.session_id)
                .with_resource(self.resource)
                .with_parent(self.parent_collection)
                .with_destination(self.parent_dest_collection, String::new()),
        )
    }
}
