//! Data models for pimsync

mod legacy;
mod notification;
mod records;

pub use legacy::{LegacyEntry, LegacyOperation};
pub use notification::{
    ChangePayload, CollectionChange, CollectionOperation, ItemChange, ItemOperation, Notification,
    NotificationKind, Operation, TagChange, TagOperation, FETCH_COLLECTION, FETCH_ITEM, FETCH_TAG,
};
pub use records::{
    Ancestor, Attributes, CachePolicy, CollectionRecord, CollectionStatistics, EntityId, ItemPart,
    ItemRecord, PartMetaData, StorageType, TagRecord, Tristate, INVALID_ID, ROOT_COLLECTION_ID,
};
