//! What a monitor is watching

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{ChangePayload, EntityId, Notification, NotificationKind, ROOT_COLLECTION_ID};

/// Acceptance rules for incoming notifications.
///
/// Watching the root collection, or switching on `monitor_all`, watches every
/// collection. An empty `kinds` set accepts every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorFilter {
    #[serde(default)]
    pub monitor_all: bool,
    #[serde(default)]
    pub collections: BTreeSet<EntityId>,
    #[serde(default)]
    pub items: BTreeSet<EntityId>,
    #[serde(default)]
    pub resources: BTreeSet<String>,
    #[serde(default)]
    pub mime_types: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<EntityId>,
    #[serde(default)]
    pub kinds: BTreeSet<NotificationKind>,
    /// Sessions whose own changes are not reported back to them
    #[serde(default)]
    pub ignored_sessions: BTreeSet<Vec<u8>>,
}

impl MonitorFilter {
    #[must_use]
    pub fn all() -> Self {
        Self {
            monitor_all: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_collection(mut self, id: EntityId) -> Self {
        self.collections.insert(id);
        self
    }

    #[must_use]
    pub fn with_item(mut self, id: EntityId) -> Self {
        self.items.insert(id);
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_types.insert(mime_type.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, id: EntityId) -> Self {
        self.tags.insert(id);
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kinds.insert(kind);
        self
    }

    #[must_use]
    pub fn ignoring_session(mut self, session_id: impl Into<Vec<u8>>) -> Self {
        self.ignored_sessions.insert(session_id.into());
        self
    }

    #[must_use]
    pub fn is_kind_monitored(&self, kind: NotificationKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    #[must_use]
    pub fn is_collection_monitored(&self, id: EntityId) -> bool {
        if self.monitor_all {
            return true;
        }
        if id < ROOT_COLLECTION_ID {
            return false;
        }
        self.collections.contains(&id) || self.collections.contains(&ROOT_COLLECTION_ID)
    }

    #[must_use]
    pub fn is_resource_monitored(&self, resource: &str) -> bool {
        !resource.is_empty() && self.resources.contains(resource)
    }

    fn is_move_source_monitored(&self, ntf: &Notification) -> bool {
        self.is_resource_monitored(&ntf.resource)
            || self.is_collection_monitored(ntf.parent_collection)
    }

    fn is_move_destination_monitored(&self, ntf: &Notification) -> bool {
        self.is_resource_monitored(&ntf.destination_resource)
            || self.is_collection_monitored(ntf.parent_dest_collection)
    }

    fn watches_entities_directly(&self, ntf: &Notification) -> bool {
        match &ntf.payload {
            ChangePayload::Item(change) => change.items.iter().any(|item| {
                self.items.contains(&item.id) || self.mime_types.contains(&item.mime_type)
            }),
            ChangePayload::Collection(change) => {
                self.is_collection_monitored(change.collection.id)
                    || change
                        .collection
                        .mime_types
                        .iter()
                        .any(|mime| self.mime_types.contains(mime))
            }
            ChangePayload::Tag(change) => self.tags.contains(&change.tag.id),
        }
    }

    /// Whether a notification is of interest at all.
    #[must_use]
    pub fn accepts(&self, ntf: &Notification) -> bool {
        if self.ignored_sessions.contains(&ntf.session_id) || !self.is_kind_monitored(ntf.kind()) {
            return false;
        }
        if self.monitor_all {
            return true;
        }

        match &ntf.payload {
            ChangePayload::Tag(change) => self.tags.is_empty() || self.tags.contains(&change.tag.id),
            ChangePayload::Item(change) => {
                self.is_move_source_monitored(ntf)
                    || self.is_move_destination_monitored(ntf)
                    || self.watches_entities_directly(ntf)
                    || change
                        .added_tags
                        .iter()
                        .chain(&change.removed_tags)
                        .any(|tag| self.tags.contains(&tag.id))
            }
            ChangePayload::Collection(_) => {
                self.is_move_source_monitored(ntf)
                    || self.is_move_destination_monitored(ntf)
                    || self.watches_entities_directly(ntf)
            }
        }
    }

    /// Rewrite a move for what this filter can see.
    ///
    /// A move that only leaves the watched area becomes a removal from the
    /// source; one that only enters it becomes an addition to the destination.
    /// Returns `None` when neither end is watched. Other notifications pass
    /// through unchanged.
    #[must_use]
    pub fn translate_move(&self, ntf: &Arc<Notification>) -> Option<Arc<Notification>> {
        if !ntf.operation().is_move() || self.watches_entities_directly(ntf) {
            return Some(Arc::clone(ntf));
        }

        let source_watched = self.is_move_source_monitored(ntf);
        let destination_watched = self.is_move_destination_monitored(ntf);
        match (source_watched, destination_watched) {
            (true, true) => Some(Arc::clone(ntf)),
            (true, false) => Some(Arc::new(ntf.as_removal_from_source())),
            (false, true) => Some(Arc::new(ntf.as_addition_to_destination())),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CollectionOperation, CollectionRecord, ItemOperation, ItemRecord, Operation, TagOperation,
        TagRecord,
    };

    fn moved_item(from: EntityId, to: EntityId) -> Arc<Notification> {
        Arc::new(
            Notification::items(ItemOperation::Move, vec![ItemRecord::stub(1, "", "text/plain")])
                .with_parent(from)
                .with_destination(to, String::new()),
        )
    }

    #[test]
    fn test_root_collection_watches_everything() {
        let filter = MonitorFilter::default().with_collection(ROOT_COLLECTION_ID);
        assert!(filter.is_collection_monitored(42));
        assert!(!filter.is_collection_monitored(-1));
    }

    #[test]
    fn test_ignored_session_and_kind() {
        let filter = MonitorFilter::all()
            .ignoring_session(b"self".to_vec())
            .with_kind(NotificationKind::Items);
        let item = Notification::items(ItemOperation::Add, vec![ItemRecord::stub(1, "", "")]);
        assert!(filter.accepts(&item));
        assert!(!filter.accepts(&item.clone().with_session(b"self".to_vec())));
        let collection =
            Notification::collection(CollectionOperation::Add, CollectionRecord::stub(3, ""));
        assert!(!filter.accepts(&collection));
    }

    #[test]
    fn test_item_acceptance_by_collection_resource_and_mime() {
        let filter = MonitorFilter::default()
            .with_collection(5)
            .with_resource("imap")
            .with_mime_type("text/calendar");
        let base = Notification::items(ItemOperation::Add, vec![ItemRecord::stub(1, "", "text/plain")]);

        assert!(filter.accepts(&base.clone().with_parent(5)));
        assert!(filter.accepts(&base.clone().with_resource("imap").with_parent(9)));
        assert!(!filter.accepts(&base.clone().with_parent(9)));

        let calendar =
            Notification::items(ItemOperation::Add, vec![ItemRecord::stub(2, "", "text/calendar")]);
        assert!(filter.accepts(&calendar.with_parent(9)));
    }

    #[test]
    fn test_tag_acceptance() {
        let tag = Notification::tag(TagOperation::Add, TagRecord::stub(4, Vec::new()));
        assert!(MonitorFilter::default().accepts(&tag));
        assert!(MonitorFilter::default().with_tag(4).accepts(&tag));
        assert!(!MonitorFilter::default().with_tag(5).accepts(&tag));
    }

    #[test]
    fn test_move_translation() {
        let filter = MonitorFilter::default().with_collection(10);

        let both = MonitorFilter::default().with_collection(10).with_collection(20);
        let ntf = moved_item(10, 20);
        assert!(Arc::ptr_eq(&both.translate_move(&ntf).unwrap(), &ntf));

        let out = filter.translate_move(&moved_item(10, 20)).unwrap();
        assert_eq!(out.operation(), Operation::Item(ItemOperation::Remove));
        assert_eq!(out.parent_collection, 10);

        let into = filter.translate_move(&moved_item(30, 10)).unwrap();
        assert_eq!(into.operation(), Operation::Item(ItemOperation::Add));
        assert_eq!(into.parent_collection, 10);
        assert_eq!(into.parent_dest_collection, -1);

        assert!(filter.translate_move(&moved_item(30, 40)).is_none());
    }

    #[test]
    fn test_directly_watched_item_moves_unchanged() {
        let filter = MonitorFilter::default().with_item(1);
        let ntf = moved_item(30, 40);
        assert!(filter.accepts(&ntf));
        assert!(Arc::ptr_eq(&filter.translate_move(&ntf).unwrap(), &ntf));
    }
}
