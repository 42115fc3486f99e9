//! Live notification pipeline
//!
//! A [`Monitor`] accepts notifications, queues them, resolves their missing
//! data through the [`Caches`] and hands them to listeners. Up to
//! [`PIPELINE_SIZE`] notifications can wait for resolution at once; the rest
//! stay queued. [`crate::recorder::ChangeRecorder`] drives the same monitor
//! with a pipeline of zero and serves the queue one notification at a time.

mod filter;
mod listeners;
mod queue;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::debug;

pub use filter::MonitorFilter;
pub use listeners::{DeliveredEntities, Delivery, Interest, Listeners, RecorderEvent};
pub use queue::NotificationQueue;

use crate::cache::{Caches, FetchRequest, FetchResult, FetchScope};
use crate::config::MonitorOptions;
use crate::models::{
    ChangePayload, CollectionOperation, CollectionRecord, EntityId, ItemOperation, Notification,
    TagOperation, FETCH_COLLECTION, FETCH_ITEM, FETCH_TAG, ROOT_COLLECTION_ID,
};

/// Notifications resolved concurrently in live mode.
pub const PIPELINE_SIZE: usize = 5;

/// What happened to an emitted notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    /// At least one listener received it
    Heard,
    /// Nobody was listening for its kind
    Unheard,
    /// Its entities no longer exist
    Unresolvable,
}

/// Notification queue plus resolution pipeline.
#[derive(Debug)]
pub struct Monitor {
    filter: MonitorFilter,
    options: MonitorOptions,
    listeners: Listeners,
    caches: Caches,
    pending: NotificationQueue,
    pipeline: VecDeque<Arc<Notification>>,
    pipeline_capacity: usize,
}

impl Monitor {
    /// Create a monitor and the channel its fetch requests arrive on.
    #[must_use]
    pub fn new(
        filter: MonitorFilter,
        options: MonitorOptions,
    ) -> (Self, UnboundedReceiver<FetchRequest>) {
        let (requests, receiver) = unbounded_channel();
        let monitor = Self {
            filter,
            options,
            listeners: Listeners::default(),
            caches: Caches::new(PIPELINE_SIZE, &requests),
            pending: NotificationQueue::new(),
            pipeline: VecDeque::new(),
            pipeline_capacity: PIPELINE_SIZE,
        };
        (monitor, receiver)
    }

    #[must_use]
    pub const fn filter(&self) -> &MonitorFilter {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut MonitorFilter {
        &mut self.filter
    }

    #[must_use]
    pub const fn options(&self) -> &MonitorOptions {
        &self.options
    }

    pub fn subscribe(&mut self, interest: Interest) -> UnboundedReceiver<RecorderEvent> {
        self.listeners.subscribe(interest)
    }

    pub(crate) fn broadcast(&mut self, event: &RecorderEvent) {
        self.listeners.broadcast(event);
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn pipeline_len(&self) -> usize {
        self.pipeline.len()
    }

    #[must_use]
    pub const fn pipeline_capacity(&self) -> usize {
        self.pipeline_capacity
    }

    pub(crate) fn set_pipeline_capacity(&mut self, capacity: usize) {
        self.pipeline_capacity = capacity;
    }

    pub(crate) const fn pending(&self) -> &NotificationQueue {
        &self.pending
    }

    pub(crate) fn pending_mut(&mut self) -> &mut NotificationQueue {
        &mut self.pending
    }

    pub(crate) fn push_pipeline(&mut self, ntf: Arc<Notification>) {
        self.pipeline.push_back(ntf);
    }

    pub(crate) fn clear_pipeline(&mut self) {
        self.pipeline.clear();
    }

    /// Put in-flight notifications back at the front of the queue, keeping
    /// their order. Returns how many were moved.
    pub(crate) fn recall_pipeline(&mut self) -> usize {
        let recalled = self.pipeline.len();
        while let Some(ntf) = self.pipeline.pop_back() {
            self.pending.push_front(ntf);
        }
        recalled
    }

    /// Accept a batch from the change source and dispatch what fits into the
    /// pipeline. Returns how many notifications were queued.
    pub fn notify(&mut self, batch: impl IntoIterator<Item = Notification>) -> usize {
        let appended = self.enqueue_batch(batch);
        self.dispatch();
        appended
    }

    /// Store a fetch answer and deliver whatever became resolvable.
    pub fn fetch_completed(&mut self, result: FetchResult) {
        self.complete_fetch(result);
        self.data_available(false);
    }

    pub(crate) fn complete_fetch(&mut self, result: FetchResult) -> bool {
        self.caches.complete(result)
    }

    /// Queue accepted notifications without dispatching them.
    pub(crate) fn enqueue_batch(&mut self, batch: impl IntoIterator<Item = Notification>) -> usize {
        let mut appended = 0;
        for ntf in batch {
            self.invalidate_caches(&ntf);
            if self.is_lazily_ignored(&ntf) {
                debug!("Ignoring {}: nobody listens for {}", ntf, ntf.kind());
                continue;
            }
            if !self.filter.accepts(&ntf) {
                continue;
            }
            let Some(ntf) = self.filter.translate_move(&Arc::new(ntf)) else {
                debug!("Ignoring move between unwatched collections");
                continue;
            };
            self.pending.push_back(ntf);
            appended += 1;
        }
        appended
    }

    /// Move queued notifications into the pipeline while there is room.
    pub fn dispatch(&mut self) {
        while self.pipeline.len() < self.pipeline_capacity {
            let Some(ntf) = self.pending.pop_front() else {
                break;
            };
            let Some(ntf) = self.filter.translate_move(&ntf) else {
                continue;
            };
            if self.ensure_data_available(&ntf) && self.pipeline.is_empty() {
                self.emit(&ntf);
            } else {
                self.pipeline.push_back(ntf);
            }
        }
    }

    /// Emit resolved notifications from the head of the pipeline, then refill
    /// it. Returns how many queued notifications were purged on the way.
    pub(crate) fn data_available(&mut self, protect_head: bool) -> usize {
        let mut erased = 0;
        while let Some(head) = self.pipeline.front().cloned() {
            if !self.ensure_data_available(&head) {
                break;
            }
            self.pipeline.pop_front();
            if self.emit(&head) == Emitted::Unheard {
                erased += self.clean_old(protect_head);
            }
        }
        self.dispatch();
        erased
    }

    pub(crate) fn is_lazily_ignored(&self, ntf: &Notification) -> bool {
        !self.listeners.is_interested(ntf.kind())
    }

    /// Drop queued notifications that are no longer accepted or that nobody
    /// listens for. With `protect_head` the queue head is kept regardless.
    pub(crate) fn clean_old(&mut self, protect_head: bool) -> usize {
        let filter = &self.filter;
        let listeners = &self.listeners;
        let keep = |ntf: &Notification| filter.accepts(ntf) && listeners.is_interested(ntf.kind());

        let before = self.pipeline.len();
        self.pipeline.retain(|ntf| keep(&**ntf));
        let erased = before - self.pipeline.len();
        let erased = erased + self.pending.retain_after(usize::from(protect_head), keep);
        if erased > 0 {
            debug!("Purged {} stale notifications", erased);
        }
        erased
    }

    fn collection_available(&mut self, id: EntityId) -> bool {
        if id <= ROOT_COLLECTION_ID {
            return true;
        }
        self.caches
            .collections
            .ensure_cached(id, &FetchScope::default())
    }

    /// Whether everything needed to deliver `ntf` is cached. Missing pieces
    /// are requested.
    pub(crate) fn ensure_data_available(&mut self, ntf: &Notification) -> bool {
        let mut available = true;
        if self.options.fetch_collections && !matches!(ntf.payload, ChangePayload::Tag(_)) {
            available &= self.collection_available(ntf.parent_collection);
            if ntf.operation().is_move() {
                available &= self.collection_available(ntf.parent_dest_collection);
            }
        }

        match &ntf.payload {
            ChangePayload::Item(change) => {
                if change.operation != ItemOperation::Remove
                    && (ntf.has_marker(FETCH_ITEM) || change.must_retrieve)
                {
                    let scope = self.options.item_fetch_scope.clone();
                    for item in &change.items {
                        available &= self.caches.items.ensure_cached(item.id, &scope);
                    }
                }
            }
            ChangePayload::Collection(change) => {
                if change.operation != CollectionOperation::Remove
                    && ntf.has_marker(FETCH_COLLECTION)
                {
                    available &= self
                        .caches
                        .collections
                        .ensure_cached(change.collection.id, &FetchScope::default());
                }
            }
            ChangePayload::Tag(change) => {
                if self.needs_tag_fetch(ntf, change.operation) {
                    available &= self
                        .caches
                        .tags
                        .ensure_cached(change.tag.id, &FetchScope::default());
                }
            }
        }
        available
    }

    fn needs_tag_fetch(&self, ntf: &Notification, operation: TagOperation) -> bool {
        self.options.fetch_tags && operation != TagOperation::Remove && ntf.has_marker(FETCH_TAG)
    }

    fn collection_record(&self, id: EntityId) -> Option<CollectionRecord> {
        if id < ROOT_COLLECTION_ID {
            return None;
        }
        if id == ROOT_COLLECTION_ID {
            return Some(CollectionRecord::stub(ROOT_COLLECTION_ID, String::new()));
        }
        self.caches
            .collections
            .retrieve(id)
            .cloned()
            .or_else(|| Some(CollectionRecord::stub(id, String::new())))
    }

    /// Build the delivery for a resolved notification, or `None` if the
    /// entities it names turned out not to exist.
    fn materialize(&self, ntf: &Arc<Notification>) -> Option<Delivery> {
        let entities = match &ntf.payload {
            ChangePayload::Item(change) => {
                if change.operation != ItemOperation::Remove
                    && (ntf.has_marker(FETCH_ITEM) || change.must_retrieve)
                {
                    let items: Vec<_> = change
                        .items
                        .iter()
                        .filter_map(|item| self.caches.items.retrieve(item.id).cloned())
                        .collect();
                    if items.is_empty() {
                        return None;
                    }
                    DeliveredEntities::Items(items)
                } else {
                    DeliveredEntities::Items(change.items.clone())
                }
            }
            ChangePayload::Collection(change) => {
                if change.operation != CollectionOperation::Remove
                    && ntf.has_marker(FETCH_COLLECTION)
                {
                    let collection = self.caches.collections.retrieve(change.collection.id)?;
                    DeliveredEntities::Collection(collection.clone())
                } else {
                    DeliveredEntities::Collection(change.collection.clone())
                }
            }
            ChangePayload::Tag(change) => {
                if self.needs_tag_fetch(ntf, change.operation) {
                    DeliveredEntities::Tag(self.caches.tags.retrieve(change.tag.id)?.clone())
                } else {
                    DeliveredEntities::Tag(change.tag.clone())
                }
            }
        };

        let destination = if ntf.operation().is_move() {
            self.collection_record(ntf.parent_dest_collection)
        } else {
            None
        };
        Some(Delivery {
            notification: Arc::clone(ntf),
            entities,
            parent: self.collection_record(ntf.parent_collection),
            destination,
        })
    }

    /// Hand a resolved notification to its listeners.
    pub(crate) fn emit(&mut self, ntf: &Arc<Notification>) -> Emitted {
        let Some(delivery) = self.materialize(ntf) else {
            debug!("Dropping unresolvable {}", ntf);
            return Emitted::Unresolvable;
        };
        if self.listeners.deliver(&delivery) {
            Emitted::Heard
        } else {
            Emitted::Unheard
        }
    }

    fn invalidate_caches(&mut self, ntf: &Notification) {
        match &ntf.payload {
            ChangePayload::Item(change) => {
                for item in &change.items {
                    match change.operation {
                        ItemOperation::Remove => self.caches.items.invalidate(item.id),
                        ItemOperation::Modify
                        | ItemOperation::ModifyFlags
                        | ItemOperation::ModifyTags
                        | ItemOperation::Move => self.caches.items.update(item.id),
                        ItemOperation::Add | ItemOperation::Link | ItemOperation::Unlink => {}
                    }
                }
            }
            ChangePayload::Collection(change) => {
                let id = change.collection.id;
                match change.operation {
                    CollectionOperation::Remove => self.caches.collections.invalidate(id),
                    CollectionOperation::Modify | CollectionOperation::Move => {
                        self.caches.collections.update(id);
                    }
                    CollectionOperation::Add
                    | CollectionOperation::Subscribe
                    | CollectionOperation::Unsubscribe => {}
                }
            }
            ChangePayload::Tag(change) => match change.operation {
                TagOperation::Remove => self.caches.tags.invalidate(change.tag.id),
                TagOperation::Modify => self.caches.tags.update(change.tag.id),
                TagOperation::Add => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::EntityKind;
    use crate::models::{ItemRecord, NotificationKind};

    fn fetching_options() -> MonitorOptions {
        MonitorOptions {
            fetch_collections: true,
            change_recording: false,
            ..MonitorOptions::default()
        }
    }

    fn stub_item(id: EntityId, parent: EntityId) -> Notification {
        Notification::items(ItemOperation::Add, vec![ItemRecord::stub(id, "", "text/plain")])
            .with_parent(parent)
            .with_marker(FETCH_ITEM)
    }

    #[test]
    fn test_lazily_ignored_without_listeners() {
        let (mut monitor, _requests) = Monitor::new(MonitorFilter::all(), fetching_options());
        assert_eq!(monitor.notify([stub_item(1, 0)]), 0);

        let _events = monitor.subscribe(Interest::only([NotificationKind::Items]));
        assert_eq!(monitor.enqueue_batch([stub_item(1, 0)]), 1);
    }

    #[test]
    fn test_available_notification_is_emitted_directly() {
        let (mut monitor, mut requests) = Monitor::new(MonitorFilter::all(), fetching_options());
        let mut events = monitor.subscribe(Interest::all());
        let plain =
            Notification::items(ItemOperation::Add, vec![ItemRecord::stub(1, "", "text/plain")])
                .with_parent(0);

        monitor.notify([plain]);
        assert_eq!(monitor.pending_len(), 0);
        assert_eq!(monitor.pipeline_len(), 0);
        assert!(requests.try_recv().is_err());
        match events.try_recv().unwrap() {
            RecorderEvent::NotificationReady(delivery) => {
                assert_eq!(delivery.item_ids(), vec![1]);
                assert_eq!(delivery.parent.unwrap().id, ROOT_COLLECTION_ID);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_stub_waits_for_fetch() {
        let (mut monitor, mut requests) = Monitor::new(MonitorFilter::all(), fetching_options());
        let mut events = monitor.subscribe(Interest::all());

        monitor.notify([stub_item(7, 3)]);
        assert_eq!(monitor.pipeline_len(), 1);
        let mut asked: Vec<_> = std::iter::from_fn(|| requests.try_recv().ok())
            .map(|request| (request.kind, request.id))
            .collect();
        asked.sort_by_key(|(_, id)| *id);
        assert_eq!(
            asked,
            vec![(EntityKind::Collection, 3), (EntityKind::Item, 7)]
        );
        assert!(events.try_recv().is_err());

        let mut fetched = ItemRecord::stub(7, "remote-7", "text/plain");
        fetched.size = 99;
        monitor.fetch_completed(FetchResult::Item(7, Some(fetched)));
        assert_eq!(monitor.pipeline_len(), 1);

        let mut parent = CollectionRecord::stub(3, "inbox");
        parent.name = "Inbox".to_string();
        monitor.fetch_completed(FetchResult::Collection(3, Some(parent)));
        assert_eq!(monitor.pipeline_len(), 0);

        let RecorderEvent::NotificationReady(delivery) = events.try_recv().unwrap() else {
            panic!("expected a delivery");
        };
        assert_eq!(
            delivery.entities,
            DeliveredEntities::Items(vec![{
                let mut item = ItemRecord::stub(7, "remote-7", "text/plain");
                item.size = 99;
                item
            }])
        );
        assert_eq!(delivery.parent.unwrap().name, "Inbox");
    }

    #[test]
    fn test_vanished_item_is_not_delivered() {
        let (mut monitor, _requests) = Monitor::new(MonitorFilter::all(), MonitorOptions::default());
        let mut events = monitor.subscribe(Interest::all());
        monitor.notify([stub_item(7, 0)]);
        monitor.fetch_completed(FetchResult::Item(7, None));
        assert_eq!(monitor.pipeline_len(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_removal_invalidates_cached_item() {
        let (mut monitor, _requests) = Monitor::new(MonitorFilter::all(), MonitorOptions::default());
        let _events = monitor.subscribe(Interest::all());
        monitor.notify([stub_item(7, 0)]);
        monitor.fetch_completed(FetchResult::Item(7, Some(ItemRecord::stub(7, "", ""))));
        assert!(monitor.caches.items.retrieve(7).is_some());

        let removal = Notification::items(ItemOperation::Remove, vec![ItemRecord::stub(7, "", "")]);
        monitor.notify([removal]);
        assert!(monitor.caches.items.retrieve(7).is_none());
    }

    #[test]
    fn test_clean_old_keeps_protected_head() {
        let (mut monitor, _requests) = Monitor::new(MonitorFilter::all(), MonitorOptions::default());
        let events = monitor.subscribe(Interest::all());
        monitor.set_pipeline_capacity(0);
        monitor.notify([stub_item(1, 0), stub_item(2, 0), stub_item(3, 0)]);
        assert_eq!(monitor.pending_len(), 3);

        drop(events);
        assert_eq!(monitor.clean_old(true), 2);
        assert_eq!(monitor.pending().front().unwrap().entity_ids(), vec![1]);
    }
}
