//! Consumer registry and the events delivered to consumers

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::models::{CollectionRecord, ItemRecord, Notification, NotificationKind, TagRecord};

/// Entities of a delivered notification, resolved from the caches when the
/// notification only carried ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveredEntities {
    Items(Vec<ItemRecord>),
    Collection(CollectionRecord),
    Tag(TagRecord),
}

/// A notification ready for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub notification: Arc<Notification>,
    pub entities: DeliveredEntities,
    pub parent: Option<CollectionRecord>,
    /// Destination collection of a move
    pub destination: Option<CollectionRecord>,
}

impl Delivery {
    /// Ids of the delivered items, empty for other kinds.
    #[must_use]
    pub fn item_ids(&self) -> Vec<i64> {
        match &self.entities {
            DeliveredEntities::Items(items) => items.iter().map(|item| item.id).collect(),
            DeliveredEntities::Collection(_) | DeliveredEntities::Tag(_) => Vec::new(),
        }
    }
}

/// Events observed by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// The pending queue grew
    ChangesAdded,
    /// The head notification is ready; acknowledge it with `change_processed`
    NotificationReady(Delivery),
    /// `replay_next` found nothing to deliver
    NothingToReplay,
}

/// Notification kinds a consumer wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    kinds: BTreeSet<NotificationKind>,
}

impl Interest {
    #[must_use]
    pub fn all() -> Self {
        Self::only(NotificationKind::ALL)
    }

    #[must_use]
    pub fn only(kinds: impl IntoIterator<Item = NotificationKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, kind: NotificationKind) -> bool {
        self.kinds.contains(&kind)
    }
}

#[derive(Debug)]
struct Listener {
    interest: Interest,
    sender: UnboundedSender<RecorderEvent>,
}

/// Live consumers. Receivers that were dropped are pruned on the next send.
#[derive(Debug, Default)]
pub struct Listeners {
    entries: Vec<Listener>,
}

impl Listeners {
    pub fn subscribe(&mut self, interest: Interest) -> UnboundedReceiver<RecorderEvent> {
        let (sender, receiver) = unbounded_channel();
        self.entries.push(Listener { interest, sender });
        receiver
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any live consumer wants notifications of `kind`.
    #[must_use]
    pub fn is_interested(&self, kind: NotificationKind) -> bool {
        self.entries
            .iter()
            .any(|listener| listener.interest.contains(kind) && !listener.sender.is_closed())
    }

    /// Send a delivery to interested consumers. Returns whether anyone got it.
    pub fn deliver(&mut self, delivery: &Delivery) -> bool {
        let kind = delivery.notification.kind();
        let mut heard = false;
        self.entries.retain(|listener| {
            if !listener.interest.contains(kind) {
                return !listener.sender.is_closed();
            }
            let sent = listener
                .sender
                .send(RecorderEvent::NotificationReady(delivery.clone()))
                .is_ok();
            heard |= sent;
            sent
        });
        if !heard {
            debug!("Nobody listening for {}", delivery.notification);
        }
        heard
    }

    /// Send an event to every consumer.
    pub fn broadcast(&mut self, event: &RecorderEvent) {
        self.entries
            .retain(|listener| listener.sender.send(event.clone()).is_ok());
    }
}
