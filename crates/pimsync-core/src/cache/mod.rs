//! Bounded caches of entities fetched on behalf of pending notifications
//!
//! Caches never perform I/O. A miss queues a [`FetchRequest`] on a channel
//! served by whoever can talk to the storage server; the answer comes back as
//! a [`FetchResult`] through [`Caches::complete`].

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::models::{CollectionRecord, EntityId, ItemRecord, TagRecord};

/// Which parts of an entity a fetch must return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchScope {
    #[serde(default)]
    pub full_payload: bool,
    #[serde(default)]
    pub payload_parts: BTreeSet<String>,
    /// Only answer from the server's cache, never from the backend
    #[serde(default)]
    pub cache_only: bool,
}

/// Entity type of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Item,
    Collection,
    Tag,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item => f.write_str("item"),
            Self::Collection => f.write_str("collection"),
            Self::Tag => f.write_str("tag"),
        }
    }
}

/// Request for one entity, sent to the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub kind: EntityKind,
    pub id: EntityId,
    pub scope: FetchScope,
}

/// Fetcher's answer. `None` means the entity does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Item(EntityId, Option<ItemRecord>),
    Collection(EntityId, Option<CollectionRecord>),
    Tag(EntityId, Option<TagRecord>),
}

impl FetchResult {
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Item(id, _) | Self::Collection(id, _) | Self::Tag(id, _) => *id,
        }
    }
}

#[derive(Debug)]
struct CacheNode<T> {
    id: EntityId,
    pending: bool,
    invalid: bool,
    entity: Option<T>,
}

/// FIFO cache of entities of one kind.
///
/// An id is *cached* once its fetch has been answered, even if the answer
/// was "does not exist"; [`EntityCache::retrieve`] then returns `None`.
#[derive(Debug)]
pub struct EntityCache<T> {
    kind: EntityKind,
    capacity: usize,
    nodes: VecDeque<CacheNode<T>>,
    requests: UnboundedSender<FetchRequest>,
}

impl<T> EntityCache<T> {
    #[must_use]
    pub fn new(kind: EntityKind, capacity: usize, requests: UnboundedSender<FetchRequest>) -> Self {
        Self {
            kind,
            capacity,
            nodes: VecDeque::new(),
            requests,
        }
    }

    fn node(&self, id: EntityId) -> Option<&CacheNode<T>> {
        self.nodes.iter().find(|node| node.id == id)
    }

    fn node_mut(&mut self, id: EntityId) -> Option<&mut CacheNode<T>> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a fetch for `id` has been answered.
    #[must_use]
    pub fn is_cached(&self, id: EntityId) -> bool {
        self.node(id).is_some_and(|node| !node.pending)
    }

    /// Whether `id` is known, answered or not.
    #[must_use]
    pub fn is_requested(&self, id: EntityId) -> bool {
        self.node(id).is_some()
    }

    /// Return whether `id` is cached, requesting it if it is not yet known.
    pub fn ensure_cached(&mut self, id: EntityId, scope: &FetchScope) -> bool {
        if self.is_cached(id) {
            return true;
        }
        if !self.is_requested(id) {
            self.request(id, scope);
        }
        false
    }

    /// Queue a fetch for `id`.
    pub fn request(&mut self, id: EntityId, scope: &FetchScope) {
        self.shrink();
        self.nodes.push_back(CacheNode {
            id,
            pending: true,
            invalid: false,
            entity: None,
        });
        let request = FetchRequest {
            kind: self.kind,
            id,
            scope: scope.clone(),
        };
        if self.requests.send(request).is_err() {
            warn!("Dropping {} fetch request for {}: no fetcher", self.kind, id);
        } else {
            debug!("Requested {} {}", self.kind, id);
        }
    }

    /// The cached entity, if it was fetched and still exists.
    #[must_use]
    pub fn retrieve(&self, id: EntityId) -> Option<&T> {
        self.node(id)
            .filter(|node| !node.pending && !node.invalid)
            .and_then(|node| node.entity.as_ref())
    }

    /// Mark `id` as gone, e.g. after a removal.
    pub fn invalidate(&mut self, id: EntityId) {
        if let Some(node) = self.node_mut(id) {
            node.invalid = true;
        }
    }

    /// Forget a fetched entity so the next request fetches it fresh.
    pub fn update(&mut self, id: EntityId) {
        if let Some(pos) = self
            .nodes
            .iter()
            .position(|node| node.id == id && !node.pending)
        {
            self.nodes.remove(pos);
        }
    }

    /// Store a fetch answer. Returns false if `id` was never requested.
    pub fn complete(&mut self, id: EntityId, entity: Option<T>) -> bool {
        let kind = self.kind;
        let Some(node) = self.node_mut(id) else {
            debug!("Ignoring unrequested {} {}", kind, id);
            return false;
        };
        node.pending = false;
        node.invalid = entity.is_none();
        node.entity = entity;
        true
    }

    /// Evict answered entries from the front until there is room for one more.
    fn shrink(&mut self) {
        while self.nodes.len() >= self.capacity
            && self.nodes.front().is_some_and(|node| !node.pending)
        {
            self.nodes.pop_front();
        }
    }
}

/// The three caches a monitor resolves against.
#[derive(Debug)]
pub struct Caches {
    pub collections: EntityCache<CollectionRecord>,
    pub items: EntityCache<ItemRecord>,
    pub tags: EntityCache<TagRecord>,
}

impl Caches {
    /// Caches sized for a pipeline of `pipeline_size` notifications.
    #[must_use]
    pub fn new(pipeline_size: usize, requests: &UnboundedSender<FetchRequest>) -> Self {
        Self {
            collections: EntityCache::new(
                EntityKind::Collection,
                3 * pipeline_size,
                requests.clone(),
            ),
            items: EntityCache::new(EntityKind::Item, pipeline_size, requests.clone()),
            tags: EntityCache::new(EntityKind::Tag, pipeline_size, requests.clone()),
        }
    }

    /// Route a fetch answer to its cache.
    pub fn complete(&mut self, result: FetchResult) -> bool {
        match result {
            FetchResult::Item(id, record) => self.items.complete(id, record),
            FetchResult::Collection(id, record) => self.collections.complete(id, record),
            FetchResult::Tag(id, record) => self.tags.complete(id, record),
        }
    }
}
