//! FIFO of notifications waiting for delivery

use std::collections::VecDeque;
use std::sync::Arc;

use crate::models::Notification;

/// Ordered queue of pending notifications. Entries are never merged or
/// reordered.
#[derive(Debug, Clone, Default)]
pub struct NotificationQueue {
    entries: VecDeque<Arc<Notification>>,
}

impl NotificationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn front(&self) -> Option<&Arc<Notification>> {
        self.entries.front()
    }

    pub fn push_back(&mut self, ntf: Arc<Notification>) {
        self.entries.push_back(ntf);
    }

    pub fn push_front(&mut self, ntf: Arc<Notification>) {
        self.entries.push_front(ntf);
    }

    pub fn pop_front(&mut self) -> Option<Arc<Notification>> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &Notification> {
        self.entries.iter().map(|ntf| &**ntf)
    }

    /// Drop entries past the first `skip` for which `keep` returns false.
    /// Returns how many were dropped.
    pub fn retain_after(
        &mut self,
        skip: usize,
        mut keep: impl FnMut(&Notification) -> bool,
    ) -> usize {
        let before = self.entries.len();
        let mut index = 0;
        self.entries.retain(|ntf| {
            let protected = index < skip;
            index += 1;
            protected || keep(ntf)
        });
        before - self.entries.len()
    }
}

impl Extend<Notification> for NotificationQueue {
    fn extend<T: IntoIterator<Item = Notification>>(&mut self, iter: T) {
        self.entries.extend(iter.into_iter().map(Arc::new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TagOperation, TagRecord};

    fn tag(id: i64) -> Notification {
        Notification::tag(TagOperation::Add, TagRecord::stub(id, Vec::new()))
    }

    fn ids(queue: &NotificationQueue) -> Vec<i64> {
        queue.iter().flat_map(Notification::entity_ids).collect()
    }

    #[test]
    fn test_fifo_keeps_duplicates() {
        let mut queue = NotificationQueue::new();
        queue.extend([tag(1), tag(1), tag(2)]);
        assert_eq!(ids(&queue), vec![1, 1, 2]);
        assert_eq!(queue.pop_front().unwrap().entity_ids(), vec![1]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_retain_after_protects_head() {
        let mut queue = NotificationQueue::new();
        queue.extend([tag(1), tag(2), tag(3), tag(4)]);
        let removed = queue.retain_after(1, |ntf| ntf.entity_ids()[0] % 2 == 0);
        assert_eq!(removed, 1);
        assert_eq!(ids(&queue), vec![1, 2, 4]);

        let removed = queue.retain_after(0, |_| false);
        assert_eq!(removed, 3);
        assert!(queue.is_empty());
    }
}
