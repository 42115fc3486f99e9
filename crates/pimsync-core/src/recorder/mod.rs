//! Durable, pull-based replay of recorded changes
//!
//! A [`ChangeRecorder`] records accepted notifications to a journal next to
//! its settings file and replays them one at a time: `replay_next` offers the
//! head of the queue, `change_processed` acknowledges it. At most one
//! notification is in flight, either waiting for its data or delivered and
//! waiting for acknowledgment.
//!
//! Every mutation of the queue is persisted before the call returns. Appends
//! rewrite the journal; acknowledgments normally only advance the start offset
//! stored in its header.

mod driver;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

pub use driver::{run_recorder, spawn_recorder, RecorderCommand, RecorderHandle};

use crate::cache::{FetchRequest, FetchResult};
use crate::config::{MonitorOptions, SettingsStore, LEGACY_CHANGES_KEY};
use crate::error::{Error, Result};
use crate::journal::{read_journal, JournalStore};
use crate::models::Notification;
use crate::monitor::{
    Emitted, Interest, Monitor, MonitorFilter, RecorderEvent, PIPELINE_SIZE,
};

/// Where the head of the queue is in its replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// Nothing in flight
    Idle,
    /// The head is waiting for fetched data
    AwaitingResolution,
    /// The head was delivered and awaits `change_processed`
    Delivered,
}

/// The recorder's single pipeline slot.
#[derive(Debug)]
enum Slot {
    Idle,
    Resolving(Arc<Notification>),
    Delivered,
}

/// Journal-backed notification queue with one-at-a-time replay.
#[derive(Debug)]
pub struct ChangeRecorder {
    monitor: Monitor,
    settings: Option<SettingsStore>,
    store: Option<JournalStore>,
    recording: bool,
    needs_full_save: bool,
    expected_pending: usize,
    slot: Slot,
    replay_scheduled: bool,
}

impl ChangeRecorder {
    /// Create an unbound recorder and the channel its fetch requests arrive on.
    #[must_use]
    pub fn new(
        filter: MonitorFilter,
        options: MonitorOptions,
    ) -> (Self, UnboundedReceiver<FetchRequest>) {
        let recording = options.change_recording;
        let (mut monitor, requests) = Monitor::new(filter, options);
        if recording {
            monitor.set_pipeline_capacity(0);
        }
        let recorder = Self {
            monitor,
            settings: None,
            store: None,
            recording,
            needs_full_save: false,
            expected_pending: 0,
            slot: Slot::Idle,
            replay_scheduled: false,
        };
        (recorder, requests)
    }

    pub fn subscribe(&mut self, interest: Interest) -> UnboundedReceiver<RecorderEvent> {
        self.monitor.subscribe(interest)
    }

    #[must_use]
    pub const fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn filter_mut(&mut self) -> &mut MonitorFilter {
        self.monitor.filter_mut()
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether no notification is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monitor.pending_len() == 0
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.monitor.pending_len()
    }

    #[must_use]
    pub const fn state(&self) -> ReplayState {
        match self.slot {
            Slot::Idle => ReplayState::Idle,
            Slot::Resolving(_) => ReplayState::AwaitingResolution,
            Slot::Delivered => ReplayState::Delivered,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> Option<&SettingsStore> {
        self.settings.as_ref()
    }

    #[must_use]
    pub fn journal_path(&self) -> Option<&Path> {
        self.store.as_ref().map(JournalStore::path)
    }

    /// Bind to a settings file and load its journal, or unbind with `None`.
    ///
    /// The queue must be empty when binding. Unbinding while recording saves
    /// the queue in full first, then empties it.
    pub fn set_config(&mut self, settings: Option<SettingsStore>) {
        let Some(mut settings) = settings else {
            if self.recording && self.store.is_some() {
                self.save_notifications();
            }
            self.store = None;
            self.settings = None;
            self.monitor.pending_mut().clear();
            self.monitor.clear_pipeline();
            self.slot = Slot::Idle;
            self.expected_pending = 0;
            self.needs_full_save = false;
            return;
        };

        let bindable = self.store.is_none() && self.is_empty();
        debug_assert!(bindable, "set_config called on a non-empty recorder");
        if !bindable {
            warn!(
                "Refusing to bind {}: recorder already holds notifications",
                settings.path().display()
            );
            return;
        }

        let mut store = JournalStore::for_settings(settings.path());
        if !store.exists() {
            migrate_legacy_changes(&mut settings, &mut store);
        }

        let loaded = store.load();
        self.needs_full_save = loaded.needs_full_save;
        self.monitor.pending_mut().extend(loaded.notifications);
        self.store = Some(store);
        self.settings = Some(settings);
        self.notifications_loaded();

        if !self.recording {
            self.monitor.dispatch();
        }
    }

    /// Accept one notification from the change source.
    pub fn notify(&mut self, ntf: Notification) {
        self.notify_all([ntf]);
    }

    /// Accept a batch of notifications that arrived together.
    ///
    /// The journal is rewritten once per batch.
    pub fn notify_all(&mut self, batch: impl IntoIterator<Item = Notification>) {
        let before = self.monitor.pending_len();
        let appended = self.monitor.enqueue_batch(batch);
        if appended > 0 {
            self.notifications_enqueued(appended);
        }
        if !self.recording {
            self.monitor.dispatch();
        }
        if self.monitor.pending_len() != before {
            self.monitor.broadcast(&RecorderEvent::ChangesAdded);
        }
    }

    /// Offer the head of the queue.
    ///
    /// Emits `NotificationReady` now or once its data has been fetched, or
    /// `NothingToReplay` if the queue holds nothing deliverable. Heads that
    /// cannot be delivered are dropped on the way. Does nothing while a
    /// notification is in flight or recording is off.
    pub fn replay_next(&mut self) {
        if !self.recording {
            return;
        }
        if !matches!(self.slot, Slot::Idle) {
            debug!("replay_next ignored: a notification is already in flight");
            return;
        }

        loop {
            let Some(head) = self.monitor.pending().front().cloned() else {
                debug!("Nothing to replay");
                self.monitor.broadcast(&RecorderEvent::NothingToReplay);
                return;
            };

            let Some(ntf) = self.monitor.filter().translate_move(&head) else {
                debug!("Skipping {}: neither end of the move is watched", head);
                self.dequeue_notification();
                continue;
            };

            if !self.monitor.ensure_data_available(&ntf) {
                debug!("Waiting for data of {}", ntf);
                self.slot = Slot::Resolving(ntf);
                return;
            }
            if self.emit_head(&ntf) != Emitted::Unresolvable {
                return;
            }
        }
    }

    /// Acknowledge the delivered head.
    pub fn change_processed(&mut self) {
        if !self.recording {
            return;
        }
        if matches!(self.slot, Slot::Resolving(_)) {
            warn!("change_processed called while the head is still being resolved");
            return;
        }
        debug_assert!(!self.is_empty(), "change_processed on an empty queue");
        if self.is_empty() {
            warn!("change_processed called with no pending notification");
            return;
        }
        self.slot = Slot::Idle;
        self.dequeue_notification();
    }

    /// Store a fetch answer and deliver whatever it completes.
    pub fn fetch_completed(&mut self, result: FetchResult) {
        self.monitor.complete_fetch(result);

        let protect_head = !matches!(self.slot, Slot::Idle);
        if self.monitor.data_available(protect_head) > 0 {
            self.notifications_erased();
        }

        let Slot::Resolving(ntf) = &self.slot else {
            return;
        };
        let ntf = Arc::clone(ntf);
        if !self.monitor.ensure_data_available(&ntf) {
            return;
        }
        if self.emit_head(&ntf) == Emitted::Unresolvable {
            self.replay_next();
        }
    }

    /// Switch between recorded replay and live delivery.
    ///
    /// Switching on pulls whatever the live pipeline still holds back to the
    /// front of the queue and rewrites the journal. Switching off hands the
    /// queue to the live pipeline; a head still waiting for data finishes
    /// resolving there.
    pub fn set_change_recording_enabled(&mut self, enable: bool) {
        if self.recording == enable {
            return;
        }
        self.recording = enable;

        if enable {
            self.monitor.set_pipeline_capacity(0);
            let recalled = self.monitor.recall_pipeline();
            if recalled > 0 {
                debug!("Recalled {} in-flight notifications into the queue", recalled);
            }
            self.notifications_loaded();
            self.needs_full_save = true;
            self.save_notifications();
            return;
        }

        self.monitor.set_pipeline_capacity(PIPELINE_SIZE);
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Resolving(ntf) => {
                self.monitor.pending_mut().pop_front();
                self.monitor.push_pipeline(ntf);
            }
            Slot::Delivered => {
                self.monitor.pending_mut().pop_front();
            }
            Slot::Idle => {}
        }
        self.monitor.dispatch();
    }

    /// Whether an automatic follow-up replay is waiting to run.
    #[must_use]
    pub const fn has_deferred_work(&self) -> bool {
        self.replay_scheduled
    }

    /// Run follow-up replays scheduled by auto-acknowledged deliveries.
    ///
    /// Each round may schedule the next; they run in this loop rather than by
    /// recursion. Returns how many replays ran.
    pub fn process_deferred(&mut self) -> usize {
        let mut replays = 0;
        while std::mem::take(&mut self.replay_scheduled) {
            replays += 1;
            self.replay_next();
        }
        replays
    }

    /// Render the journal file one notification per line.
    ///
    /// The file is read independently of the in-memory queue.
    pub fn dump_notifications(&self) -> Result<String> {
        let path = self
            .journal_path()
            .ok_or_else(|| Error::InvalidInput("recorder is not bound to a journal".to_string()))?;
        Ok(format_notifications(&read_journal(path)?))
    }

    fn emit_head(&mut self, ntf: &Arc<Notification>) -> Emitted {
        let outcome = self.monitor.emit(ntf);
        match outcome {
            Emitted::Heard => self.slot = Slot::Delivered,
            Emitted::Unheard => {
                debug!("Nobody listened for {}, acknowledging it", ntf);
                self.slot = Slot::Idle;
                self.dequeue_notification();
                if self.monitor.clean_old(false) > 0 {
                    self.notifications_erased();
                }
                self.replay_scheduled = true;
            }
            Emitted::Unresolvable => {
                self.slot = Slot::Idle;
                self.dequeue_notification();
            }
        }
        outcome
    }

    fn notifications_loaded(&mut self) {
        self.expected_pending = self.monitor.pending_len();
    }

    fn notifications_enqueued(&mut self, count: usize) {
        if !self.recording {
            return;
        }
        self.expected_pending += count;
        self.check_pending_count(count);
        self.save_notifications();
    }

    fn notifications_erased(&mut self) {
        if !self.recording {
            return;
        }
        self.expected_pending = self.monitor.pending_len();
        self.needs_full_save = true;
        self.save_notifications();
    }

    fn check_pending_count(&mut self, change: usize) {
        let actual = self.monitor.pending_len();
        if actual != self.expected_pending {
            warn!(
                "Pending notification count changed behind the recorder: expected {}, found {} (last change {})",
                self.expected_pending, actual, change
            );
            debug_assert_eq!(actual, self.expected_pending);
            self.expected_pending = actual;
        }
    }

    fn dequeue_notification(&mut self) {
        if self.monitor.pending_mut().pop_front().is_none() || !self.recording {
            return;
        }
        self.expected_pending = self.expected_pending.saturating_sub(1);
        self.check_pending_count(1);

        if self.needs_full_save || self.is_empty() {
            self.save_notifications();
            return;
        }
        let Some(store) = self.store.as_mut() else {
            return;
        };
        if let Err(err) = store.advance_start_offset() {
            warn!(
                "Failed to advance start offset of {}: {}",
                store.path().display(),
                err
            );
            self.needs_full_save = true;
        }
    }

    fn save_notifications(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        match store.save(self.monitor.pending().iter()) {
            Ok(()) => self.needs_full_save = false,
            Err(err) => {
                warn!(
                    "Failed to save notifications to {}: {}",
                    store.path().display(),
                    err
                );
                self.needs_full_save = true;
            }
        }
    }
}

/// Import the change list older agents kept inside the settings file.
fn migrate_legacy_changes(settings: &mut SettingsStore, store: &mut JournalStore) {
    let legacy = match settings.legacy_changes() {
        Ok(legacy) => legacy,
        Err(err) => {
            warn!(
                "Ignoring unreadable {} list in {}: {}",
                LEGACY_CHANGES_KEY,
                settings.path().display(),
                err
            );
            Vec::new()
        }
    };

    if let Err(err) = store.save(&legacy) {
        warn!("Failed to create journal {}: {}", store.path().display(), err);
        return;
    }
    if !legacy.is_empty() {
        info!(
            "Migrated {} legacy changes from {} to {}",
            legacy.len(),
            settings.path().display(),
            store.path().display()
        );
    }
    if let Err(err) = settings.clear_legacy_changes() {
        warn!(
            "Failed to remove legacy changes from {}: {}",
            settings.path().display(),
            err
        );
    }
}

/// One line per notification, numbered from zero.
#[must_use]
pub fn format_notifications(notifications: &[Notification]) -> String {
    notifications
        .iter()
        .enumerate()
        .map(|(index, ntf)| format!("{index}: {ntf}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::cache::EntityKind;
    use crate::models::{ItemOperation, ItemRecord, NotificationKind, FETCH_ITEM};

    fn item(id: i64) -> Notification {
        Notification::items(ItemOperation::Add, vec![ItemRecord::stub(id, "", "text/plain")])
            .with_parent(1)
    }

    fn bound_recorder(
        dir: &Path,
    ) -> (
        ChangeRecorder,
        UnboundedReceiver<FetchRequest>,
        UnboundedReceiver<RecorderEvent>,
    ) {
        let (mut recorder, requests) =
            ChangeRecorder::new(MonitorFilter::all(), MonitorOptions::default());
        let events = recorder.subscribe(Interest::all());
        recorder.set_config(Some(SettingsStore::open(dir.join("agentrc")).unwrap()));
        (recorder, requests, events)
    }

    fn next_delivery(events: &mut UnboundedReceiver<RecorderEvent>) -> Vec<i64> {
        loop {
            match events.try_recv().unwrap() {
                RecorderEvent::ChangesAdded => continue,
                RecorderEvent::NotificationReady(delivery) => return delivery.item_ids(),
                RecorderEvent::NothingToReplay => panic!("unexpected NothingToReplay"),
            }
        }
    }

    #[test]
    fn test_binding_creates_journal() {
        let dir = tempdir().unwrap();
        let (recorder, _requests, _events) = bound_recorder(dir.path());
        assert!(recorder.journal_path().unwrap().exists());
        assert!(recorder.is_empty());
        assert_eq!(recorder.state(), ReplayState::Idle);
    }

    #[test]
    fn test_enqueue_emits_changes_added_and_persists() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests, mut events) = bound_recorder(dir.path());
        recorder.notify_all([item(1), item(2)]);

        assert_eq!(events.try_recv().unwrap(), RecorderEvent::ChangesAdded);
        assert!(events.try_recv().is_err());
        let on_disk = read_journal(recorder.journal_path().unwrap()).unwrap();
        assert_eq!(on_disk, vec![item(1), item(2)]);
    }

    #[test]
    fn test_replay_is_one_at_a_time() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests, mut events) = bound_recorder(dir.path());
        recorder.notify_all([item(1), item(2)]);

        recorder.replay_next();
        assert_eq!(next_delivery(&mut events), vec![1]);
        assert_eq!(recorder.state(), ReplayState::Delivered);

        recorder.replay_next();
        assert!(events.try_recv().is_err());

        recorder.change_processed();
        assert_eq!(recorder.state(), ReplayState::Idle);
        recorder.replay_next();
        assert_eq!(next_delivery(&mut events), vec![2]);
    }

    #[test]
    fn test_head_waits_for_fetch() {
        let dir = tempdir().unwrap();
        let (mut recorder, mut requests, mut events) = bound_recorder(dir.path());
        recorder.notify(item(5).with_marker(FETCH_ITEM));
        recorder.notify(item(6));
        events.try_recv().unwrap();
        events.try_recv().unwrap();

        recorder.replay_next();
        assert_eq!(recorder.state(), ReplayState::AwaitingResolution);
        let request = requests.try_recv().unwrap();
        assert_eq!((request.kind, request.id), (EntityKind::Item, 5));
        assert_eq!(recorder.pending_count(), 2);

        recorder.fetch_completed(FetchResult::Item(5, Some(ItemRecord::stub(5, "r5", ""))));
        assert_eq!(recorder.state(), ReplayState::Delivered);
        assert_eq!(next_delivery(&mut events), vec![5]);
    }

    #[test]
    fn test_vanished_head_is_skipped_after_fetch() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests, mut events) = bound_recorder(dir.path());
        recorder.notify_all([item(5).with_marker(FETCH_ITEM), item(6)]);
        events.try_recv().unwrap();

        recorder.replay_next();
        recorder.fetch_completed(FetchResult::Item(5, None));
        assert_eq!(next_delivery(&mut events), vec![6]);
        assert_eq!(recorder.pending_count(), 1);
    }

    #[test]
    fn test_unheard_head_is_auto_acknowledged() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests) =
            ChangeRecorder::new(MonitorFilter::all(), MonitorOptions::default());
        let items = recorder.subscribe(Interest::only([NotificationKind::Items]));
        let mut others = recorder.subscribe(Interest::only([NotificationKind::Tags]));
        recorder.set_config(Some(SettingsStore::open(dir.path().join("agentrc")).unwrap()));
        recorder.notify_all([item(1), item(2), item(3)]);
        drop(items);
        assert_eq!(others.try_recv().unwrap(), RecorderEvent::ChangesAdded);

        recorder.replay_next();
        assert!(recorder.has_deferred_work());
        assert!(recorder.is_empty());
        assert_eq!(recorder.process_deferred(), 1);
        assert_eq!(others.try_recv().unwrap(), RecorderEvent::NothingToReplay);
        assert!(read_journal(recorder.journal_path().unwrap())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_disabled_recording_ignores_replay() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests, mut events) = bound_recorder(dir.path());
        recorder.set_change_recording_enabled(false);
        recorder.replay_next();
        assert!(events.try_recv().is_err());

        recorder.notify(item(1));
        assert_eq!(next_delivery(&mut events), vec![1]);
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_disabling_hands_queue_to_live_pipeline() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests, mut events) = bound_recorder(dir.path());
        recorder.notify_all([item(1), item(2)]);
        events.try_recv().unwrap();

        recorder.set_change_recording_enabled(false);
        assert_eq!(next_delivery(&mut events), vec![1]);
        assert_eq!(next_delivery(&mut events), vec![2]);
        assert!(recorder.is_empty());
        assert_eq!(recorder.monitor().pipeline_capacity(), PIPELINE_SIZE);
    }

    #[test]
    fn test_enabling_recalls_live_pipeline() {
        let dir = tempdir().unwrap();
        let (mut recorder, mut requests, mut events) = bound_recorder(dir.path());
        recorder.set_change_recording_enabled(false);
        recorder.notify(item(1).with_marker(FETCH_ITEM));
        assert_eq!(recorder.monitor().pipeline_len(), 1);
        assert_eq!(requests.try_recv().unwrap().id, 1);

        recorder.set_change_recording_enabled(true);
        assert_eq!(recorder.monitor().pipeline_len(), 0);
        assert_eq!(recorder.pending_count(), 1);
        let on_disk = read_journal(recorder.journal_path().unwrap()).unwrap();
        assert_eq!(on_disk, vec![item(1).with_marker(FETCH_ITEM)]);

        recorder.notify(item(2));
        recorder.fetch_completed(FetchResult::Item(1, Some(ItemRecord::stub(1, "r1", ""))));
        while let Ok(event) = events.try_recv() {
            assert_eq!(event, RecorderEvent::ChangesAdded);
        }

        recorder.replay_next();
        assert_eq!(next_delivery(&mut events), vec![1]);
        assert!(events.try_recv().is_err());
        recorder.change_processed();
        recorder.replay_next();
        assert_eq!(next_delivery(&mut events), vec![2]);
    }

    #[test]
    fn test_unbind_saves_and_rebind_reloads() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests, _events) = bound_recorder(dir.path());
        recorder.notify_all([item(1), item(2), item(3)]);
        recorder.replay_next();
        recorder.change_processed();

        recorder.set_config(None);
        assert!(recorder.is_empty());
        assert!(recorder.journal_path().is_none());

        recorder.set_config(Some(SettingsStore::open(dir.path().join("agentrc")).unwrap()));
        assert_eq!(recorder.pending_count(), 2);
        let dump = recorder.dump_notifications().unwrap();
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.starts_with("0: items Add [2]"));
    }

    #[test]
    fn test_dump_requires_binding() {
        let (recorder, _requests) =
            ChangeRecorder::new(MonitorFilter::all(), MonitorOptions::default());
        assert!(matches!(
            recorder.dump_notifications(),
            Err(Error::InvalidInput(_))
        ));
    }
}
