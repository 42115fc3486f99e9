//! Serving a recorder from a tokio task
//!
//! The recorder itself is synchronous. [`spawn_recorder`] moves it into a
//! task that applies commands in arrival order and runs deferred replays
//! between commands, so nothing recurses on the caller's stack.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ChangeRecorder, ReplayState};
use crate::cache::FetchResult;
use crate::error::{Error, Result};
use crate::models::Notification;
use crate::monitor::{Interest, RecorderEvent};

/// Work for the recorder task.
#[derive(Debug)]
pub enum RecorderCommand {
    Notify(Vec<Notification>),
    ReplayNext,
    ChangeProcessed,
    FetchCompleted(FetchResult),
    SetChangeRecording(bool),
    Subscribe(Interest, oneshot::Sender<UnboundedReceiver<RecorderEvent>>),
    PendingCount(oneshot::Sender<usize>),
    State(oneshot::Sender<ReplayState>),
}

/// Cloneable front end of a spawned recorder.
#[derive(Debug, Clone)]
pub struct RecorderHandle {
    commands: UnboundedSender<RecorderCommand>,
}

impl RecorderHandle {
    fn send(&self, command: RecorderCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::RecorderStopped)
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.send(command(reply))?;
        answer.await.map_err(|_| Error::RecorderStopped)
    }

    pub fn notify(&self, batch: Vec<Notification>) -> Result<()> {
        self.send(RecorderCommand::Notify(batch))
    }

    pub fn replay_next(&self) -> Result<()> {
        self.send(RecorderCommand::ReplayNext)
    }

    pub fn change_processed(&self) -> Result<()> {
        self.send(RecorderCommand::ChangeProcessed)
    }

    pub fn fetch_completed(&self, result: FetchResult) -> Result<()> {
        self.send(RecorderCommand::FetchCompleted(result))
    }

    pub fn set_change_recording_enabled(&self, enable: bool) -> Result<()> {
        self.send(RecorderCommand::SetChangeRecording(enable))
    }

    pub async fn subscribe(&self, interest: Interest) -> Result<UnboundedReceiver<RecorderEvent>> {
        self.ask(|reply| RecorderCommand::Subscribe(interest, reply))
            .await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.ask(RecorderCommand::PendingCount).await
    }

    pub async fn state(&self) -> Result<ReplayState> {
        self.ask(RecorderCommand::State).await
    }
}

/// Move `recorder` into a new task.
///
/// The task ends once every handle is dropped and hands the recorder back
/// through its join handle.
#[must_use]
pub fn spawn_recorder(recorder: ChangeRecorder) -> (RecorderHandle, JoinHandle<ChangeRecorder>) {
    let (commands, receiver) = unbounded_channel();
    let task = tokio::spawn(run_recorder(recorder, receiver));
    (RecorderHandle { commands }, task)
}

/// Apply commands until the channel closes.
pub async fn run_recorder(
    mut recorder: ChangeRecorder,
    mut commands: UnboundedReceiver<RecorderCommand>,
) -> ChangeRecorder {
    while let Some(command) = commands.recv().await {
        apply(&mut recorder, command);
        let replays = recorder.process_deferred();
        if replays > 0 {
            debug!("Ran {} deferred replays", replays);
        }
    }
    debug!("Recorder command channel closed");
    recorder
}

fn apply(recorder: &mut ChangeRecorder, command: RecorderCommand) {
    match command {
        RecorderCommand::Notify(batch) => recorder.notify_all(batch),
        RecorderCommand::ReplayNext => recorder.replay_next(),
        RecorderCommand::ChangeProcessed => recorder.change_processed(),
        RecorderCommand::FetchCompleted(result) => recorder.fetch_completed(result),
        RecorderCommand::SetChangeRecording(enable) => {
            recorder.set_change_recording_enabled(enable);
        }
        RecorderCommand::Subscribe(interest, reply) => {
            // The caller may have given up waiting
            let _ = reply.send(recorder.subscribe(interest));
        }
        RecorderCommand::PendingCount(reply) => {
            let _ = reply.send(recorder.pending_count());
        }
        RecorderCommand::State(reply) => {
            let _ = reply.send(recorder.state());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::config::{MonitorOptions, SettingsStore};
    use crate::models::{ItemOperation, ItemRecord, NotificationKind};
    use crate::monitor::MonitorFilter;

    fn item(id: i64) -> Notification {
        Notification::items(ItemOperation::Add, vec![ItemRecord::stub(id, "", "text/plain")])
    }

    #[tokio::test]
    async fn test_replay_through_handle() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests) =
            ChangeRecorder::new(MonitorFilter::all(), MonitorOptions::default());
        recorder.set_config(Some(SettingsStore::open(dir.path().join("agentrc")).unwrap()));
        let (handle, task) = spawn_recorder(recorder);

        let mut events = handle.subscribe(Interest::all()).await.unwrap();
        handle.notify(vec![item(1), item(2)]).unwrap();
        assert_eq!(events.recv().await.unwrap(), RecorderEvent::ChangesAdded);

        handle.replay_next().unwrap();
        let Some(RecorderEvent::NotificationReady(delivery)) = events.recv().await else {
            panic!("expected a delivery");
        };
        assert_eq!(delivery.item_ids(), vec![1]);
        assert_eq!(handle.state().await.unwrap(), ReplayState::Delivered);

        handle.change_processed().unwrap();
        assert_eq!(handle.pending_count().await.unwrap(), 1);

        drop(handle);
        let recorder = task.await.unwrap();
        assert_eq!(recorder.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_deferred_replay_runs_between_commands() {
        let dir = tempdir().unwrap();
        let (mut recorder, _requests) =
            ChangeRecorder::new(MonitorFilter::all(), MonitorOptions::default());
        let items = recorder.subscribe(Interest::only([NotificationKind::Items]));
        let mut tags = recorder.subscribe(Interest::only([NotificationKind::Tags]));
        recorder.set_config(Some(SettingsStore::open(dir.path().join("agentrc")).unwrap()));
        recorder.notify_all([item(1), item(2)]);
        drop(items);
        let (handle, _task) = spawn_recorder(recorder);

        handle.replay_next().unwrap();
        assert_eq!(tags.recv().await.unwrap(), RecorderEvent::ChangesAdded);
        assert_eq!(tags.recv().await.unwrap(), RecorderEvent::NothingToReplay);
        assert_eq!(handle.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stopped_recorder_reports_error() {
        let (commands, receiver) = unbounded_channel();
        let handle = RecorderHandle { commands };
        drop(receiver);

        assert!(matches!(handle.replay_next(), Err(Error::RecorderStopped)));
        assert!(matches!(
            handle.pending_count().await,
            Err(Error::RecorderStopped)
        ));
    }
}
