use std::path::Path;

use pimsync_core::journal::inspect_journal;
use pimsync_core::{ChangeRecorder, MonitorFilter, MonitorOptions, SettingsStore};
use tracing::info;

use crate::error::CliError;

/// Bind a recorder to `settings` and unbind it again, which imports any
/// legacy change list and rewrites the journal in full. Returns how many
/// notifications remain pending.
///
/// A journal this build cannot read is left alone.
pub fn compact(settings: &Path) -> Result<usize, CliError> {
    let store = SettingsStore::open(settings)?;
    let options = MonitorOptions {
        change_recording: true,
        ..store.monitor_options()?
    };
    let journal = store.journal_path();
    if journal.exists() {
        inspect_journal(&journal)?;
    }

    let (mut recorder, _requests) = ChangeRecorder::new(MonitorFilter::all(), options);
    recorder.set_config(Some(store));
    let pending = recorder.pending_count();
    recorder.set_config(None);

    info!("Rewrote {} with {} pending notifications", journal.display(), pending);
    Ok(pending)
}

pub fn run_compact(settings: &Path) -> Result<(), CliError> {
    let pending = compact(settings)?;
    println!("Compacted journal: {pending} pending notifications");
    Ok(())
}
