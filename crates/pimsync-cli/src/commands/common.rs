use std::path::{Path, PathBuf};

use pimsync_core::journal::journal_path_for;

use crate::error::CliError;

/// Journal belonging to `settings`, which must exist.
pub fn existing_journal(settings: &Path) -> Result<PathBuf, CliError> {
    let path = journal_path_for(settings);
    if path.exists() {
        Ok(path)
    } else {
        Err(CliError::JournalNotFound(path))
    }
}

pub fn render_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
